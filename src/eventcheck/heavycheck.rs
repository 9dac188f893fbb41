//! Heavy check worker pool
//!
//! Runs a [`Validator`] over submitted batches on blocking worker threads.
//! Submission never waits: a full queue is reported as `QueueFull`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{CheckError, HeavyCheck, OnValidated};
use crate::error::SyncError;
use crate::types::Event;

/// CPU-expensive per-event validation
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, event: &Event) -> Result<(), CheckError>;
}

/// Recomputes the content hash of each event
#[derive(Debug, Clone, Default)]
pub struct HashValidator;

impl Validator for HashValidator {
    fn validate(&self, event: &Event) -> Result<(), CheckError> {
        if event.id_matches() {
            Ok(())
        } else {
            Err(CheckError::InvalidId)
        }
    }
}

/// Heavy check pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeavyCheckConfig {
    /// Number of worker threads
    pub threads: usize,
    /// Capacity of the batch queue
    pub max_queued_tasks: usize,
}

impl Default for HeavyCheckConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            max_queued_tasks: 1024,
        }
    }
}

impl HeavyCheckConfig {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threads == 0 {
            return Err(SyncError::config_error_with_field("must be positive", "heavy_check.threads").into());
        }
        if self.max_queued_tasks == 0 {
            return Err(SyncError::config_error_with_field("must be positive", "heavy_check.max_queued_tasks").into());
        }
        Ok(())
    }
}

struct CheckTask {
    events: Vec<Event>,
    on_validated: OnValidated,
}

/// Worker pool running a [`Validator`]
pub struct Checker<V: Validator> {
    cfg: HeavyCheckConfig,
    validator: Arc<V>,
    tasks: Mutex<Option<mpsc::Sender<CheckTask>>>,
    receiver: Mutex<Option<mpsc::Receiver<CheckTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
    terminated: Arc<AtomicBool>,
}

impl<V: Validator> Checker<V> {
    /// Create a new checker; batches queue up until [`Checker::start`]
    pub fn new(cfg: HeavyCheckConfig, validator: Arc<V>) -> Self {
        let (tx, rx) = mpsc::channel(cfg.max_queued_tasks.max(1));
        Self {
            cfg,
            validator,
            tasks: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            workers: Mutex::new(Vec::new()),
            queued: Arc::new(AtomicUsize::new(0)),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the worker threads
    pub fn start(&self) {
        let rx = match self.receiver.lock().take() {
            Some(rx) => Arc::new(Mutex::new(rx)),
            None => {
                warn!("Heavy check is already running");
                return;
            }
        };

        info!("Starting heavy check with {} workers", self.cfg.threads);
        let mut workers = self.workers.lock();
        for worker_id in 0..self.cfg.threads.max(1) {
            let rx = rx.clone();
            let validator = self.validator.clone();
            let queued = self.queued.clone();
            let terminated = self.terminated.clone();
            workers.push(tokio::task::spawn_blocking(move || {
                loop {
                    let task = rx.lock().blocking_recv();
                    let task = match task {
                        Some(task) => task,
                        None => break,
                    };
                    queued.fetch_sub(1, Ordering::SeqCst);
                    if terminated.load(Ordering::SeqCst) {
                        continue;
                    }
                    let results: Vec<_> = task.events.iter().map(|e| validator.validate(e)).collect();
                    trace!("Heavy check worker {}: validated {} events", worker_id, results.len());
                    (task.on_validated)(task.events, results);
                }
                debug!("Heavy check worker {} stopped", worker_id);
            }));
        }
    }

    /// Number of batches waiting for a worker
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Stop the pool; batches still queued are dropped without a callback
    pub async fn stop(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tasks.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Heavy check worker panicked: {}", e);
            }
        }
        info!("Heavy check stopped");
    }
}

impl<V: Validator> HeavyCheck for Checker<V> {
    fn enqueue(&self, events: Vec<Event>, on_validated: OnValidated) -> Result<(), SyncError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(SyncError::terminated("heavy check"));
        }
        let tasks = self.tasks.lock();
        let tx = tasks.as_ref().ok_or_else(|| SyncError::terminated("heavy check"))?;
        self.queued.fetch_add(1, Ordering::SeqCst);
        tx.try_send(CheckTask { events, on_validated }).map_err(|e| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            match e {
                TrySendError::Full(_) => SyncError::queue_full("heavy check"),
                TrySendError::Closed(_) => SyncError::terminated("heavy check"),
            }
        })
    }

    fn overloaded(&self) -> bool {
        self.queued() > self.cfg.max_queued_tasks * 3 / 4
    }
}
