//! Event validation
//!
//! Events pass a cheap synchronous [`LightCheck`] on the caller's thread
//! and an expensive [`HeavyCheck`] on a separate pool. Failures are split
//! into ban-class faults, which prove the sending peer is misbehaving, and
//! benign ones, which only mean the event is useless to us right now.

pub mod heavycheck;

use std::collections::HashSet;
use std::fmt;

use crate::error::SyncError;
use crate::types::Event;

/// Event validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// Structurally invalid event
    Malformed { reason: String },
    /// Id does not match the contents
    InvalidId,
    /// Parents are inconsistent with the event
    InvalidParents { reason: String },
    /// Signature or proof does not verify
    InvalidSignature,
    /// Event belongs to another epoch
    WrongEpoch { epoch: u32, expected: u32 },
    /// Event is already part of the local DAG
    AlreadyConnected,
}

impl CheckError {
    /// Whether the sender should be disconnected
    pub fn is_ban(&self) -> bool {
        matches!(
            self,
            CheckError::Malformed { .. }
                | CheckError::InvalidId
                | CheckError::InvalidParents { .. }
                | CheckError::InvalidSignature
        )
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::Malformed { reason } => write!(f, "malformed event: {}", reason),
            CheckError::InvalidId => write!(f, "event id does not match contents"),
            CheckError::InvalidParents { reason } => write!(f, "invalid parents: {}", reason),
            CheckError::InvalidSignature => write!(f, "invalid signature"),
            CheckError::WrongEpoch { epoch, expected } => {
                write!(f, "wrong epoch {} (expected {})", epoch, expected)
            }
            CheckError::AlreadyConnected => write!(f, "event already connected"),
        }
    }
}

impl std::error::Error for CheckError {}

impl From<CheckError> for SyncError {
    fn from(err: CheckError) -> Self {
        if err.is_ban() {
            SyncError::misbehaviour(err.to_string())
        } else {
            SyncError::validation_error(err.to_string())
        }
    }
}

/// Cheap synchronous event check
pub trait LightCheck: Send + Sync {
    fn check(&self, event: &Event) -> Result<(), CheckError>;
}

/// Completion hook of a heavy check batch: the events and one result per
/// event, in submission order
pub type OnValidated = Box<dyn FnOnce(Vec<Event>, Vec<Result<(), CheckError>>) + Send>;

/// Expensive event check running on its own pool
pub trait HeavyCheck: Send + Sync {
    /// Submit a batch; `on_validated` fires exactly once for it
    fn enqueue(&self, events: Vec<Event>, on_validated: OnValidated) -> Result<(), SyncError>;

    /// Whether the pending queue is above 75% of its capacity
    fn overloaded(&self) -> bool;
}

/// Structural checks that need nothing but the event itself
#[derive(Debug, Clone)]
pub struct BasicCheck {
    pub max_parents: usize,
    pub max_payload_size: usize,
}

impl Default for BasicCheck {
    fn default() -> Self {
        Self {
            max_parents: 10,
            max_payload_size: 64 * 1024,
        }
    }
}

impl LightCheck for BasicCheck {
    fn check(&self, event: &Event) -> Result<(), CheckError> {
        if event.id.epoch() != event.epoch || event.id.lamport() != event.lamport {
            return Err(CheckError::Malformed {
                reason: "id does not encode epoch and lamport".to_string(),
            });
        }
        if event.payload.len() > self.max_payload_size {
            return Err(CheckError::Malformed {
                reason: format!("payload of {} bytes", event.payload.len()),
            });
        }
        if event.parents.len() > self.max_parents {
            return Err(CheckError::InvalidParents {
                reason: format!("{} parents", event.parents.len()),
            });
        }

        let mut seen = HashSet::with_capacity(event.parents.len());
        for parent in &event.parents {
            if !seen.insert(parent) {
                return Err(CheckError::InvalidParents {
                    reason: format!("duplicate parent {}", parent),
                });
            }
            if parent.epoch() != event.epoch {
                return Err(CheckError::InvalidParents {
                    reason: format!("parent {} from another epoch", parent),
                });
            }
            if parent.lamport() >= event.lamport {
                return Err(CheckError::InvalidParents {
                    reason: format!("parent {} is not older", parent),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventId;

    #[test]
    fn test_ban_classification() {
        assert!(CheckError::InvalidId.is_ban());
        assert!(CheckError::InvalidSignature.is_ban());
        assert!(!CheckError::AlreadyConnected.is_ban());
        assert!(!CheckError::WrongEpoch { epoch: 1, expected: 2 }.is_ban());

        let err: SyncError = CheckError::InvalidId.into();
        assert!(err.is_ban());
        let err: SyncError = CheckError::AlreadyConnected.into();
        assert!(!err.is_ban());
    }

    #[test]
    fn test_basic_check_accepts_valid_event() {
        let root = Event::new(1, 1, vec![], vec![1]);
        let child = Event::new(1, 2, vec![root.id], vec![2]);
        assert!(BasicCheck::default().check(&root).is_ok());
        assert!(BasicCheck::default().check(&child).is_ok());
    }

    #[test]
    fn test_basic_check_rejects_bad_parents() {
        let check = BasicCheck::default();
        let parent = Event::new(1, 5, vec![], vec![]);

        let same_lamport = Event::new(1, 5, vec![parent.id], vec![]);
        assert!(matches!(check.check(&same_lamport), Err(CheckError::InvalidParents { .. })));

        let duplicate = Event::new(1, 6, vec![parent.id, parent.id], vec![]);
        assert!(check.check(&duplicate).unwrap_err().is_ban());

        let foreign = Event::new(2, 6, vec![parent.id], vec![]);
        assert!(check.check(&foreign).unwrap_err().is_ban());
    }

    #[test]
    fn test_basic_check_rejects_forged_id_layout() {
        let mut event = Event::new(1, 3, vec![], vec![]);
        event.id = EventId::new(1, 4, [0; 24]);
        assert!(matches!(BasicCheck::default().check(&event), Err(CheckError::Malformed { .. })));
    }
}
