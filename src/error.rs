//! Error types for the synchronization engine
//!
//! This module defines the error taxonomy shared by the fetcher, the
//! stream sessions and the packs downloader. Only shutdown and malformed
//! input are surfaced as errors; liveness problems are handled by the
//! retry logic of each component.

use std::fmt;

/// Comprehensive error type for sync operations
#[derive(Debug, Clone)]
pub enum SyncError {
    /// The component was stopped; callers should stop submitting work
    Terminated {
        component: String,
    },

    /// A bounded queue is full (local backpressure, never reported to peers)
    QueueFull {
        queue: String,
    },

    /// A peer sent something malformed or invalid; ban-worthy
    PeerMisbehaviour {
        message: String,
        peer: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Transport errors (local send failures)
    TransportError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl SyncError {
    /// Create a new Terminated error
    pub fn terminated(component: impl Into<String>) -> Self {
        SyncError::Terminated {
            component: component.into(),
        }
    }

    /// Create a new QueueFull error
    pub fn queue_full(queue: impl Into<String>) -> Self {
        SyncError::QueueFull {
            queue: queue.into(),
        }
    }

    /// Create a new PeerMisbehaviour error
    pub fn misbehaviour(message: impl Into<String>) -> Self {
        SyncError::PeerMisbehaviour {
            message: message.into(),
            peer: None,
        }
    }

    /// Create a new PeerMisbehaviour error attributed to a peer
    pub fn misbehaviour_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        SyncError::PeerMisbehaviour {
            message: message.into(),
            peer: Some(peer.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        SyncError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new TransportError
    pub fn transport_error(message: impl Into<String>) -> Self {
        SyncError::TransportError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new TransportError with peer and source
    pub fn transport_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        SyncError::TransportError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        SyncError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Whether the offending peer should be disconnected
    pub fn is_ban(&self) -> bool {
        matches!(self, SyncError::PeerMisbehaviour { .. })
    }

    /// Whether the error is local backpressure
    pub fn is_backpressure(&self) -> bool {
        matches!(self, SyncError::QueueFull { .. })
    }

    /// Whether the error reports a stopped component
    pub fn is_terminated(&self) -> bool {
        matches!(self, SyncError::Terminated { .. })
    }

    /// Attach the offending peer to a misbehaviour or transport error
    pub fn with_peer(mut self, who: impl Into<String>) -> Self {
        match &mut self {
            SyncError::PeerMisbehaviour { peer, .. } | SyncError::TransportError { peer, .. } => {
                *peer = Some(who.into());
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Terminated { component } => write!(f, "{} terminated", component),
            SyncError::QueueFull { queue } => write!(f, "Queue full: {}", queue),
            SyncError::PeerMisbehaviour { message, peer } => {
                if let Some(p) = peer {
                    write!(f, "Peer misbehaviour: {} (peer: {})", message, p)
                } else {
                    write!(f, "Peer misbehaviour: {}", message)
                }
            }
            SyncError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            SyncError::TransportError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Transport error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Transport error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Transport error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Transport error: {}", message),
                }
            }
            SyncError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for SyncError {}

impl<T> From<tokio::sync::mpsc::error::TrySendError<T>> for SyncError {
    fn from(err: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match err {
            tokio::sync::mpsc::error::TrySendError::Full(_) => SyncError::queue_full("channel"),
            tokio::sync::mpsc::error::TrySendError::Closed(_) => SyncError::terminated("channel"),
        }
    }
}
