//! Error types for the plugin bridge

use std::path::PathBuf;
use thiserror::Error;

/// Where in session startup a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Resolving,
    Spawning,
    Attaching,
    Handshake,
    Loading,
    Instantiation,
    ThreadSetup,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStage::Resolving => write!(f, "resolving module"),
            LoadStage::Spawning => write!(f, "spawning server"),
            LoadStage::Attaching => write!(f, "attaching shared memory"),
            LoadStage::Handshake => write!(f, "waiting for ready handshake"),
            LoadStage::Loading => write!(f, "loading module"),
            LoadStage::Instantiation => write!(f, "creating instance"),
            LoadStage::ThreadSetup => write!(f, "starting threads"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Plugin load failed at {stage} stage: {path}\n  Reason: {reason}")]
    LoadFailed {
        path: PathBuf,
        stage: LoadStage,
        reason: String,
    },

    /// The peer stopped answering, or the session was torn down.
    /// Terminal: no further request is issued on this session.
    #[error("Remote session closed during {operation}")]
    SessionClosed { operation: String },

    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("{what} needs {required} bytes but the transfer buffer holds {capacity}")]
    PayloadTooLarge {
        what: &'static str,
        required: usize,
        capacity: usize,
    },

    #[error("Shared memory error: {0}")]
    SharedMemoryError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl BridgeError {
    pub fn session_closed(operation: impl Into<String>) -> Self {
        BridgeError::SessionClosed {
            operation: operation.into(),
        }
    }

    /// True for conditions after which the session cannot be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeError::SessionClosed { .. })
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
