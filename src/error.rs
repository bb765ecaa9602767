use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CastError>;

/// The start step that failed, carried by [`CastError::StartFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStage {
    Capture,
    Server,
    Session,
}

impl fmt::Display for StartStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartStage::Capture => write!(f, "capture"),
            StartStage::Server => write!(f, "stream server"),
            StartStage::Session => write!(f, "cast session"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CastError {
    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Receiver did not report active playback within {0:?}")]
    ActivationTimeout(std::time::Duration),

    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("Capture failed to start: {0}")]
    CaptureStartFailed(String),

    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Start failed at {stage}: {source}")]
    StartFailed {
        stage: StartStage,
        #[source]
        source: Box<CastError>,
    },

    #[error("Stop finished with {} failed step(s): {}", .0.len(), .0.join("; "))]
    StopFailed(Vec<String>),

    #[error("Another start/stop operation is already in flight")]
    OperationInFlight,

    #[error("No cast device selected")]
    NoDeviceSelected,

    #[error("Session is closed; create a new session")]
    SessionClosed,

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CastError {
    pub(crate) fn start_failed(stage: StartStage, source: CastError) -> Self {
        CastError::StartFailed {
            stage,
            source: Box::new(source),
        }
    }

    /// Root cause of a `StartFailed`, or the error itself.
    pub fn root_cause(&self) -> &CastError {
        match self {
            CastError::StartFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
