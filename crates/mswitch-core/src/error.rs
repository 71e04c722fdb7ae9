//! The controller's error taxonomy (locally recovered vs. surfaced kinds).
//! Library errors are typed via `thiserror` so callers can match on the
//! kind instead of grepping a message string; `mswitchd`'s `main` still
//! collapses everything into `anyhow::Result` at the process boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to bind socket {addr}: {source}")]
    SocketBindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown source id or index: {0}")]
    UnknownSource(String),

    #[error("switch target is already active")]
    NoOp,

    #[error("command queue is full")]
    QueueFull,

    #[error("no healthy failover candidate available")]
    NoCandidate,

    #[error("filter control adapter unavailable: {0}")]
    FilterAdapterUnavailable(String),

    #[error("health threshold exceeded: {0}")]
    ThresholdExceeded(String),

    #[error("source subprocess died: {0}")]
    SubprocessDied(String),
}

impl ControllerError {
    /// True for the error kinds that are "locally recovered":
    /// the caller should log and continue, not propagate a fatal failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ControllerError::NoCandidate
                | ControllerError::FilterAdapterUnavailable(_)
                | ControllerError::QueueFull
                | ControllerError::NoOp
        )
    }
}
