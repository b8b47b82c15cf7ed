use thiserror::Error;

/// Errors surfaced by the DOM inspection service and its transport.
///
/// Transport-class variants (`Transport`, `StaleSession`, `Timeout`) signal
/// that a cached snapshot must not be reused; callers re-capture instead.
#[derive(Error, Debug)]
pub enum InspectionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("tab '{0}' is not connected")]
    TabNotConnected(String),

    #[error("debugging session for tab '{0}' is stale")]
    StaleSession(String),

    #[error("protocol error from {method}: {message}")]
    Protocol { method: String, message: String },

    #[error("element {0} not found in the current snapshot")]
    ElementNotFound(u32),

    #[error("no snapshot baseline for tab '{0}' to diff against")]
    DiffBaselineMissing(String),

    #[error("request '{0}' timed out")]
    Timeout(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors produced by the automation boundary.
#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("action timed out: {0}")]
    Timeout(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("bridge error: {0}")]
    Bridge(String),
}

impl AutomationError {
    /// Timeout-class failures are retried by the boundary wrapper; everything
    /// else propagates on the first attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AutomationError::Timeout(_))
    }
}
