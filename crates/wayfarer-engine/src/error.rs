use thiserror::Error;

/// Errors produced by the workflow engine.
///
/// Resolution misses (unknown alias, missing group) are deliberately not
/// here: they accumulate on the [`crate::ResolutionReport`] instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("workflow '{workflow_id}' has no node at position {position}")]
    MissingPosition { workflow_id: String, position: u32 },

    #[error("invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("node store error: {0}")]
    Store(String),

    #[error(transparent)]
    Automation(#[from] wayfarer::AutomationError),

    #[error(transparent)]
    Inspection(#[from] wayfarer::InspectionError),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}
