use thiserror::Error;

/// Failures of a detection run.
///
/// Only [`DetectError::ToolUnavailable`] and [`DetectError::StoreUnavailable`]
/// stop a run; the rest are scoped to the match being processed.
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("required tool `{tool}` is not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("state store unavailable: {0:#}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("malformed capture: {reason}")]
    MalformedCapture { reason: String },

    #[error("dissector failed: {reason}")]
    DissectorFailure { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DetectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectError::ToolUnavailable { .. } | DetectError::StoreUnavailable(_))
    }

    /// Short machine-readable code, used when recording failures.
    pub fn code(&self) -> &'static str {
        match self {
            DetectError::ToolUnavailable { .. } => "tool_unavailable",
            DetectError::StoreUnavailable(_) => "store_unavailable",
            DetectError::MalformedCapture { .. } => "malformed_capture",
            DetectError::DissectorFailure { .. } => "dissector_failure",
            DetectError::Io(_) => "io",
        }
    }
}
