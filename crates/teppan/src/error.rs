use crate::model::ModelKind;

/// Error taxonomy for the pipeline.
///
/// Every failure that can surface to a caller is a variant here. Batch-level
/// failures fan out to each affected job, which is why the type is `Clone`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("no {kind:?} model matching {name:?}")]
    ModelNotFound {
        kind: ModelKind,
        name: Option<String>,
    },

    #[error("input length {len} exceeds model limit {max}")]
    InputTooLarge { len: usize, max: usize },

    #[error("device {device} saturated")]
    ResourceExhausted { device: String },

    #[error("batch execution failed: {0}")]
    BatchExecution(String),

    #[error("deadline exceeded before dispatch")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("index inconsistency: {0}")]
    IndexInconsistency(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("result channel closed")]
    ChannelClosed,
}

impl PipelineError {
    /// Whether a caller may reasonably retry after backoff.
    ///
    /// Backpressure is the only retryable condition; everything else is
    /// either a caller mistake or an isolated job failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::ResourceExhausted { .. })
    }
}

/// Failure of a single forward pass, as reported by a [`ModelExecutor`].
///
/// The scheduler converts this into [`PipelineError::BatchExecution`] for
/// every job in the failing batch.
///
/// [`ModelExecutor`]: crate::model::ModelExecutor
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExecutionFault(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backpressure_is_retryable() {
        assert!(PipelineError::ResourceExhausted {
            device: "gpu0".into()
        }
        .is_retryable());
        assert!(!PipelineError::DeadlineExceeded.is_retryable());
        assert!(!PipelineError::BatchExecution("oom".into()).is_retryable());
    }
}
