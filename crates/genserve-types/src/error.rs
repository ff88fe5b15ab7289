use thiserror::Error;

/// Error type shared by every layer of the service.
///
/// `Timeout` and `ProcessCrash` are fatal for the worker that produced them:
/// the scheduler force-terminates the process and clears its state before
/// the error reaches the caller.
#[derive(Debug, Error)]
pub enum GenError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("model load failed: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("timed out waiting for worker: {0}")]
    Timeout(String),

    #[error("worker process crashed: {0}")]
    ProcessCrash(String),

    #[error("task store error: {0}")]
    Store(String),

    #[error("queue transport error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GenError>;

impl GenError {
    /// Whether the worker process must be discarded after this error.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(self, GenError::Timeout(_) | GenError::ProcessCrash(_))
    }

    /// Short machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GenError::Validation(_) => "validation",
            GenError::Load(_) => "load",
            GenError::Inference(_) => "inference",
            GenError::Timeout(_) => "timeout",
            GenError::ProcessCrash(_) => "process_crash",
            GenError::Store(_) => "store",
            GenError::Queue(_) => "queue",
            GenError::Config(_) => "config",
            GenError::Serialization(_) => "serialization",
            GenError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_and_crash_are_worker_fatal() {
        assert!(GenError::Timeout("load".into()).is_worker_fatal());
        assert!(GenError::ProcessCrash("exit 137".into()).is_worker_fatal());
        assert!(!GenError::Inference("bad width".into()).is_worker_fatal());
        assert!(!GenError::Load("missing weights".into()).is_worker_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = GenError::Validation("unsupported task type: bogus".into());
        assert_eq!(
            err.to_string(),
            "validation error: unsupported task type: bogus"
        );
        assert_eq!(err.kind(), "validation");
    }
}
