use thiserror::Error;

/// Errors raised by the chain algebra, the bucket store contract, and the
/// fork-join executor. Runtime failures from user code (a `Source`'s
/// `generate`, a `Transformer`'s `transform`, a `Sink`'s `save`) are carried
/// as `anyhow::Error` rather than typed variants, since the engine cannot
/// know their shape ahead of time.
#[derive(Debug, Error)]
pub enum PipexError {
    #[error("cannot attach {rhs} after {lhs}: {reason}")]
    TypeMismatch {
        lhs: &'static str,
        rhs: &'static str,
        reason: &'static str,
    },

    #[error("bucket metadata has a concurrent writer in progress (tmp file present)")]
    DoubleWriterDetected,

    #[error("record file missing for id {0}")]
    MissingRecordFile(String),

    #[error("{transformer} cannot be used in process mode: {reason}")]
    NotProcessSafe {
        transformer: String,
        reason: &'static str,
    },

    #[error("source failed: {0}")]
    SourceFailed(#[source] anyhow::Error),

    #[error("worker failed: {0}")]
    WorkerFailed(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipexResult<T> = Result<T, PipexError>;
