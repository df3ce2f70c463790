use thiserror::Error;

/// Crate-wide error type surfaced at the boundaries between components.
///
/// Internal functions mostly return `anyhow::Result`, the way the teacher's
/// `BlockProcessor`/`ChainSync` do; `EngineError` is reserved for the few
/// places that need to distinguish retryable from fatal outcomes (the fetch
/// client, the backfill driver's transient-error handling, and the
/// top-level `run()` exit code).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("fatal transport error: {0}")]
    Fatal(String),

    #[error("writer failure: {0}")]
    Writer(String),

    #[error("cursor store failure: {0}")]
    Cursor(String),

    #[error("post-write validation failure: {0}")]
    Validation(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}
