mod chunked;
mod column_store;
mod pool;

pub use chunked::ChunkedWriter;
pub use column_store::ColumnStoreWriter;
pub use pool::{BufferStats, WriterPool};

use std::path::PathBuf;

use async_trait::async_trait;

use crate::model::{EventRecord, RecordKind, UpdateRecord};

/// One partition's worth of pre-mapped records, handed to a `Writer`
/// backend as a single job.
#[derive(Debug, Clone)]
pub enum RecordBatch {
    Updates(Vec<UpdateRecord>),
    Events(Vec<EventRecord>),
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Updates(v) => v.len(),
            RecordBatch::Events(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBatch::Updates(_) => RecordKind::Updates,
            RecordBatch::Events(_) => RecordKind::Events,
        }
    }
}

/// Result of one post-write validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub valid: bool,
    pub issues: Vec<String>,
    pub row_count: usize,
}

/// Outcome of one worker writing one batch to one file.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub file: PathBuf,
    pub count: usize,
    pub bytes: u64,
    pub validation: Validation,
}

/// A writer backend, resolved as a trait with concrete implementations
/// instead of boolean-flag-driven duck typing.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Human-readable name, used in logs and file-prefix construction.
    fn name(&self) -> &'static str;

    /// Writes one partition's batch to a new file under `data_dir`,
    /// returning the post-write validation result. Never overwrites an
    /// existing file. The filename construction guarantees uniqueness.
    async fn write_batch(
        &self,
        data_dir: &std::path::Path,
        partition: &str,
        batch: &RecordBatch,
    ) -> anyhow::Result<WriteOutcome>;

    /// Re-runs validation against an already-written file; running it
    /// twice on the same file must produce the same result.
    async fn validate(&self, file: &std::path::Path) -> anyhow::Result<Validation>;
}

/// `{prefix}-{ts}-{rand}.{ext}`: millisecond UTC timestamp + 8 hex chars
/// from a CSPRNG, so filename collision is impossible without clock
/// regression.
pub fn unique_filename(prefix: &str, ext: &str) -> String {
    use rand::RngCore;
    let ts = chrono::Utc::now().timestamp_millis();
    let mut buf = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    format!("{prefix}-{ts}-{}.{ext}", hex::encode(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_filename_has_no_collisions_for_same_instant() {
        let a = unique_filename("part", "parquet");
        let b = unique_filename("part", "parquet");
        assert_ne!(a, b);
    }
}
