use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::{RecordBatch, WriteOutcome, Writer};
use crate::model::{EventRecord, UpdateRecord};

const MAX_WRITE_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Point-in-time snapshot of the pool's buffering and write-queue state.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    pub updates_buffered: usize,
    pub events_buffered: usize,
    pub queued_jobs: usize,
    pub active_workers: usize,
    pub pending_writes: u64,
}

/// Buffers normalized records by partition and flushes them through a
/// fixed-size pool of concurrent write jobs. Dual-writes to every
/// configured `Writer` backend; a partition's write is only considered
/// durable once every backend reports `Ok`.
pub struct WriterPool {
    writers: Vec<Arc<dyn Writer>>,
    data_dir: PathBuf,
    rows_per_file: usize,
    semaphore: Arc<Semaphore>,
    worker_count: usize,
    updates_buffer: DashMap<String, Vec<UpdateRecord>>,
    events_buffer: DashMap<String, Vec<EventRecord>>,
    handles: Mutex<Vec<JoinHandle<Result<Vec<WriteOutcome>>>>>,
    pending_writes: Arc<AtomicU64>,
    active_workers: Arc<AtomicI64>,
    queued_jobs: Arc<AtomicI64>,
    shutdown: AtomicBool,
}

impl WriterPool {
    pub fn new(writers: Vec<Arc<dyn Writer>>, data_dir: PathBuf, rows_per_file: usize, worker_count: usize) -> Self {
        Self {
            writers,
            data_dir,
            rows_per_file: rows_per_file.max(1),
            semaphore: Arc::new(Semaphore::new(worker_count.max(1))),
            worker_count: worker_count.max(1),
            updates_buffer: DashMap::new(),
            events_buffer: DashMap::new(),
            handles: Mutex::new(Vec::new()),
            pending_writes: Arc::new(AtomicU64::new(0)),
            active_workers: Arc::new(AtomicI64::new(0)),
            queued_jobs: Arc::new(AtomicI64::new(0)),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Buffers one record and, once its partition reaches `rows_per_file`,
    /// hands the batch off to a worker. The hand-off applies back-pressure:
    /// if every worker slot is busy, this call blocks until one frees up
    /// rather than letting in-flight jobs accumulate without bound.
    pub async fn buffer_updates(&self, partition: String, record: UpdateRecord) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(anyhow!("writer pool is shutting down"));
        }
        let ready = {
            let mut entry = self.updates_buffer.entry(partition.clone()).or_default();
            entry.push(record);
            entry.len() >= self.rows_per_file
        };
        if ready {
            if let Some((_, records)) = self.updates_buffer.remove(&partition) {
                self.spawn_job(partition, RecordBatch::Updates(records)).await;
            }
        }
        Ok(())
    }

    /// Same back-pressure contract as [`Self::buffer_updates`], for events.
    pub async fn buffer_events(&self, partition: String, record: EventRecord) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(anyhow!("writer pool is shutting down"));
        }
        let ready = {
            let mut entry = self.events_buffer.entry(partition.clone()).or_default();
            entry.push(record);
            entry.len() >= self.rows_per_file
        };
        if ready {
            if let Some((_, records)) = self.events_buffer.remove(&partition) {
                self.spawn_job(partition, RecordBatch::Events(records)).await;
            }
        }
        Ok(())
    }

    /// Drains every buffered partition regardless of size and spawns a
    /// write job for each, then waits for all outstanding jobs (including
    /// ones already in flight) to complete, returning every outcome.
    pub async fn flush_all(&self) -> Result<Vec<WriteOutcome>> {
        let update_partitions: Vec<String> = self.updates_buffer.iter().map(|e| e.key().clone()).collect();
        for partition in update_partitions {
            if let Some((_, records)) = self.updates_buffer.remove(&partition) {
                if !records.is_empty() {
                    self.spawn_job(partition, RecordBatch::Updates(records)).await;
                }
            }
        }
        let event_partitions: Vec<String> = self.events_buffer.iter().map(|e| e.key().clone()).collect();
        for partition in event_partitions {
            if let Some((_, records)) = self.events_buffer.remove(&partition) {
                if !records.is_empty() {
                    self.spawn_job(partition, RecordBatch::Events(records)).await;
                }
            }
        }

        self.wait_for_writes().await
    }

    /// Blocks until every job spawned so far has completed (successfully
    /// or not), returning every outcome collected. Does not touch the
    /// still-accumulating buffers below `rows_per_file`.
    pub async fn wait_for_writes(&self) -> Result<Vec<WriteOutcome>> {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let mut outcomes = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(mut o)) => outcomes.append(&mut o),
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(anyhow!("writer task panicked: {e}")),
            }
        }
        Ok(outcomes)
    }

    pub fn get_buffer_stats(&self) -> BufferStats {
        BufferStats {
            updates_buffered: self.updates_buffer.iter().map(|e| e.value().len()).sum(),
            events_buffered: self.events_buffer.iter().map(|e| e.value().len()).sum(),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed).max(0) as usize,
            active_workers: self.active_workers.load(Ordering::Relaxed).max(0) as usize,
            pending_writes: self.pending_writes.load(Ordering::Relaxed),
        }
    }

    pub async fn shutdown(&self) -> Result<Vec<WriteOutcome>> {
        self.shutdown.store(true, Ordering::Release);
        self.flush_all().await
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Waits for a worker slot before spawning, so the number of jobs
    /// in flight is bounded by `worker_count`. While waiting, the job is
    /// counted in `queued_jobs`; callers (`buffer_updates`/`buffer_events`)
    /// block on this await, which is how back-pressure reaches them.
    async fn spawn_job(&self, partition: String, batch: RecordBatch) {
        let rows = batch.len() as u64;
        self.pending_writes.fetch_add(rows, Ordering::Relaxed);
        self.queued_jobs.fetch_add(1, Ordering::Relaxed);

        let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore closed");
        self.queued_jobs.fetch_sub(1, Ordering::Relaxed);

        let writers = self.writers.clone();
        let data_dir = self.data_dir.clone();
        let pending_writes = self.pending_writes.clone();
        let active_workers = self.active_workers.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            active_workers.fetch_add(1, Ordering::Relaxed);
            let result = write_with_retry(&writers, &data_dir, &partition, &batch).await;
            active_workers.fetch_sub(1, Ordering::Relaxed);
            pending_writes.fetch_sub(rows, Ordering::Relaxed);
            result
        });

        self.handles.lock().await.push(handle);
    }
}

/// Writes one batch to every configured backend, retrying a failing
/// backend up to `MAX_WRITE_ATTEMPTS` times with exponential backoff
/// before giving up. The batch is not considered flushed until every
/// backend reports a valid write.
async fn write_with_retry(
    writers: &[Arc<dyn Writer>],
    data_dir: &std::path::Path,
    partition: &str,
    batch: &RecordBatch,
) -> Result<Vec<WriteOutcome>> {
    let mut outcomes = Vec::with_capacity(writers.len());
    for writer in writers {
        let mut attempt = 0u32;
        loop {
            match writer.write_batch(data_dir, partition, batch).await {
                Ok(outcome) if outcome.validation.valid => {
                    outcomes.push(outcome);
                    break;
                }
                Ok(outcome) => {
                    attempt += 1;
                    warn!(
                        writer = writer.name(),
                        partition,
                        attempt,
                        issues = ?outcome.validation.issues,
                        "post-write validation failed"
                    );
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        return Err(anyhow!(
                            "writer {} failed validation after {} attempts: {:?}",
                            writer.name(),
                            attempt,
                            outcome.validation.issues
                        ));
                    }
                }
                Err(e) => {
                    attempt += 1;
                    warn!(writer = writer.name(), partition, attempt, "write failed: {:#}", e);
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        error!(writer = writer.name(), partition, "exhausted write retries");
                        return Err(e.context(format!("writer {} exhausted retries", writer.name())));
                    }
                }
            }
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
            tokio::time::sleep(delay).await;
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{ColumnStoreWriter, Validation};
    use crate::model::UpdateRecord;
    use chrono::Utc;

    /// Writer that blocks until released, for exercising back-pressure.
    struct SlowWriter {
        gate: tokio::sync::Semaphore,
    }

    impl SlowWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: tokio::sync::Semaphore::new(0),
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    #[async_trait::async_trait]
    impl Writer for SlowWriter {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn write_batch(
            &self,
            _data_dir: &std::path::Path,
            _partition: &str,
            batch: &RecordBatch,
        ) -> Result<WriteOutcome> {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            Ok(WriteOutcome {
                file: PathBuf::from("slow.out"),
                count: batch.len(),
                bytes: 0,
                validation: Validation {
                    valid: true,
                    issues: Vec::new(),
                    row_count: batch.len(),
                },
            })
        }

        async fn validate(&self, _file: &std::path::Path) -> Result<Validation> {
            Ok(Validation {
                valid: true,
                issues: Vec::new(),
                row_count: 0,
            })
        }
    }

    fn sample_update(i: usize) -> UpdateRecord {
        UpdateRecord {
            update_id: format!("u{i}"),
            migration_id: 1,
            synchronizer_id: "sync-a".to_string(),
            effective_at: Utc::now(),
            update_type: "transaction".to_string(),
            update_data: serde_json::json!({"i": i}),
        }
    }

    #[tokio::test]
    async fn flushes_partial_buffer_on_flush_all() {
        let dir = tempfile::tempdir().unwrap();
        let writers: Vec<Arc<dyn Writer>> = vec![Arc::new(ColumnStoreWriter::new(100_000))];
        let pool = WriterPool::new(writers, dir.path().to_path_buf(), 1000, 2);

        pool.buffer_updates("updates/migration=1/year=2024/month=1/day=1".to_string(), sample_update(0))
            .await
            .unwrap();
        pool.buffer_updates("updates/migration=1/year=2024/month=1/day=1".to_string(), sample_update(1))
            .await
            .unwrap();

        let stats_before = pool.get_buffer_stats();
        assert_eq!(stats_before.updates_buffered, 2);

        let outcomes = pool.flush_all().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].count, 2);

        let stats_after = pool.get_buffer_stats();
        assert_eq!(stats_after.updates_buffered, 0);
        assert_eq!(stats_after.pending_writes, 0);
    }

    #[tokio::test]
    async fn auto_flushes_when_rows_per_file_reached() {
        let dir = tempfile::tempdir().unwrap();
        let writers: Vec<Arc<dyn Writer>> = vec![Arc::new(ColumnStoreWriter::new(100_000))];
        let pool = WriterPool::new(writers, dir.path().to_path_buf(), 2, 2);

        pool.buffer_updates("updates/migration=1/year=2024/month=1/day=1".to_string(), sample_update(0))
            .await
            .unwrap();
        pool.buffer_updates("updates/migration=1/year=2024/month=1/day=1".to_string(), sample_update(1))
            .await
            .unwrap();

        // second record pushed the partition to rows_per_file=2, so it
        // should already be in flight rather than sitting in the buffer
        let stats = pool.get_buffer_stats();
        assert_eq!(stats.updates_buffered, 0);

        let outcomes = pool.wait_for_writes().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].count, 2);
    }

    #[tokio::test]
    async fn buffer_calls_apply_back_pressure_when_workers_are_saturated() {
        let dir = tempfile::tempdir().unwrap();
        let slow = SlowWriter::new();
        let writers: Vec<Arc<dyn Writer>> = vec![slow.clone()];
        let pool = Arc::new(WriterPool::new(writers, dir.path().to_path_buf(), 1, 1));

        // rows_per_file=1 and worker_count=1: the first buffer call's batch
        // is immediately handed to the single worker, which blocks on the
        // gate. A second buffer call for a different partition must then
        // queue rather than spawning an unbounded second job.
        pool.buffer_updates("updates/migration=1/year=2024/month=1/day=1".to_string(), sample_update(0))
            .await
            .unwrap();

        let pool_clone = pool.clone();
        let second = tokio::spawn(async move {
            pool_clone
                .buffer_updates("updates/migration=1/year=2024/month=1/day=2".to_string(), sample_update(1))
                .await
                .unwrap();
        });

        // give the first job's worker time to claim the only slot and the
        // second buffer call time to start blocking on it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pool.get_buffer_stats();
        assert_eq!(stats.active_workers, 1);
        assert_eq!(stats.queued_jobs, 1, "second job should be waiting for a worker slot, not spawned unbounded");

        slow.release(2);
        second.await.unwrap();
        let outcomes = pool.wait_for_writes().await.unwrap();
        assert_eq!(outcomes.len(), 2);
    }
}
