use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::cursor::{cursor_path, CursorStore};
use crate::http_client::FetchClient;
use crate::model::{CursorPosition, Cursor, MigrationId, Shard};
use crate::normalize::Normalizer;
use crate::slice::{parallel_fetch_batch, GlobalDedup};
use crate::tuner::Tuner;
use crate::writer::WriterPool;

const MAX_TRANSIENT_BEFORE_COOLDOWN: u32 = 3;
const COOLDOWN_DURATION: Duration = Duration::from_secs(60);
const HEAP_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Top-level backfill orchestrator. Discovers migrations, clips each
/// synchronizer's range to this process's shard, and drives one state
/// machine per (migration, synchronizer) to completion.
pub struct BackfillDriver {
    client: Arc<FetchClient>,
    normalizer: Arc<dyn Normalizer>,
    pool: Arc<WriterPool>,
    tuner: Arc<Tuner>,
    cursor_dir: PathBuf,
    shard: Shard,
    batch_size: usize,
    flush_every_batches: u64,
    gcs_checkpoint_interval: u64,
    heap_pressure_threshold: f64,
    target_migration: Option<MigrationId>,
}

impl BackfillDriver {
    pub fn new(
        client: Arc<FetchClient>,
        normalizer: Arc<dyn Normalizer>,
        pool: Arc<WriterPool>,
        tuner: Arc<Tuner>,
        settings: &Settings,
    ) -> Self {
        Self {
            client,
            normalizer,
            pool,
            tuner,
            cursor_dir: PathBuf::from(&settings.cursor_dir),
            shard: Shard {
                index: settings.shard_index,
                total: settings.shard_total,
            },
            batch_size: settings.batch_size,
            flush_every_batches: settings.flush_every_batches,
            gcs_checkpoint_interval: settings.gcs_checkpoint_interval,
            heap_pressure_threshold: settings.heap_pressure_threshold,
            target_migration: settings.target_migration,
        }
    }

    /// Probes `migrationInfo(0), migrationInfo(1), …` until a 404,
    /// respecting an optional single-migration filter.
    async fn discover_migrations(&self) -> Result<Vec<MigrationId>> {
        if let Some(target) = self.target_migration {
            return Ok(vec![target]);
        }
        let mut ids = Vec::new();
        let mut id: MigrationId = 0;
        loop {
            match self.client.migration_info(id).await? {
                Some(_) => {
                    ids.push(id);
                    id += 1;
                }
                None => break,
            }
        }
        Ok(ids)
    }

    /// Runs the whole backfill: every migration, every synchronizer, then
    /// confirms every cursor reached `complete=true` before returning.
    pub async fn run(&self) -> Result<()> {
        let migrations = self.discover_migrations().await?;
        info!(count = migrations.len(), "discovered migrations");

        let mut all_cursor_paths = Vec::new();

        for migration_id in migrations {
            let Some(info) = self.client.migration_info(migration_id).await? else {
                continue;
            };
            for range in info.record_time_range {
                let (clip_min, clip_max) = self.shard.clip(range.min_time, range.max_time);
                let path = cursor_path(
                    &self.cursor_dir,
                    migration_id,
                    &range.synchronizer_id,
                    self.shard.index,
                    self.shard.total,
                );
                all_cursor_paths.push(path.clone());
                let store = CursorStore::new(path);

                if let Some(existing) = store.load().await {
                    if existing.complete && matches!(existing.position, CursorPosition::Backfill { before } if before <= clip_min) {
                        info!(migration_id, synchronizer_id = %range.synchronizer_id, "cursor already complete, skipping");
                        continue;
                    }
                }

                self.backfill_synchronizer(migration_id, &range.synchronizer_id, clip_min, clip_max, &store)
                    .await?;
            }
        }

        for path in &all_cursor_paths {
            let store = CursorStore::new(path.clone());
            match store.load().await {
                Some(cursor) if cursor.complete => {}
                _ => {
                    warn!(path = %path.display(), "backfill finished without a complete cursor");
                }
            }
        }

        Ok(())
    }

    async fn backfill_synchronizer(
        &self,
        migration_id: MigrationId,
        synchronizer_id: &str,
        min_time: chrono::DateTime<Utc>,
        max_time: chrono::DateTime<Utc>,
        store: &CursorStore,
    ) -> Result<()> {
        let mut cursor = match store.load().await {
            Some(c) => c,
            None => Cursor::new_backfill(migration_id, synchronizer_id.to_string(), self.shard.index, min_time, max_time),
        };

        let mut before = match cursor.position {
            CursorPosition::Backfill { before } => before,
            CursorPosition::Live { .. } => max_time,
        };
        let at_or_after = min_time;
        let global_dedup = GlobalDedup::new();

        let mut consecutive_transient_errors: u32 = 0;
        let mut wave: u64 = 0;

        loop {
            if before <= at_or_after {
                break;
            }

            self.wait_for_heap_pressure_to_subside().await;

            let local_parallel = self.tuner.current().max(1) as usize;
            let outcome = parallel_fetch_batch(
                &self.client,
                self.normalizer.as_ref(),
                &self.pool,
                &global_dedup,
                migration_id,
                synchronizer_id,
                self.batch_size,
                before,
                at_or_after,
                local_parallel,
            )
            .await;

            if !outcome.failed_slices.is_empty() && !outcome.all_failures_retryable {
                error!(migration_id, synchronizer_id, "non-retryable slice failure, failing synchronizer");
                cursor.error = Some("non-retryable slice failure".to_string());
                store.save_atomic(cursor.clone()).await?;
                anyhow::bail!("synchronizer {synchronizer_id} failed non-retryably");
            }

            if !outcome.failed_slices.is_empty() {
                consecutive_transient_errors += 1;
                if consecutive_transient_errors >= MAX_TRANSIENT_BEFORE_COOLDOWN && self.tuner.current() > 2 {
                    warn!(migration_id, synchronizer_id, "entering cooldown after repeated transient errors");
                    self.tuner.enter_cooldown(COOLDOWN_DURATION).await;
                }
                let delay = Duration::from_secs(5).mul_f64(2f64.powi(consecutive_transient_errors as i32 - 1)).min(Duration::from_secs(60));
                warn!(migration_id, synchronizer_id, delay_secs = delay.as_secs(), "transient failure, backing off without advancing cursor");
                tokio::time::sleep(delay).await;
                continue;
            }

            if outcome.reached_end {
                info!(migration_id, synchronizer_id, "no more transactions in range");
                break;
            }

            store
                .begin_transaction(
                    cursor.clone(),
                    outcome.total_updates,
                    outcome.total_events,
                    CursorPosition::Backfill { before: outcome.safe_boundary },
                )
                .await;
            let committed = store.commit().await?.context("commit produced no cursor")?;
            cursor = committed;
            before = outcome.safe_boundary - chrono::Duration::milliseconds(1);

            consecutive_transient_errors = 0;
            wave += 1;

            if wave % self.flush_every_batches == 0 {
                self.pool.flush_all().await?;
            }
            if wave % self.gcs_checkpoint_interval == 0 {
                self.pool.wait_for_writes().await?;
            }

            self.tuner.evaluate(&self.client).await;
        }

        self.pool.flush_all().await?;
        self.pool.wait_for_writes().await?;

        cursor.complete = true;
        cursor.completed_at = Some(Utc::now());
        store.save_atomic(cursor).await?;

        Ok(())
    }

    async fn wait_for_heap_pressure_to_subside(&self) {
        if heap_pressure_ratio() <= self.heap_pressure_threshold {
            return;
        }
        warn!(threshold = self.heap_pressure_threshold, "heap pressure exceeded threshold, draining writers");
        if let Err(e) = self.pool.flush_all().await {
            warn!("flush during heap pressure drain failed: {:#}", e);
        }
        if let Err(e) = self.pool.wait_for_writes().await {
            warn!("wait_for_writes during heap pressure drain failed: {:#}", e);
        }

        let target = self.heap_pressure_threshold * 0.9;
        let deadline = Instant::now() + HEAP_WAIT_TIMEOUT;
        while heap_pressure_ratio() > target && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

/// Reads `/proc/self/status` and `/proc/meminfo` for an approximate
/// resident-memory / total-memory ratio. Returns `0.0` (no pressure
/// signal) wherever `/proc` is unavailable, e.g. non-Linux hosts.
fn heap_pressure_ratio() -> f64 {
    let rss_kb = read_proc_field("/proc/self/status", "VmRSS:");
    let total_kb = read_proc_field("/proc/meminfo", "MemTotal:");
    match (rss_kb, total_kb) {
        (Some(rss), Some(total)) if total > 0.0 => rss / total,
        _ => 0.0,
    }
}

fn read_proc_field(path: &str, key: &str) -> Option<f64> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            return digits.parse::<f64>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_pressure_ratio_never_panics_and_is_bounded() {
        let ratio = heap_pressure_ratio();
        assert!(ratio >= 0.0);
    }
}
