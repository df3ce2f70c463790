use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::model::MigrationId;
use crate::normalize::Normalizer;
use crate::partition::partition_path;
use crate::writer::WriterPool;
use crate::http_client::FetchClient;

const LIVE_CURSOR_PERSIST_EVERY: u64 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LiveCursorFile {
    migration_id: MigrationId,
    record_time: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Forward-paginating poller that runs once the backfill driver confirms
/// every migration is complete.
pub struct LiveTailer {
    client: Arc<FetchClient>,
    normalizer: Arc<dyn Normalizer>,
    pool: Arc<WriterPool>,
    cursor_dir: PathBuf,
    data_dir: PathBuf,
    batch_size: usize,
    poll_interval: Duration,
    stall_threshold: Duration,
    last_progress_at: AtomicI64,
}

impl LiveTailer {
    pub fn new(
        client: Arc<FetchClient>,
        normalizer: Arc<dyn Normalizer>,
        pool: Arc<WriterPool>,
        cursor_dir: PathBuf,
        data_dir: PathBuf,
        batch_size: usize,
        poll_interval: Duration,
        stall_threshold: Duration,
    ) -> Self {
        Self {
            client,
            normalizer,
            pool,
            cursor_dir,
            data_dir,
            batch_size,
            poll_interval,
            stall_threshold,
            last_progress_at: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    fn live_cursor_path(&self) -> PathBuf {
        self.cursor_dir.join("cursor-live.json")
    }

    /// Merges three candidates: the live-cursor file, the max `max_time`
    /// across backfill cursors, and the latest timestamp discoverable by
    /// scanning written partition directories. Returns the newest
    /// `(migration_id, record_time)`.
    async fn resolve_starting_cursor(&self) -> Result<Option<(MigrationId, DateTime<Utc>)>> {
        let mut candidates: Vec<(MigrationId, DateTime<Utc>)> = Vec::new();
        let now = Utc::now();

        if let Some(live) = self.load_live_cursor().await {
            if live.record_time <= now {
                candidates.push((live.migration_id, live.record_time));
            } else {
                warn!("live cursor file has a future timestamp, ignoring");
            }
        }

        if let Some(backfill_max) = self.scan_backfill_cursors_max_time().await? {
            if backfill_max.1 <= now {
                candidates.push(backfill_max);
            }
        }

        if let Some(partition_max) = self.scan_partition_directories_max_time().await? {
            if partition_max.1 <= now {
                candidates.push(partition_max);
            }
        }

        Ok(candidates.into_iter().max_by_key(|(_, t)| *t))
    }

    async fn load_live_cursor(&self) -> Option<LiveCursorFile> {
        let bytes = tokio::fs::read(self.live_cursor_path()).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn save_live_cursor(&self, migration_id: MigrationId, record_time: DateTime<Utc>) -> Result<()> {
        let state = LiveCursorFile {
            migration_id,
            record_time,
            updated_at: Utc::now(),
        };
        let path = self.live_cursor_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.context("creating cursor dir")?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&state).context("serializing live cursor")?;
        let mut file = tokio::fs::File::create(&tmp_path).await.context("creating temp live cursor file")?;
        file.write_all(&json).await.context("writing temp live cursor file")?;
        file.sync_all().await.context("fsyncing temp live cursor file")?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await.context("renaming live cursor into place")?;
        Ok(())
    }

    async fn scan_backfill_cursors_max_time(&self) -> Result<Option<(MigrationId, DateTime<Utc>)>> {
        let mut entries = match tokio::fs::read_dir(&self.cursor_dir).await {
            Ok(e) => e,
            Err(_) => return Ok(None),
        };
        let mut best: Option<(MigrationId, DateTime<Utc>)> = None;
        while let Some(entry) = entries.next_entry().await.context("reading cursor dir entry")? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("cursor-") || name == "cursor-live.json" {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            let Ok(cursor) = serde_json::from_slice::<crate::model::Cursor>(&bytes) else {
                continue;
            };
            match &best {
                Some((_, t)) if *t >= cursor.max_time => {}
                _ => best = Some((cursor.migration_id, cursor.max_time)),
            }
        }
        Ok(best)
    }

    /// Walks `{data_dir}/{kind}/migration=*/year=*/month=*/day=*` and
    /// returns the latest day found, as a conservative end-of-day instant.
    async fn scan_partition_directories_max_time(&self) -> Result<Option<(MigrationId, DateTime<Utc>)>> {
        let data_dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || scan_partition_directories_max_time_sync(&data_dir))
            .await
            .context("partition scan task panicked")?
    }

    /// `updatesForward({migration, record_time}, BATCH_SIZE)` loop. Never
    /// exits on transient errors; stall watchdog only logs.
    pub async fn run(&self) -> Result<()> {
        let mut after = self.resolve_starting_cursor().await?;
        info!(?after, "live tailer starting");

        let mut batches_since_persist: u64 = 0;
        let mut consecutive_transient: u32 = 0;

        loop {
            self.check_stall();

            match self.client.updates_forward(after, self.batch_size).await {
                Ok(page) if page.is_empty() => {
                    if let Some((migration_id, record_time)) = after {
                        self.save_live_cursor(migration_id, record_time).await?;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(page) => {
                    consecutive_transient = 0;
                    self.last_progress_at.store(Utc::now().timestamp_millis(), Ordering::Relaxed);

                    let mut last_seen: Option<(MigrationId, DateTime<Utc>)> = None;
                    for envelope in &page {
                        let Some(update) = self.normalizer.normalize_update(envelope, last_migration_id(after)) else {
                            continue;
                        };
                        let events = self.normalizer.normalize_events(envelope, update.migration_id);
                        last_seen = Some((update.migration_id, update.effective_at));

                        let partition = partition_path(update.effective_at, update.migration_id, crate::model::RecordKind::Updates);
                        self.pool.buffer_updates(partition, update).await?;
                        for event in events {
                            let partition = partition_path(event.effective_at, event.migration_id, crate::model::RecordKind::Events);
                            self.pool.buffer_events(partition, event).await?;
                        }
                    }

                    if let Some(newest) = last_seen {
                        after = Some(newest);
                    }

                    batches_since_persist += 1;
                    if batches_since_persist >= LIVE_CURSOR_PERSIST_EVERY {
                        if let Some((migration_id, record_time)) = after {
                            self.save_live_cursor(migration_id, record_time).await?;
                        }
                        batches_since_persist = 0;
                    }
                }
                Err(e) => {
                    consecutive_transient += 1;
                    let delay = Duration::from_secs(2)
                        .mul_f64(2f64.powi(consecutive_transient as i32 - 1))
                        .min(Duration::from_secs(60));
                    warn!(consecutive_transient, delay_secs = delay.as_secs(), "live tail transient error: {}", e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn check_stall(&self) {
        let last = self.last_progress_at.load(Ordering::Relaxed);
        let elapsed = Utc::now().timestamp_millis() - last;
        if elapsed > self.stall_threshold.as_millis() as i64 {
            warn!(elapsed_ms = elapsed, "live tailer stall watchdog fired: no progress");
        }
    }
}

fn last_migration_id(after: Option<(MigrationId, DateTime<Utc>)>) -> MigrationId {
    after.map(|(m, _)| m).unwrap_or(0)
}

fn scan_partition_directories_max_time_sync(data_dir: &Path) -> Result<Option<(MigrationId, DateTime<Utc>)>> {
    let mut best: Option<(MigrationId, DateTime<Utc>)> = None;
    let Ok(kinds) = std::fs::read_dir(data_dir) else {
        return Ok(None);
    };
    for kind_entry in kinds.flatten() {
        if !kind_entry.path().is_dir() {
            continue;
        }
        let Ok(migrations) = std::fs::read_dir(kind_entry.path()) else {
            continue;
        };
        for migration_entry in migrations.flatten() {
            let Some(migration_id) = parse_kv_suffix(&migration_entry.file_name().to_string_lossy(), "migration=") else {
                continue;
            };
            let Ok(years) = std::fs::read_dir(migration_entry.path()) else {
                continue;
            };
            for year_entry in years.flatten() {
                let Some(year) = parse_kv_suffix(&year_entry.file_name().to_string_lossy(), "year=") else {
                    continue;
                };
                let Ok(months) = std::fs::read_dir(year_entry.path()) else {
                    continue;
                };
                for month_entry in months.flatten() {
                    let Some(month) = parse_kv_suffix(&month_entry.file_name().to_string_lossy(), "month=") else {
                        continue;
                    };
                    let Ok(days) = std::fs::read_dir(month_entry.path()) else {
                        continue;
                    };
                    for day_entry in days.flatten() {
                        let Some(day) = parse_kv_suffix(&day_entry.file_name().to_string_lossy(), "day=") else {
                            continue;
                        };
                        let Some(end_of_day) = Utc
                            .with_ymd_and_hms(year as i32, month, day, 23, 59, 59)
                            .single()
                        else {
                            continue;
                        };
                        match &best {
                            Some((_, t)) if *t >= end_of_day => {}
                            _ => best = Some((migration_id, end_of_day)),
                        }
                    }
                }
            }
        }
    }
    Ok(best)
}

fn parse_kv_suffix(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kv_suffix_extracts_numeric_component() {
        assert_eq!(parse_kv_suffix("migration=3", "migration="), Some(3));
        assert_eq!(parse_kv_suffix("year=2024", "year="), Some(2024));
        assert_eq!(parse_kv_suffix("month=abc", "month="), None);
    }

    #[test]
    fn scan_partition_directories_finds_latest_day() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("updates/migration=1/year=2024/month=1/day=1");
        let p2 = dir.path().join("updates/migration=1/year=2024/month=3/day=15");
        std::fs::create_dir_all(&p1).unwrap();
        std::fs::create_dir_all(&p2).unwrap();

        let (migration_id, t) = scan_partition_directories_max_time_sync(dir.path()).unwrap().unwrap();
        assert_eq!(migration_id, 1);
        assert_eq!(t.month(), 3);
        assert_eq!(t.day(), 15);
    }
}
