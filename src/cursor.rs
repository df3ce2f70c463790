use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use crate::model::{Cursor, CursorPosition, MigrationId};

/// Replaces every non-`[A-Za-z0-9_-]` character with `_` and truncates
/// to 50 chars, for safe use in filenames.
pub fn sanitize(s: &str) -> String {
    let mut out: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(50);
    out
}

pub fn cursor_path(
    cursor_dir: &Path,
    migration_id: MigrationId,
    synchronizer_id: &str,
    shard_index: u32,
    shard_total: u32,
) -> PathBuf {
    let name = if shard_total > 1 {
        format!(
            "cursor-{}-{}-shard{}.json",
            migration_id,
            sanitize(synchronizer_id),
            shard_index
        )
    } else {
        format!("cursor-{}-{}.json", migration_id, sanitize(synchronizer_id))
    };
    cursor_dir.join(name)
}

/// Durable per-(migration, synchronizer, shard) checkpoint store.
/// `save_atomic` is the only write path: write to a sibling temp file,
/// fsync, rename.
pub struct CursorStore {
    path: PathBuf,
    /// Guards the two-phase-commit staging so `begin`/`add_pending`/`commit`
    /// observe a consistent in-memory cursor even if called concurrently,
    /// though the contract is one driver per cursor at a time.
    staged: Mutex<Option<Cursor>>,
}

impl CursorStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            staged: Mutex::new(None),
        }
    }

    /// Reads the durable cursor file. Returns `None` on absence, or on a
    /// malformed / future-timestamped cursor (logged as a warning, treated
    /// as corruption).
    pub async fn load(&self) -> Option<Cursor> {
        let bytes = match fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read cursor file: {}", e);
                return None;
            }
        };

        let cursor: Cursor = match serde_json::from_slice(&bytes) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %self.path.display(), "malformed cursor JSON: {}", e);
                return None;
            }
        };

        let now = Utc::now();
        if cursor.updated_at > now || cursor.started_at > now {
            warn!(path = %self.path.display(), "cursor has a future timestamp, treating as absent");
            return None;
        }

        Some(cursor)
    }

    /// Write-to-temp-then-rename. Atomic on the target filesystem; a
    /// crash between the write and rename leaves either the old or the
    /// new state, never a partial file.
    pub async fn save_atomic(&self, mut state: Cursor) -> Result<()> {
        state.updated_at = Utc::now();
        let tmp_path = self.path.with_extension("json.tmp");

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cursor dir {}", parent.display()))?;
        }

        let json = serde_json::to_vec_pretty(&state).context("serializing cursor")?;
        let mut file = fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("creating temp cursor file {}", tmp_path.display()))?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&json).await.context("writing temp cursor file")?;
        file.sync_all().await.context("fsyncing temp cursor file")?;
        drop(file);

        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming cursor file into place at {}", self.path.display()))?;

        Ok(())
    }

    /// Stages pending deltas without committing totals or position, as
    /// the first half of a two-phase advance.
    pub async fn begin_transaction(
        &self,
        base: Cursor,
        delta_updates: u64,
        delta_events: u64,
        new_position: CursorPosition,
    ) {
        let mut staged = base;
        staged.pending_delta_updates = delta_updates;
        staged.pending_delta_events = delta_events;
        staged.pending_position = Some(new_position);
        *self.staged.lock().await = Some(staged);
    }

    pub async fn add_pending(&self, delta_updates: u64, delta_events: u64, new_position: CursorPosition) {
        let mut guard = self.staged.lock().await;
        if let Some(cursor) = guard.as_mut() {
            cursor.pending_delta_updates += delta_updates;
            cursor.pending_delta_events += delta_events;
            cursor.pending_position = Some(new_position);
        }
    }

    /// Folds staged deltas into totals and advances the position
    /// atomically. Callers MUST ensure the corresponding data is durable
    /// (i.e. `waitForWrites()` has returned) before calling this: the
    /// cursor must always lag the writes it claims to cover.
    pub async fn commit(&self) -> Result<Option<Cursor>> {
        let mut guard = self.staged.lock().await;
        let Some(mut cursor) = guard.take() else {
            return Ok(None);
        };

        cursor.total_updates += cursor.pending_delta_updates;
        cursor.total_events += cursor.pending_delta_events;
        if let Some(pos) = cursor.pending_position.take() {
            cursor.position = pos;
        }
        cursor.pending_delta_updates = 0;
        cursor.pending_delta_events = 0;

        self.save_atomic(cursor.clone()).await?;
        Ok(Some(cursor))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Cursor;
    use chrono::TimeZone;

    fn sample_cursor() -> Cursor {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        Cursor::new_backfill(1, "sync-a".to_string(), 0, t0, t1)
    }

    #[test]
    fn sanitize_replaces_unsafe_chars_and_truncates() {
        let long = "a".repeat(100);
        let sanitized = sanitize(&format!("weird/name:{long}"));
        assert_eq!(sanitized.len(), 50);
        assert!(sanitized.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = cursor_path(dir.path(), 1, "sync-a", 0, 1);
        let store = CursorStore::new(path);
        let cursor = sample_cursor();

        store.save_atomic(cursor.clone()).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.migration_id, cursor.migration_id);
        assert_eq!(loaded.synchronizer_id, cursor.synchronizer_id);
        assert_eq!(loaded.total_updates, cursor.total_updates);
    }

    #[tokio::test]
    async fn load_returns_none_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = cursor_path(dir.path(), 1, "sync-a", 0, 1);
        let store = CursorStore::new(path);
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn load_rejects_future_timestamped_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = cursor_path(dir.path(), 1, "sync-a", 0, 1);
        let store = CursorStore::new(path.clone());
        let mut cursor = sample_cursor();
        cursor.updated_at = Utc::now() + chrono::Duration::days(1000);
        // write directly, bypassing save_atomic's updated_at stamping
        let json = serde_json::to_vec_pretty(&cursor).unwrap();
        tokio::fs::write(&path, json).await.unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn two_phase_commit_advances_totals_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = cursor_path(dir.path(), 1, "sync-a", 0, 1);
        let store = CursorStore::new(path);
        let cursor = sample_cursor();
        let new_before = cursor.min_time;

        store
            .begin_transaction(cursor.clone(), 10, 20, CursorPosition::Backfill { before: new_before })
            .await;
        store.add_pending(5, 5, CursorPosition::Backfill { before: new_before }).await;
        let committed = store.commit().await.unwrap().unwrap();

        assert_eq!(committed.total_updates, 15);
        assert_eq!(committed.total_events, 25);
        match committed.position {
            CursorPosition::Backfill { before } => assert_eq!(before, new_before),
            _ => panic!("expected backfill position"),
        }

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.total_updates, 15);
    }
}
