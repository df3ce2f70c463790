use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Integer identifier for a ledger protocol epoch.
pub type MigrationId = u32;

/// A synchronizer's time range within a migration, as returned by
/// `migration-info`. Invariant: `min_time <= max_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchronizerRange {
    pub synchronizer_id: String,
    pub min_time: DateTime<Utc>,
    pub max_time: DateTime<Utc>,
}

/// A process-level partition of the work for one (migration, synchronizer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub index: u32,
    pub total: u32,
}

impl Shard {
    pub fn single() -> Self {
        Self { index: 0, total: 1 }
    }

    /// Clips `[min, max]` to this shard's slice via integer-arithmetic
    /// shard math, leaving no gap or overlap between adjacent shards.
    pub fn clip(&self, min: DateTime<Utc>, max: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        if self.total <= 1 {
            return (min, max);
        }
        let min_ms = min.timestamp_millis();
        let max_ms = max.timestamp_millis();
        let span = (max_ms - min_ms).max(0);
        let total = self.total as i64;
        // Shard 0 owns the newest slice: shards are laid out oldest-to-newest
        // across [min, max] and indexed so that index 0 is the last (newest)
        // sub-range.
        let shard_from_oldest = total - 1 - self.index as i64;
        let start_ms = min_ms + span * shard_from_oldest / total;
        let end_ms = min_ms + span * (shard_from_oldest + 1) / total;
        (
            DateTime::<Utc>::from_timestamp_millis(start_ms).unwrap_or(min),
            DateTime::<Utc>::from_timestamp_millis(end_ms).unwrap_or(max),
        )
    }
}

/// The kind of normalized record, and the sole vocabulary the partition
/// router accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Updates,
    Events,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Updates => "updates",
            RecordKind::Events => "events",
        }
    }
}

/// Raw transaction envelope as returned by the scan API: either a regular
/// transaction (`events_by_id` + `root_event_ids`) or a reassignment
/// (`created_event`/`archived_event`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransactionEnvelope {
    #[serde(default)]
    pub transaction: Option<RawLedgerTransaction>,
    #[serde(default)]
    pub reassignment: Option<RawReassignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLedgerTransaction {
    pub update_id: String,
    pub record_time: String,
    #[serde(default)]
    pub synchronizer_id: Option<String>,
    #[serde(default)]
    pub events_by_id: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub root_event_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReassignment {
    pub update_id: String,
    #[serde(default)]
    pub synchronizer_id: Option<String>,
    pub event: RawReassignmentEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReassignmentEvent {
    pub record_time: String,
    #[serde(default)]
    pub created_event: Option<serde_json::Value>,
    #[serde(default)]
    pub archived_event: Option<serde_json::Value>,
}

impl RawTransactionEnvelope {
    /// `update_id | transaction.update_id | reassignment.update_id`.
    pub fn update_id(&self) -> Option<&str> {
        self.transaction
            .as_ref()
            .map(|t| t.update_id.as_str())
            .or_else(|| self.reassignment.as_ref().map(|r| r.update_id.as_str()))
    }

    /// `record_time | event.record_time | effective_at`.
    pub fn record_time(&self) -> Option<&str> {
        self.transaction
            .as_ref()
            .map(|t| t.record_time.as_str())
            .or_else(|| {
                self.reassignment
                    .as_ref()
                    .map(|r| r.event.record_time.as_str())
            })
    }
}

/// Normalized update record. Invariant: `effective_at` is always set.
/// Callers must never construct one from a record whose `effective_at`
/// failed to parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub update_id: String,
    pub migration_id: MigrationId,
    pub synchronizer_id: String,
    pub effective_at: DateTime<Utc>,
    pub update_type: String,
    pub update_data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Created,
    Exercised,
    ReassignCreate,
    ReassignArchive,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Exercised => "exercised",
            EventType::ReassignCreate => "reassign_create",
            EventType::ReassignArchive => "reassign_archive",
        }
    }
}

/// Normalized event record. Invariant: `effective_at` is always set;
/// events whose source record had no parseable `effective_at` are
/// dropped upstream in `normalize` and never constructed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub update_id: String,
    pub migration_id: MigrationId,
    pub effective_at: DateTime<Utc>,
    pub event_type: EventType,
    pub raw_event: serde_json::Value,
}

/// Tagged cursor position: backfill's exclusive-upper-bound semantics and
/// live tail's `after` semantics are kept as distinctly named fields
/// instead of overloading one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum CursorPosition {
    /// Work remaining is strictly `< before`.
    Backfill { before: DateTime<Utc> },
    /// Work remaining is strictly `> after`.
    Live { after: DateTime<Utc> },
}

/// Durable per-(migration, synchronizer, shard) checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub migration_id: MigrationId,
    pub synchronizer_id: String,
    pub shard_index: u32,
    pub position: CursorPosition,
    pub total_updates: u64,
    pub total_events: u64,
    pub min_time: DateTime<Utc>,
    pub max_time: DateTime<Utc>,
    pub complete: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Pending-work sidecar: nonzero while a wave's writes are still in
    /// flight and not yet folded into `total_updates`/`total_events`.
    pub pending_writes: u64,
    pub buffered_records: u64,
    /// Staged deltas for the in-progress two-phase commit, if any.
    #[serde(default)]
    pub pending_delta_updates: u64,
    #[serde(default)]
    pub pending_delta_events: u64,
    #[serde(default)]
    pub pending_position: Option<CursorPosition>,
}

impl Cursor {
    pub fn new_backfill(
        migration_id: MigrationId,
        synchronizer_id: String,
        shard_index: u32,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            migration_id,
            synchronizer_id,
            shard_index,
            position: CursorPosition::Backfill { before: max_time },
            total_updates: 0,
            total_events: 0,
            min_time,
            max_time,
            complete: false,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            pending_writes: 0,
            buffered_records: 0,
            pending_delta_updates: 0,
            pending_delta_events: 0,
            pending_position: None,
        }
    }

    /// `complete` is true only when there is no outstanding work and the
    /// backfill position has reached `min_time`.
    pub fn invariants_hold(&self) -> bool {
        if !self.complete {
            return true;
        }
        if self.pending_writes != 0 || self.buffered_records != 0 {
            return false;
        }
        match self.position {
            CursorPosition::Backfill { before } => before <= self.min_time,
            CursorPosition::Live { .. } => true,
        }
    }
}
