use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::http_client::FetchClient;
use crate::model::MigrationId;
use crate::normalize::Normalizer;
use crate::partition::partition_path;
use crate::writer::WriterPool;

const PER_SLICE_DEDUP_MAX: usize = 50_000;
pub const GLOBAL_DEDUP_MAX: usize = 250_000;
const PIPELINE_DEPTH: usize = 3;
const SLICE_MAX_RETRIES: u32 = 3;

/// Shared across waves and slices for one (migration, synchronizer, shard)
/// backfill run; bounded, wholesale-cleared on overflow.
#[derive(Default)]
pub struct GlobalDedup {
    seen: Mutex<HashSet<String>>,
}

impl GlobalDedup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns `true` if this is the first time `update_id` has been seen
    /// since the set was last cleared.
    async fn observe(&self, update_id: &str) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.len() >= GLOBAL_DEDUP_MAX {
            warn!(cap = GLOBAL_DEDUP_MAX, "global dedup set reached cap, clearing wholesale");
            seen.clear();
        }
        seen.insert(update_id.to_string())
    }
}

/// One slice's non-overlapping `(before, after)` sub-range.
#[derive(Debug, Clone, Copy)]
pub struct SlicePlan {
    pub index: usize,
    pub before: DateTime<Utc>,
    pub after: DateTime<Utc>,
}

/// Divides `[at_or_after, start_before]` into `concurrency` equal,
/// non-overlapping slices indexed 0 (newest) .. concurrency-1 (oldest).
/// Falls back to a single sequential slice when the range is too narrow
/// to usefully parallelize.
pub fn plan_slices(start_before: DateTime<Utc>, at_or_after: DateTime<Utc>, concurrency: usize) -> Vec<SlicePlan> {
    let concurrency = concurrency.max(1);
    let span_ms = (start_before.timestamp_millis() - at_or_after.timestamp_millis()).max(0);
    if concurrency == 1 || span_ms < 60_000 * concurrency as i64 {
        return vec![SlicePlan {
            index: 0,
            before: start_before,
            after: at_or_after,
        }];
    }

    let min_ms = at_or_after.timestamp_millis();
    let total = concurrency as i64;
    (0..concurrency)
        .map(|index| {
            // index 0 is newest: its slice sits at the top of the range.
            let slice_from_oldest = total - 1 - index as i64;
            let slice_before_ms = min_ms + span_ms * (slice_from_oldest + 1) / total;
            let slice_after_ms = min_ms + span_ms * slice_from_oldest / total;
            SlicePlan {
                index,
                before: DateTime::<Utc>::from_timestamp_millis(slice_before_ms).unwrap_or(start_before),
                after: DateTime::<Utc>::from_timestamp_millis(slice_after_ms).unwrap_or(at_or_after),
            }
        })
        .collect()
}

/// Result of one slice's fetch loop.
#[derive(Debug, Clone)]
pub struct SliceOutcome {
    pub index: usize,
    pub completed: bool,
    /// The earliest point this slice has durably processed up to. Moves
    /// to the timestamp of the oldest record seen in each page; if the
    /// slice never saw a single record, it falls back to `slice.after`
    /// rather than `slice.before`, since the whole `[after, before)`
    /// range was traversed and confirmed empty.
    pub earliest_time: DateTime<Utc>,
    pub total_updates: u64,
    pub total_events: u64,
    pub failed: bool,
    /// Only meaningful when `failed`: whether every error observed on
    /// this slice was a retryable transport/status error, used to decide
    /// cooldown vs. hard failure.
    pub retryable: bool,
}

/// Empty-gap step schedule: `min(10 * 10^consecutive_empty, 1s)`.
fn empty_gap_step(consecutive_empty: u32) -> Duration {
    let ms = 10u64.saturating_mul(10u64.saturating_pow(consecutive_empty));
    Duration::from_millis(ms.min(1000))
}

fn jittered_backoff(attempt: u32) -> Duration {
    let base = Duration::from_millis(500 * 2u64.pow(attempt.min(10)));
    let capped = base.min(Duration::from_secs(30));
    let jitter = rand::thread_rng().gen_range(0.0..0.30);
    capped.mul_f64(1.0 + jitter)
}

/// Pages backward from `slice.before` towards `slice.after`, normalizing
/// and buffering each unique transaction, until the slice is exhausted
/// or fails.
pub async fn fetch_time_slice_streaming(
    client: &FetchClient,
    normalizer: &dyn Normalizer,
    pool: &Arc<WriterPool>,
    global_dedup: &GlobalDedup,
    migration_id: MigrationId,
    synchronizer_id: &str,
    batch_size: usize,
    slice: SlicePlan,
) -> SliceOutcome {
    let mut current_before = slice.before;
    let mut earliest_time = slice.before;
    let mut processed_any = false;
    let mut total_updates = 0u64;
    let mut total_events = 0u64;
    let mut consecutive_empty = 0u32;
    let mut local_seen: HashSet<String> = HashSet::new();
    let mut in_flight: VecDeque<tokio::task::JoinHandle<()>> = VecDeque::new();

    loop {
        if current_before <= slice.after {
            break;
        }

        let page = {
            let mut attempt = 0u32;
            loop {
                match client
                    .updates_before(migration_id, synchronizer_id, current_before, slice.after, batch_size)
                    .await
                {
                    Ok(page) => break page,
                    Err(e) => {
                        if !e.is_retryable() {
                            warn!(slice = slice.index, "slice failed non-retryably: {}", e);
                            drain_in_flight(&mut in_flight).await;
                            return SliceOutcome {
                                index: slice.index,
                                completed: false,
                                earliest_time: if processed_any { earliest_time } else { slice.after },
                                total_updates,
                                total_events,
                                failed: true,
                                retryable: false,
                            };
                        }
                        attempt += 1;
                        if attempt > SLICE_MAX_RETRIES {
                            warn!(slice = slice.index, "slice exhausted retries: {}", e);
                            drain_in_flight(&mut in_flight).await;
                            return SliceOutcome {
                                index: slice.index,
                                completed: false,
                                earliest_time: if processed_any { earliest_time } else { slice.after },
                                total_updates,
                                total_events,
                                failed: true,
                                retryable: true,
                            };
                        }
                        let delay = jittered_backoff(attempt);
                        warn!(slice = slice.index, attempt, "slice fetch error, retrying: {}", e);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        if page.is_empty() {
            consecutive_empty += 1;
            let step = empty_gap_step(consecutive_empty);
            let next_before = current_before - ChronoDuration::milliseconds(step.as_millis() as i64);
            if next_before <= slice.after {
                break;
            }
            current_before = next_before;
            continue;
        }
        consecutive_empty = 0;

        let mut min_record_time: Option<DateTime<Utc>> = None;
        let mut unique = Vec::with_capacity(page.len());
        for envelope in page {
            let Some(record_time_str) = envelope.record_time() else {
                continue;
            };
            let Ok(record_time) = DateTime::parse_from_rfc3339(record_time_str) else {
                continue;
            };
            let record_time = record_time.with_timezone(&Utc);
            min_record_time = Some(min_record_time.map_or(record_time, |m: DateTime<Utc>| m.min(record_time)));

            let Some(update_id) = envelope.update_id() else {
                continue;
            };
            if !local_seen.insert(update_id.to_string()) {
                continue;
            }
            if !global_dedup.observe(update_id).await {
                continue;
            }
            unique.push(envelope);
        }

        if local_seen.len() > PER_SLICE_DEDUP_MAX {
            local_seen.clear();
        }

        if in_flight.len() >= PIPELINE_DEPTH {
            if let Some(handle) = in_flight.pop_front() {
                let _ = handle.await;
            }
        }

        let (updates, events) = match normalize_batch(normalizer, &unique, migration_id) {
            Ok(v) => v,
            Err(e) => {
                warn!(slice = slice.index, "normalization error: {:#}", e);
                continue;
            }
        };
        total_updates += updates.len() as u64;
        total_events += events.len() as u64;

        let handle = spawn_buffer_task(pool, updates, events);
        in_flight.push_back(handle);

        if let Some(min_time) = min_record_time {
            earliest_time = min_time;
            processed_any = true;
            if min_time <= slice.after {
                drain_in_flight(&mut in_flight).await;
                return SliceOutcome {
                    index: slice.index,
                    completed: true,
                    earliest_time,
                    total_updates,
                    total_events,
                    failed: false,
                    retryable: false,
                };
            }
            current_before = min_time - ChronoDuration::milliseconds(1);
        }
    }

    drain_in_flight(&mut in_flight).await;
    SliceOutcome {
        index: slice.index,
        completed: true,
        earliest_time: if processed_any { earliest_time } else { slice.after },
        total_updates,
        total_events,
        failed: false,
        retryable: false,
    }
}

async fn drain_in_flight(in_flight: &mut VecDeque<tokio::task::JoinHandle<()>>) {
    while let Some(handle) = in_flight.pop_front() {
        let _ = handle.await;
    }
}

fn normalize_batch(
    normalizer: &dyn Normalizer,
    envelopes: &[crate::model::RawTransactionEnvelope],
    migration_id: MigrationId,
) -> Result<(Vec<crate::model::UpdateRecord>, Vec<crate::model::EventRecord>)> {
    let mut updates = Vec::with_capacity(envelopes.len());
    let mut events = Vec::new();
    for envelope in envelopes {
        if let Some(update) = normalizer.normalize_update(envelope, migration_id) {
            events.extend(normalizer.normalize_events(envelope, migration_id));
            updates.push(update);
        }
    }
    Ok((updates, events))
}

fn spawn_buffer_task(
    pool: &Arc<WriterPool>,
    updates: Vec<crate::model::UpdateRecord>,
    events: Vec<crate::model::EventRecord>,
) -> tokio::task::JoinHandle<()> {
    let pool = pool.clone();
    tokio::spawn(async move {
        for record in updates {
            let partition = partition_path(record.effective_at, record.migration_id, crate::model::RecordKind::Updates);
            if let Err(e) = pool.buffer_updates(partition, record).await {
                warn!("failed to buffer update record: {:#}", e);
            }
        }
        for record in events {
            let partition = partition_path(record.effective_at, record.migration_id, crate::model::RecordKind::Events);
            if let Err(e) = pool.buffer_events(partition, record).await {
                warn!("failed to buffer event record: {:#}", e);
            }
        }
    })
}

/// Outcome of one parallel fetch wave across all slices, with the
/// contiguous-completed-prefix safe boundary computed.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub reached_end: bool,
    pub total_updates: u64,
    pub total_events: u64,
    pub failed_slices: Vec<usize>,
    pub slice_completion_status: Vec<bool>,
    pub safe_boundary: DateTime<Utc>,
    /// `true` when `failed_slices` is non-empty and every one of them
    /// failed for a retryable reason.
    pub all_failures_retryable: bool,
}

/// The longest contiguous prefix of completed, non-failed slices
/// starting at index 0 is safe to commit past: `outcomes` must already
/// be sorted by `index`. An empty prefix falls back to `start_before`,
/// since nothing is confirmed complete yet.
fn safe_cursor_boundary(outcomes: &[SliceOutcome], start_before: DateTime<Utc>) -> DateTime<Utc> {
    let prefix_len = outcomes.iter().take_while(|o| o.completed && !o.failed).count();
    if prefix_len == 0 {
        start_before
    } else {
        outcomes[prefix_len - 1].earliest_time
    }
}

/// Runs every slice concurrently, then computes the safe cursor boundary
/// as the longest contiguous prefix of completed slices starting at
/// index 0.
#[allow(clippy::too_many_arguments)]
pub async fn parallel_fetch_batch(
    client: &FetchClient,
    normalizer: &dyn Normalizer,
    pool: &Arc<WriterPool>,
    global_dedup: &GlobalDedup,
    migration_id: MigrationId,
    synchronizer_id: &str,
    batch_size: usize,
    start_before: DateTime<Utc>,
    at_or_after: DateTime<Utc>,
    concurrency: usize,
) -> BatchOutcome {
    let slices = plan_slices(start_before, at_or_after, concurrency);
    info!(slices = slices.len(), migration_id, synchronizer_id, "planned fetch wave");

    let outcomes: Vec<SliceOutcome> = futures::future::join_all(slices.iter().map(|slice| {
        fetch_time_slice_streaming(
            client,
            normalizer,
            pool,
            global_dedup,
            migration_id,
            synchronizer_id,
            batch_size,
            *slice,
        )
    }))
    .await;

    let mut ordered = outcomes.clone();
    ordered.sort_by_key(|o| o.index);

    let safe_boundary = safe_cursor_boundary(&ordered, start_before);

    let failed_slices: Vec<usize> = ordered.iter().filter(|o| o.failed).map(|o| o.index).collect();
    let all_failures_retryable = !failed_slices.is_empty() && ordered.iter().filter(|o| o.failed).all(|o| o.retryable);
    let slice_completion_status: Vec<bool> = ordered.iter().map(|o| o.completed && !o.failed).collect();
    let total_updates = ordered.iter().map(|o| o.total_updates).sum();
    let total_events = ordered.iter().map(|o| o.total_events).sum();
    let completed_prefix_len = ordered.iter().take_while(|o| o.completed && !o.failed).count();
    let reached_end =
        completed_prefix_len == ordered.len() && failed_slices.is_empty() && total_updates == 0 && total_events == 0;

    BatchOutcome {
        reached_end,
        total_updates,
        total_events,
        failed_slices,
        slice_completion_status,
        safe_boundary,
        all_failures_retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn plan_slices_falls_back_to_sequential_for_narrow_range() {
        let before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let plans = plan_slices(before, after, 4);
        assert_eq!(plans.len(), 1);
    }

    #[test]
    fn plan_slices_divides_into_non_overlapping_equal_ranges() {
        let before = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let plans = plan_slices(before, after, 4);
        assert_eq!(plans.len(), 4);
        // index 0 owns the newest slice
        assert_eq!(plans[0].before, before);
        assert_eq!(plans[3].after, after);
        for w in plans.windows(2) {
            assert_eq!(w[0].after, w[1].before);
        }
    }

    #[tokio::test]
    async fn global_dedup_clears_wholesale_at_cap() {
        let dedup = GlobalDedup::default();
        for i in 0..GLOBAL_DEDUP_MAX {
            assert!(dedup.observe(&format!("id-{i}")).await);
        }
        // at this point the set is exactly at the cap; next observe triggers a clear first
        let first_after_clear = dedup.observe("id-0").await;
        assert!(first_after_clear, "id-0 should look new again after wholesale clear");
    }

    #[test]
    fn empty_gap_step_is_capped_at_one_second() {
        assert_eq!(empty_gap_step(0), Duration::from_millis(10));
        assert_eq!(empty_gap_step(5), Duration::from_millis(1000));
        assert_eq!(empty_gap_step(10), Duration::from_millis(1000));
    }

    fn sample_outcome(index: usize, completed: bool, failed: bool, retryable: bool, earliest_time: DateTime<Utc>) -> SliceOutcome {
        SliceOutcome {
            index,
            completed,
            earliest_time,
            total_updates: 0,
            total_events: 0,
            failed,
            retryable,
        }
    }

    #[test]
    fn safe_boundary_falls_back_to_after_for_completed_empty_prefix_slice() {
        // Slice 0 completed having processed no records at all: its
        // earliest_time must already have been set to its own `after`
        // (never `before`) by fetch_time_slice_streaming, and the boundary
        // computation must take that as the safe point to commit to, not
        // fall back to start_before, once it's the sole completed slice.
        let start_before = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let slice0_after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 45, 0).unwrap();
        let outcomes = vec![sample_outcome(0, true, false, false, slice0_after)];
        assert_eq!(safe_cursor_boundary(&outcomes, start_before), slice0_after);
    }

    #[test]
    fn safe_boundary_advances_past_empty_prefix_slice_despite_later_transient_failure() {
        // The scenario from the bug report: slice 0 is empty and
        // completes, slice 1 fails transiently. k=1, so the boundary must
        // be slice 0's earliest_time (= its `after`, the old end of its
        // range) rather than collapsing back to start_before, or the
        // already-traversed empty range gets re-fetched every wave.
        let start_before = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let slice0_after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        let slice1_after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let outcomes = vec![
            sample_outcome(0, true, false, false, slice0_after),
            sample_outcome(1, false, true, true, slice1_after),
        ];
        let boundary = safe_cursor_boundary(&outcomes, start_before);
        assert_eq!(boundary, slice0_after);
        assert_ne!(boundary, start_before, "boundary must not collapse to the un-advanced start");
    }

    #[test]
    fn safe_boundary_is_start_before_when_no_slice_has_completed() {
        let start_before = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        let slice0_after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        let outcomes = vec![sample_outcome(0, false, true, true, slice0_after)];
        assert_eq!(safe_cursor_boundary(&outcomes, start_before), start_before);
    }
}
