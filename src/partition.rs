use chrono::{DateTime, Datelike, Utc};

use crate::model::{MigrationId, RecordKind};

/// Maps a record's `effective_at` + migration id to a canonical hive-style
/// partition directory. Pure, deterministic, the sole source of truth for
/// file layout.
///
/// Integer month/day, no zero-padding, matching
/// `"{kind}/migration={m}/year={Y}/month={M}/day={D}"`.
pub fn partition_path(
    effective_at: DateTime<Utc>,
    migration_id: MigrationId,
    kind: RecordKind,
) -> String {
    format!(
        "{}/migration={}/year={}/month={}/day={}",
        kind.as_str(),
        migration_id,
        effective_at.year(),
        effective_at.month(),
        effective_at.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_components_without_padding() {
        let t = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(
            partition_path(t, 3, RecordKind::Updates),
            "updates/migration=3/year=2024/month=1/day=5"
        );
    }

    #[test]
    fn is_deterministic() {
        let t = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let a = partition_path(t, 7, RecordKind::Events);
        let b = partition_path(t, 7, RecordKind::Events);
        assert_eq!(a, b);
        assert_eq!(a, "events/migration=7/year=2024/month=12/day=31");
    }

    #[test]
    fn distinguishes_kind() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_ne!(
            partition_path(t, 1, RecordKind::Updates),
            partition_path(t, 1, RecordKind::Events)
        );
    }
}
