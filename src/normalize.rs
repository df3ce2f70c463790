use chrono::{DateTime, Utc};
use tracing::warn;

use crate::model::{
    EventRecord, EventType, MigrationId, RawTransactionEnvelope, UpdateRecord,
};

/// Pure, side-effect-free mapping from a raw API object to the
/// `Update`/`Event` record shapes. Consumed, not owned, by the slice
/// loop: every call is total as long as the source effective time
/// parses, and produces nothing otherwise.
pub trait Normalizer: Send + Sync {
    fn normalize_update(
        &self,
        tx: &RawTransactionEnvelope,
        migration_id: MigrationId,
    ) -> Option<UpdateRecord>;

    fn normalize_events(
        &self,
        tx: &RawTransactionEnvelope,
        migration_id: MigrationId,
    ) -> Vec<EventRecord>;
}

/// Default normalizer for the ledger scan API's wire shape.
#[derive(Debug, Default, Clone, Copy)]
pub struct LedgerNormalizer;

fn parse_effective_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

impl Normalizer for LedgerNormalizer {
    fn normalize_update(
        &self,
        tx: &RawTransactionEnvelope,
        migration_id: MigrationId,
    ) -> Option<UpdateRecord> {
        let update_id = tx.update_id()?.to_string();
        let record_time = tx.record_time()?;
        let effective_at = match parse_effective_at(record_time) {
            Some(t) => t,
            None => {
                warn!(update_id = %update_id, record_time, "dropping update with unparseable effective_at");
                return None;
            }
        };

        if let Some(t) = &tx.transaction {
            Some(UpdateRecord {
                update_id,
                migration_id,
                synchronizer_id: t.synchronizer_id.clone().unwrap_or_default(),
                effective_at,
                update_type: "transaction".to_string(),
                update_data: serde_json::to_value(t).ok()?,
            })
        } else if let Some(r) = &tx.reassignment {
            Some(UpdateRecord {
                update_id,
                migration_id,
                synchronizer_id: r.synchronizer_id.clone().unwrap_or_default(),
                effective_at,
                update_type: "reassignment".to_string(),
                update_data: serde_json::to_value(r).ok()?,
            })
        } else {
            None
        }
    }

    fn normalize_events(
        &self,
        tx: &RawTransactionEnvelope,
        migration_id: MigrationId,
    ) -> Vec<EventRecord> {
        let Some(update_id) = tx.update_id().map(|s| s.to_string()) else {
            return Vec::new();
        };

        if let Some(t) = &tx.transaction {
            let mut events = Vec::with_capacity(t.events_by_id.len());
            for (event_id, raw_event) in &t.events_by_id {
                let Some(effective_at) = parse_effective_at(&t.record_time) else {
                    warn!(event_id, "dropping event with unparseable effective_at");
                    continue;
                };
                let event_type = if raw_event.get("exercised").is_some() {
                    EventType::Exercised
                } else {
                    EventType::Created
                };
                events.push(EventRecord {
                    event_id: event_id.clone(),
                    update_id: update_id.clone(),
                    migration_id,
                    effective_at,
                    event_type,
                    raw_event: raw_event.clone(),
                });
            }
            events
        } else if let Some(r) = &tx.reassignment {
            let mut events = Vec::with_capacity(2);
            let Some(effective_at) = parse_effective_at(&r.event.record_time) else {
                warn!(update_id = %update_id, "dropping reassignment with unparseable effective_at");
                return Vec::new();
            };
            if let Some(created) = &r.event.created_event {
                events.push(EventRecord {
                    event_id: format!("{update_id}-create"),
                    update_id: update_id.clone(),
                    migration_id,
                    effective_at,
                    event_type: EventType::ReassignCreate,
                    raw_event: created.clone(),
                });
            }
            if let Some(archived) = &r.event.archived_event {
                events.push(EventRecord {
                    event_id: format!("{update_id}-archive"),
                    update_id: update_id.clone(),
                    migration_id,
                    effective_at,
                    event_type: EventType::ReassignArchive,
                    raw_event: archived.clone(),
                });
            }
            if events.is_empty() {
                // A reassignment with neither created_event nor
                // archived_event yields zero events. Still worth a
                // warning, since it's unusual.
                warn!(update_id = %update_id, "reassignment carries neither created_event nor archived_event");
            }
            events
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RawLedgerTransaction, RawReassignment, RawReassignmentEvent};
    use std::collections::HashMap;

    fn envelope_with_transaction() -> RawTransactionEnvelope {
        let mut events_by_id = HashMap::new();
        events_by_id.insert("e1".to_string(), serde_json::json!({"created": {}}));
        RawTransactionEnvelope {
            transaction: Some(RawLedgerTransaction {
                update_id: "u1".to_string(),
                record_time: "2024-01-01T00:00:00Z".to_string(),
                synchronizer_id: Some("sync-1".to_string()),
                events_by_id,
                root_event_ids: vec!["e1".to_string()],
            }),
            reassignment: None,
        }
    }

    #[test]
    fn normalizes_update_from_transaction() {
        let n = LedgerNormalizer;
        let env = envelope_with_transaction();
        let update = n.normalize_update(&env, 2).unwrap();
        assert_eq!(update.update_id, "u1");
        assert_eq!(update.migration_id, 2);
        assert_eq!(update.update_type, "transaction");
    }

    #[test]
    fn emits_one_event_per_events_by_id_entry() {
        let n = LedgerNormalizer;
        let env = envelope_with_transaction();
        let events = n.normalize_events(&env, 2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "e1");
        assert_eq!(events[0].event_type, EventType::Created);
    }

    #[test]
    fn includes_events_by_id_entries_absent_from_root_event_ids() {
        let n = LedgerNormalizer;
        let mut env = envelope_with_transaction();
        env.transaction
            .as_mut()
            .unwrap()
            .events_by_id
            .insert("e2".to_string(), serde_json::json!({"exercised": {}}));
        // root_event_ids still only lists "e1"; "e2" must still surface.
        let events = n.normalize_events(&env, 2);
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.event_id == "e2" && e.event_type == EventType::Exercised));
    }

    #[test]
    fn reassignment_yields_at_most_two_events() {
        let n = LedgerNormalizer;
        let env = RawTransactionEnvelope {
            transaction: None,
            reassignment: Some(RawReassignment {
                update_id: "u2".to_string(),
                synchronizer_id: Some("sync-1".to_string()),
                event: RawReassignmentEvent {
                    record_time: "2024-01-01T00:00:00Z".to_string(),
                    created_event: Some(serde_json::json!({})),
                    archived_event: Some(serde_json::json!({})),
                },
            }),
        };
        let events = n.normalize_events(&env, 1);
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.event_type == EventType::ReassignCreate));
        assert!(events.iter().any(|e| e.event_type == EventType::ReassignArchive));
    }

    #[test]
    fn drops_update_with_unparseable_effective_at() {
        let n = LedgerNormalizer;
        let mut env = envelope_with_transaction();
        env.transaction.as_mut().unwrap().record_time = "not-a-date".to_string();
        assert!(n.normalize_update(&env, 1).is_none());
    }

    #[test]
    fn reassignment_with_neither_event_yields_zero_events() {
        let n = LedgerNormalizer;
        let env = RawTransactionEnvelope {
            transaction: None,
            reassignment: Some(RawReassignment {
                update_id: "u3".to_string(),
                synchronizer_id: None,
                event: RawReassignmentEvent {
                    record_time: "2024-01-01T00:00:00Z".to_string(),
                    created_event: None,
                    archived_event: None,
                },
            }),
        };
        assert!(n.normalize_events(&env, 1).is_empty());
    }
}
