//! Trigger event persistence and dedup.
//!
//! The composite UNIQUE key (session_id, recording_id, trigger_event_id) is
//! the sole arbiter of dedup: overlapping trigger windows that resolve to the
//! same rounded bucket collapse onto one row, no advisory locking required.
//! Rows are never mutated after creation; soft delete keeps the key occupied
//! so a replayed window cannot re-emit a suppressed event.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct TriggerEventRecord {
    pub id: String,
    pub session_id: String,
    pub recording_id: String,
    /// The rounded wake-word bucket, e.g. "20".
    pub trigger_event_id: String,
    pub action_name: String,
    /// Resolved field data, placeholders replaced.
    pub data: BTreeMap<String, String>,
    pub registration_id: String,
    pub speaker_id: String,
    pub speaker_name: Option<String>,
    pub provider_bot_id: String,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

/// Fields for a new trigger event row.
#[derive(Debug, Clone)]
pub struct NewTriggerEvent {
    pub session_id: String,
    pub recording_id: String,
    pub trigger_event_id: String,
    pub action_name: String,
    pub data: BTreeMap<String, String>,
    pub registration_id: String,
    pub speaker_id: String,
    pub speaker_name: Option<String>,
    pub provider_bot_id: String,
}

/// Result of an insert-or-fetch.
#[derive(Debug)]
pub struct CreateOutcome {
    /// False when the key was already occupied and `event` is the existing row.
    pub created: bool,
    pub event: TriggerEventRecord,
}

const COLUMNS: &str = "id, session_id, recording_id, trigger_event_id, action_name, data, \
                       registration_id, speaker_id, speaker_name, provider_bot_id, \
                       created_at, deleted_at";

pub struct TriggerEventRepository;

impl TriggerEventRepository {
    /// Atomic insert-or-fetch on the composite key. A unique-constraint
    /// violation means another window already claimed this bucket; the
    /// existing row is fetched and returned instead of an error.
    pub fn create_if_absent(conn: &Connection, new: &NewTriggerEvent) -> Result<CreateOutcome> {
        let id = crate::db::new_id("trig");
        let data_json =
            serde_json::to_string(&new.data).context("Failed to serialize trigger event data")?;

        let inserted = conn.query_row(
            &format!(
                "INSERT INTO trigger_events \
                 (id, session_id, recording_id, trigger_event_id, action_name, data, \
                  registration_id, speaker_id, speaker_name, provider_bot_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 RETURNING {COLUMNS}"
            ),
            params![
                id,
                new.session_id,
                new.recording_id,
                new.trigger_event_id,
                new.action_name,
                data_json,
                new.registration_id,
                new.speaker_id,
                new.speaker_name,
                new.provider_bot_id,
            ],
            Self::from_row,
        );

        match inserted {
            Ok(event) => Ok(CreateOutcome {
                created: true,
                event: event?,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                let existing = Self::fetch_any(
                    conn,
                    &new.session_id,
                    &new.recording_id,
                    &new.trigger_event_id,
                )?
                .context("Trigger event vanished after unique-constraint conflict")?;
                Ok(CreateOutcome {
                    created: false,
                    event: existing,
                })
            }
            Err(e) => Err(e).context("Failed to insert trigger event"),
        }
    }

    /// Pure lookup on the composite key; soft-deleted rows are invisible here.
    pub fn get(
        conn: &Connection,
        session_id: &str,
        recording_id: &str,
        trigger_event_id: &str,
    ) -> Result<Option<TriggerEventRecord>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM trigger_events \
                     WHERE session_id = ?1 AND recording_id = ?2 AND trigger_event_id = ?3 \
                       AND deleted_at IS NULL"
                ),
                params![session_id, recording_id, trigger_event_id],
                Self::from_row,
            )
            .optional()
            .context("Failed to query trigger event")?;
        row.transpose()
    }

    /// Retention cleanup. The row stays in place, keeping the dedup key
    /// occupied.
    pub fn soft_delete(conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "UPDATE trigger_events SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?1",
            params![id],
        )
        .context("Failed to soft-delete trigger event")?;
        Ok(())
    }

    /// Lookup including soft-deleted rows, used by the dedup path only.
    fn fetch_any(
        conn: &Connection,
        session_id: &str,
        recording_id: &str,
        trigger_event_id: &str,
    ) -> Result<Option<TriggerEventRecord>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM trigger_events \
                     WHERE session_id = ?1 AND recording_id = ?2 AND trigger_event_id = ?3"
                ),
                params![session_id, recording_id, trigger_event_id],
                Self::from_row,
            )
            .optional()
            .context("Failed to fetch trigger event after conflict")?;
        row.transpose()
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<TriggerEventRecord>> {
        let data_json: String = row.get(5)?;
        let id: String = row.get(0)?;
        let session_id: String = row.get(1)?;
        let recording_id: String = row.get(2)?;
        let trigger_event_id: String = row.get(3)?;
        let action_name: String = row.get(4)?;
        let registration_id: String = row.get(6)?;
        let speaker_id: String = row.get(7)?;
        let speaker_name: Option<String> = row.get(8)?;
        let provider_bot_id: String = row.get(9)?;
        let created_at: String = row.get(10)?;
        let deleted_at: Option<String> = row.get(11)?;

        Ok(serde_json::from_str(&data_json)
            .context("Failed to parse trigger event data")
            .map(|data| TriggerEventRecord {
                id,
                session_id,
                recording_id,
                trigger_event_id,
                action_name,
                data,
                registration_id,
                speaker_id,
                speaker_name,
                provider_bot_id,
                created_at,
                deleted_at,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn
    }

    fn new_event(bucket: &str) -> NewTriggerEvent {
        let mut data = BTreeMap::new();
        data.insert("channelName".to_string(), "dogs".to_string());
        NewTriggerEvent {
            session_id: "session_1".to_string(),
            recording_id: "rec-1".to_string(),
            trigger_event_id: bucket.to_string(),
            action_name: "Ping slack channel".to_string(),
            data,
            registration_id: "reg_1".to_string(),
            speaker_id: "100".to_string(),
            speaker_name: Some("Gerry".to_string()),
            provider_bot_id: "provider-1".to_string(),
        }
    }

    #[test]
    fn test_create_new_event() {
        let conn = setup_db();
        let outcome = TriggerEventRepository::create_if_absent(&conn, &new_event("20")).unwrap();
        assert!(outcome.created);
        assert!(outcome.event.id.starts_with("trig_"));
        assert_eq!(outcome.event.trigger_event_id, "20");
        assert_eq!(outcome.event.data.get("channelName").unwrap(), "dogs");
    }

    #[test]
    fn test_duplicate_key_returns_existing() {
        let conn = setup_db();
        let first = TriggerEventRepository::create_if_absent(&conn, &new_event("30")).unwrap();
        assert!(first.created);

        // Second window with a slightly different payload but the same bucket
        let mut dup = new_event("30");
        dup.data
            .insert("channelName".to_string(), "cats".to_string());
        let second = TriggerEventRepository::create_if_absent(&conn, &dup).unwrap();

        assert!(!second.created);
        assert_eq!(second.event.id, first.event.id);
        // Existing payload wins; the duplicate's data is discarded
        assert_eq!(second.event.data.get("channelName").unwrap(), "dogs");
    }

    #[test]
    fn test_distinct_buckets_both_created() {
        let conn = setup_db();
        let a = TriggerEventRepository::create_if_absent(&conn, &new_event("10")).unwrap();
        let b = TriggerEventRepository::create_if_absent(&conn, &new_event("20")).unwrap();
        assert!(a.created);
        assert!(b.created);
        assert_ne!(a.event.id, b.event.id);
    }

    #[test]
    fn test_get_excludes_soft_deleted() {
        let conn = setup_db();
        let outcome = TriggerEventRepository::create_if_absent(&conn, &new_event("20")).unwrap();

        TriggerEventRepository::soft_delete(&conn, &outcome.event.id).unwrap();

        let found = TriggerEventRepository::get(&conn, "session_1", "rec-1", "20").unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_soft_deleted_still_blocks_recreation() {
        let conn = setup_db();
        let outcome = TriggerEventRepository::create_if_absent(&conn, &new_event("20")).unwrap();
        TriggerEventRepository::soft_delete(&conn, &outcome.event.id).unwrap();

        let replay = TriggerEventRepository::create_if_absent(&conn, &new_event("20")).unwrap();
        assert!(!replay.created);
        assert_eq!(replay.event.id, outcome.event.id);
        assert!(replay.event.deleted_at.is_some());
    }
}
