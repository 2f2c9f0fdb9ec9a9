//! Registration rows: the binding between a session and a configured action.
//!
//! Each registration names the action, points at the destination webhook, and
//! carries the configured field values. Unfilled fields hold a `{{command}}`
//! style placeholder for the matcher to extract from speech.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct RegistrationRecord {
    pub id: String,
    pub session_id: String,
    pub action_name: String,
    pub webhook_id: String,
    /// Configured field values, key → value-or-placeholder.
    pub fields: BTreeMap<String, String>,
    pub created_at: String,
}

pub struct RegistrationRepository;

impl RegistrationRepository {
    pub fn insert(
        conn: &Connection,
        session_id: &str,
        action_name: &str,
        webhook_id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<RegistrationRecord> {
        let id = crate::db::new_id("reg");
        let fields_json =
            serde_json::to_string(fields).context("Failed to serialize registration fields")?;
        conn.query_row(
            "INSERT INTO registrations (id, session_id, action_name, webhook_id, fields) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             RETURNING id, session_id, action_name, webhook_id, fields, created_at",
            params![id, session_id, action_name, webhook_id, fields_json],
            Self::from_row,
        )?
        .context("Failed to insert registration")
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<RegistrationRecord>> {
        let row = conn
            .query_row(
                "SELECT id, session_id, action_name, webhook_id, fields, created_at \
                 FROM registrations WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                Self::from_row,
            )
            .optional()
            .context("Failed to query registration")?;
        row.transpose()
    }

    /// All live registrations for a session, in creation order.
    pub fn list_for_session(
        conn: &Connection,
        session_id: &str,
    ) -> Result<Vec<RegistrationRecord>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, action_name, webhook_id, fields, created_at \
                 FROM registrations WHERE session_id = ?1 AND deleted_at IS NULL \
                 ORDER BY created_at ASC, id ASC",
            )
            .context("Failed to prepare registrations query")?;

        let rows = stmt
            .query_map(params![session_id], Self::from_row)
            .context("Failed to query registrations")?;

        let mut registrations = Vec::new();
        for row in rows {
            registrations.push(row??);
        }
        Ok(registrations)
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<RegistrationRecord>> {
        let fields_json: String = row.get(4)?;
        Ok(Self::build(
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            fields_json,
            row.get(5)?,
        ))
    }

    fn build(
        id: String,
        session_id: String,
        action_name: String,
        webhook_id: String,
        fields_json: String,
        created_at: String,
    ) -> Result<RegistrationRecord> {
        let fields: BTreeMap<String, String> = serde_json::from_str(&fields_json)
            .context("Failed to parse registration fields")?;
        Ok(RegistrationRecord {
            id,
            session_id,
            action_name,
            webhook_id,
            fields,
            created_at,
        })
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

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_insert_and_get() {
        let conn = setup_db();
        let reg = RegistrationRepository::insert(
            &conn,
            "session_1",
            "Ping slack channel",
            "wh_1",
            &fields(&[("channelName", "{{command}}")]),
        )
        .unwrap();

        let found = RegistrationRepository::get(&conn, &reg.id).unwrap().unwrap();
        assert_eq!(found.action_name, "Ping slack channel");
        assert_eq!(found.fields.get("channelName").unwrap(), "{{command}}");
    }

    #[test]
    fn test_list_for_session() {
        let conn = setup_db();
        RegistrationRepository::insert(&conn, "session_1", "First", "wh_1", &fields(&[]))
            .unwrap();
        RegistrationRepository::insert(&conn, "session_1", "Second", "wh_1", &fields(&[]))
            .unwrap();
        RegistrationRepository::insert(&conn, "session_2", "Other", "wh_2", &fields(&[]))
            .unwrap();

        let regs = RegistrationRepository::list_for_session(&conn, "session_1").unwrap();
        assert_eq!(regs.len(), 2);
        assert_eq!(regs[0].action_name, "First");
    }

    #[test]
    fn test_list_empty_session() {
        let conn = setup_db();
        let regs = RegistrationRepository::list_for_session(&conn, "session_x").unwrap();
        assert!(regs.is_empty());
    }
}
