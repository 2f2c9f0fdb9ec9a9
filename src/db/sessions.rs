//! Session configuration rows.
//!
//! A session ties a bot-attended meeting to its wake word and owner. Rows are
//! written by the management surface; the pipeline only reads them to resolve
//! incoming provider callbacks.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// A session record from the database.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    /// The spoken wake word that opens a trigger window (the bot's name).
    pub name: String,
    pub provider_bot_id: String,
    pub user_id: String,
    pub created_at: String,
}

pub struct SessionRepository;

impl SessionRepository {
    pub fn insert(
        conn: &Connection,
        name: &str,
        provider_bot_id: &str,
        user_id: &str,
    ) -> Result<SessionRecord> {
        let id = crate::db::new_id("session");
        conn.query_row(
            "INSERT INTO sessions (id, name, provider_bot_id, user_id) \
             VALUES (?1, ?2, ?3, ?4) \
             RETURNING id, name, provider_bot_id, user_id, created_at",
            params![id, name, provider_bot_id, user_id],
            Self::from_row,
        )
        .context("Failed to insert session")
    }

    /// Resolve the session an incoming provider callback belongs to.
    pub fn get_by_provider_bot_id(
        conn: &Connection,
        provider_bot_id: &str,
    ) -> Result<Option<SessionRecord>> {
        conn.query_row(
            "SELECT id, name, provider_bot_id, user_id, created_at \
             FROM sessions WHERE provider_bot_id = ?1 AND deleted_at IS NULL",
            params![provider_bot_id],
            Self::from_row,
        )
        .optional()
        .context("Failed to query session by provider bot id")
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<SessionRecord>> {
        conn.query_row(
            "SELECT id, name, provider_bot_id, user_id, created_at \
             FROM sessions WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
            Self::from_row,
        )
        .optional()
        .context("Failed to query session")
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
        Ok(SessionRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            provider_bot_id: row.get(2)?,
            user_id: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}
