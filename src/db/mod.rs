//! SQLite persistence layer.
//!
//! Raw SQL with rusqlite, no ORM. Each table gets its own repository module;
//! repositories are plain structs of associated functions taking a
//! `&Connection`. The `Database` handle wraps a single shared connection so
//! services can be constructed against a file-backed or in-memory store.

pub mod registrations;
pub mod sessions;
pub mod transcripts;
pub mod trigger_events;
pub mod webhook_events;
pub mod webhooks;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Clonable handle to the shared database connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (and migrate) the database at the default data path.
    pub fn open() -> Result<Self> {
        let db_path = crate::global::db_file()?;

        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        Self::open_at(&db_path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open database connection")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the shared connection. Never held across an await point.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Generate a prefixed row id, e.g. `whevt_6f9c…`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            provider_bot_id TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            deleted_at TIMESTAMP
        )",
        [],
    )
    .context("Failed to create sessions table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS webhooks (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            url TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            deleted_at TIMESTAMP
        )",
        [],
    )
    .context("Failed to create webhooks table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS registrations (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            action_name TEXT NOT NULL,
            webhook_id TEXT NOT NULL,
            fields TEXT NOT NULL DEFAULT '{}',
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            deleted_at TIMESTAMP
        )",
        [],
    )
    .context("Failed to create registrations table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_session ON registrations(session_id)",
        [],
    )
    .context("Failed to create registrations session index")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transcript_words (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            recording_id TEXT NOT NULL,
            speaker_id TEXT NOT NULL,
            speaker_name TEXT,
            word TEXT NOT NULL,
            start_time REAL NOT NULL,
            end_time REAL NOT NULL,
            confidence REAL NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )
    .context("Failed to create transcript_words table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transcript_words_speaker \
         ON transcript_words(session_id, recording_id, speaker_id, start_time)",
        [],
    )
    .context("Failed to create transcript_words speaker index")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trigger_events (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            recording_id TEXT NOT NULL,
            trigger_event_id TEXT NOT NULL,
            action_name TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            registration_id TEXT NOT NULL,
            speaker_id TEXT NOT NULL,
            speaker_name TEXT,
            provider_bot_id TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            deleted_at TIMESTAMP,
            UNIQUE(session_id, recording_id, trigger_event_id)
        )",
        [],
    )
    .context("Failed to create trigger_events table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            webhook_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            request_body TEXT NOT NULL,
            response_status INTEGER,
            response_body TEXT,
            request_sent_at TIMESTAMP,
            response_received_at TIMESTAMP,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_retry_at TIMESTAMP,
            failure_reason TEXT,
            status TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            deleted_at TIMESTAMP
        )",
        [],
    )
    .context("Failed to create webhook_events table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_webhook_events_status ON webhook_events(status)",
        [],
    )
    .context("Failed to create webhook_events status index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_webhook_events_webhook \
         ON webhook_events(webhook_id, created_at DESC)",
        [],
    )
    .context("Failed to create webhook_events webhook index")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
                 ('sessions', 'webhooks', 'registrations', 'transcript_words', \
                  'trigger_events', 'webhook_events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }

    #[test]
    fn test_new_id_prefix() {
        let id = new_id("whevt");
        assert!(id.starts_with("whevt_"));
        assert!(id.len() > "whevt_".len());
    }

    #[test]
    fn test_database_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transcript_words", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_database_open_at_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hark.db");
        let _db = Database::open_at(&path).unwrap();
        assert!(path.exists());
    }
}
