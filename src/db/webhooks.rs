//! Destination webhook rows.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone)]
pub struct WebhookRecord {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub created_at: String,
}

pub struct WebhookRepository;

impl WebhookRepository {
    pub fn insert(conn: &Connection, user_id: &str, url: &str) -> Result<WebhookRecord> {
        let id = crate::db::new_id("wh");
        conn.query_row(
            "INSERT INTO webhooks (id, user_id, url) VALUES (?1, ?2, ?3) \
             RETURNING id, user_id, url, created_at",
            params![id, user_id, url],
            Self::from_row,
        )
        .context("Failed to insert webhook")
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<WebhookRecord>> {
        conn.query_row(
            "SELECT id, user_id, url, created_at \
             FROM webhooks WHERE id = ?1 AND deleted_at IS NULL",
            params![id],
            Self::from_row,
        )
        .optional()
        .context("Failed to query webhook")
    }

    pub fn soft_delete(conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "UPDATE webhooks SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?1",
            params![id],
        )
        .context("Failed to soft-delete webhook")?;
        Ok(())
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookRecord> {
        Ok(WebhookRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            url: row.get(2)?,
            created_at: row.get(3)?,
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

    #[test]
    fn test_insert_and_get() {
        let conn = setup_db();
        let webhook =
            WebhookRepository::insert(&conn, "user_1", "https://example.com/hook").unwrap();
        assert!(webhook.id.starts_with("wh_"));

        let found = WebhookRepository::get(&conn, &webhook.id).unwrap().unwrap();
        assert_eq!(found.url, "https://example.com/hook");
        assert_eq!(found.user_id, "user_1");
    }

    #[test]
    fn test_soft_deleted_not_returned() {
        let conn = setup_db();
        let webhook =
            WebhookRepository::insert(&conn, "user_1", "https://example.com/hook").unwrap();

        WebhookRepository::soft_delete(&conn, &webhook.id).unwrap();
        assert!(WebhookRepository::get(&conn, &webhook.id).unwrap().is_none());
    }
}
