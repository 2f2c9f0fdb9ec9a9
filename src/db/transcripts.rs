//! Transcript word persistence.
//!
//! Words are append-only and never rejected: low-confidence words are stored
//! as-is, and a downstream matching failure never rolls a batch back.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

/// One recognized spoken word, as stored.
#[derive(Debug, Clone)]
pub struct TranscriptWord {
    pub id: i64,
    pub session_id: String,
    pub recording_id: String,
    pub speaker_id: String,
    pub speaker_name: Option<String>,
    /// Normalized lowercase text.
    pub word: String,
    /// Offsets in seconds from session start.
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
    pub created_at: String,
}

/// An incoming word from the provider callback, before storage.
#[derive(Debug, Clone)]
pub struct SpokenWord {
    pub word: String,
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
}

pub struct TranscriptRepository;

impl TranscriptRepository {
    /// Append a batch of words for one (session, recording, speaker).
    /// Word text is lowercased on the way in.
    pub fn insert_batch(
        conn: &Connection,
        session_id: &str,
        recording_id: &str,
        speaker_id: &str,
        speaker_name: Option<&str>,
        words: &[SpokenWord],
    ) -> Result<usize> {
        let mut stmt = conn
            .prepare(
                "INSERT INTO transcript_words \
                 (session_id, recording_id, speaker_id, speaker_name, word, \
                  start_time, end_time, confidence) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .context("Failed to prepare transcript insert")?;

        for word in words {
            stmt.execute(params![
                session_id,
                recording_id,
                speaker_id,
                speaker_name,
                word.word.to_lowercase(),
                word.start_time,
                word.end_time,
                word.confidence,
            ])
            .context("Failed to insert transcript word")?;
        }

        Ok(words.len())
    }

    /// All words for one speaker in a recording, ordered by start offset.
    /// With `from`, only words starting at or after that offset.
    pub fn for_speaker(
        conn: &Connection,
        session_id: &str,
        recording_id: &str,
        speaker_id: &str,
        from: Option<f64>,
    ) -> Result<Vec<TranscriptWord>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, recording_id, speaker_id, speaker_name, word, \
                 start_time, end_time, confidence, created_at \
                 FROM transcript_words \
                 WHERE session_id = ?1 AND recording_id = ?2 AND speaker_id = ?3 \
                   AND (?4 IS NULL OR start_time >= ?4) \
                 ORDER BY start_time ASC, id ASC",
            )
            .context("Failed to prepare transcript query")?;

        let rows = stmt
            .query_map(params![session_id, recording_id, speaker_id, from], |row| {
                Ok(TranscriptWord {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    recording_id: row.get(2)?,
                    speaker_id: row.get(3)?,
                    speaker_name: row.get(4)?,
                    word: row.get(5)?,
                    start_time: row.get(6)?,
                    end_time: row.get(7)?,
                    confidence: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })
            .context("Failed to query transcript words")?;

        let mut words = Vec::new();
        for row in rows {
            words.push(row?);
        }
        Ok(words)
    }

    pub fn count(conn: &Connection, session_id: &str, recording_id: &str) -> Result<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM transcript_words \
             WHERE session_id = ?1 AND recording_id = ?2",
            params![session_id, recording_id],
            |row| row.get(0),
        )
        .context("Failed to count transcript words")
    }
}
