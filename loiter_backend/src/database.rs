use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::transport::{ChannelId, MessageId, UserId};

pub const PRESENCE_ENABLED_STATE_KEY: &str = "presence_enabled";

/// Candidate rows scanned per archive search before ranking.
const ARCHIVE_SCAN_LIMIT: usize = 250;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationRecord {
    pub id: String,
    pub user_id: UserId,
    pub user_name: String,
    pub reasons: Vec<String>,
    pub restricted: bool,
    pub created_at: DateTime<Utc>,
}

pub struct EngineDatabase {
    conn: Mutex<Connection>,
}

impl EngineDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS message_archive (
                id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                author_id INTEGER NOT NULL,
                author_name TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (channel_id, id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS moderation_log (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                user_name TEXT NOT NULL,
                reasons TEXT NOT NULL,
                restricted INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_message_archive_created_at ON message_archive(created_at DESC)",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Key/value state
    // ========================================================================

    /// Get a state value
    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM agent_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a state value
    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO agent_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Persisted on/off toggle. Absent means disabled.
    pub fn presence_enabled(&self) -> Result<bool> {
        Ok(self
            .get_state(PRESENCE_ENABLED_STATE_KEY)?
            .map(|v| v == "true")
            .unwrap_or(false))
    }

    pub fn set_presence_enabled(&self, enabled: bool) -> Result<()> {
        self.set_state(
            PRESENCE_ENABLED_STATE_KEY,
            if enabled { "true" } else { "false" },
        )
    }

    // ========================================================================
    // Message archive
    // ========================================================================

    pub fn archive_message(&self, message: &ArchivedMessage) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO message_archive (id, channel_id, author_id, author_name, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.channel_id,
                message.author_id,
                message.author_name,
                message.text,
                message.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to archive message")?;
        Ok(())
    }

    /// Recent archived messages containing any keyword, best keyword coverage first.
    pub fn search_archive(&self, keywords: &[String], limit: usize) -> Result<Vec<ArchivedMessage>> {
        if keywords.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let clauses = vec!["LOWER(text) LIKE ?"; keywords.len()].join(" OR ");
        let sql = format!(
            "SELECT id, channel_id, author_id, author_name, text, created_at
             FROM message_archive WHERE {} ORDER BY created_at DESC LIMIT {}",
            clauses, ARCHIVE_SCAN_LIMIT
        );
        let patterns: Vec<String> = keywords
            .iter()
            .map(|k| format!("%{}%", k.to_lowercase()))
            .collect();

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(patterns.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut scored = Vec::with_capacity(rows.len());
        for (id, channel_id, author_id, author_name, text, created_at) in rows {
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .with_context(|| format!("Invalid archive timestamp: {}", created_at))?
                .with_timezone(&Utc);
            let lower = text.to_lowercase();
            let hits = keywords
                .iter()
                .filter(|k| lower.contains(&k.to_lowercase()))
                .count();
            scored.push((
                hits,
                ArchivedMessage {
                    id,
                    channel_id,
                    author_id,
                    author_name,
                    text,
                    created_at,
                },
            ));
        }

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        });
        Ok(scored.into_iter().take(limit).map(|(_, m)| m).collect())
    }

    // ========================================================================
    // Moderation log
    // ========================================================================

    pub fn record_moderation(&self, record: &ModerationRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO moderation_log (id, user_id, user_name, reasons, restricted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.user_id,
                record.user_name,
                serde_json::to_string(&record.reasons)?,
                record.restricted as i64,
                record.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to write moderation log")?;
        Ok(())
    }

    pub fn recent_moderation(&self, limit: usize) -> Result<Vec<ModerationRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, user_name, reasons, restricted, created_at
             FROM moderation_log ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, user_id, user_name, reasons, restricted, created_at)| {
                Ok(ModerationRecord {
                    id,
                    user_id,
                    user_name,
                    reasons: serde_json::from_str(&reasons)
                        .context("Invalid moderation reasons payload")?,
                    restricted: restricted != 0,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .with_context(|| format!("Invalid moderation timestamp: {}", created_at))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }
}
