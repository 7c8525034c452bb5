//! SQLite-backed record of every download session.
//!
//! The directory tree under the download root stays the source of truth for
//! what exists; the index adds what the filesystem cannot express reliably:
//! the instant a session was created (directory mtimes move whenever yt-dlp
//! writes a file) and the progress of the download feeding it.

use std::{fmt, path::Path, str::FromStr};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::translate::TranslatedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Directory allocated, tool not started yet.
    Pending,
    Running,
    Done,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Done => "done",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "done" => Ok(SessionStatus::Done),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(anyhow!("unknown session status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFailure {
    pub code: String,
    pub detail: String,
}

impl SessionFailure {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
        }
    }
}

impl From<&TranslatedError> for SessionFailure {
    fn from(error: &TranslatedError) -> Self {
        Self::new(error.code.as_str(), error.detail.clone())
    }
}

/// One row of the `sessions` table, serialized as-is by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub download_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Single shared connection guarded by a mutex. Every statement is short, so
/// serializing access costs less than juggling a pool.
pub struct SessionIndex {
    conn: Mutex<Connection>,
}

impl fmt::Debug for SessionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIndex").finish_non_exhaustive()
    }
}

impl SessionIndex {
    /// Opens (and if necessary creates) the database and its schema. WAL mode
    /// keeps the sweep binary from blocking the server.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating index directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening session index {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for session index")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting session index synchronous mode")?;

        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory session index")?;
        Self::with_schema(conn)
    }

    fn with_schema(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                error_code TEXT,
                error_detail TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .context("creating sessions table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, id: &str, created_at: DateTime<Utc>) -> Result<()> {
        let millis = created_at.timestamp_millis();
        self.conn
            .lock()
            .execute(
                r#"
                INSERT INTO sessions (id, status, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?3)
                ON CONFLICT(id) DO NOTHING
                "#,
                params![id, SessionStatus::Pending.as_str(), millis],
            )
            .with_context(|| format!("recording session {id}"))?;
        Ok(())
    }

    /// Moves a session to `status`. A failure replaces any earlier error; any
    /// other status clears it.
    pub fn set_status(
        &self,
        id: &str,
        status: SessionStatus,
        failure: Option<&SessionFailure>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let (code, detail) = match failure {
            Some(failure) => (Some(failure.code.as_str()), Some(failure.detail.as_str())),
            None => (None, None),
        };
        let updated = self
            .conn
            .lock()
            .execute(
                r#"
                UPDATE sessions
                SET status = ?2, error_code = ?3, error_detail = ?4, updated_at = ?5
                WHERE id = ?1
                "#,
                params![id, status.as_str(), code, detail, now],
            )
            .with_context(|| format!("updating session {id}"))?;

        if updated == 0 {
            return Err(anyhow!("session {id} is not indexed"));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, status, error_code, error_detail, created_at, updated_at
            FROM sessions
            WHERE id = ?1
            "#,
        )?;
        let raw = stmt
            .query_row([id], RawRow::from_row)
            .optional()
            .with_context(|| format!("reading session {id}"))?;
        raw.map(RawRow::into_record).transpose()
    }

    pub fn created_at(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get(id)?.map(|record| record.created_at))
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM sessions ORDER BY created_at")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("listing indexed sessions")?;
        Ok(ids)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .with_context(|| format!("forgetting session {id}"))?;
        Ok(())
    }
}

/// Column values copied out of a row so conversion errors can use `anyhow`
/// instead of `rusqlite::Error`.
struct RawRow {
    id: String,
    status: String,
    error_code: Option<String>,
    error_detail: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            status: row.get("status")?,
            error_code: row.get("error_code")?,
            error_detail: row.get("error_detail")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<SessionRecord> {
        let error = self.error_code.map(|code| SessionFailure {
            code,
            detail: self.error_detail.unwrap_or_default(),
        });
        Ok(SessionRecord {
            status: self.status.parse()?,
            error,
            created_at: millis_to_datetime(self.created_at)?,
            updated_at: millis_to_datetime(self.updated_at)?,
            download_id: self.id,
        })
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("stored timestamp {millis} is out of range"))
}
