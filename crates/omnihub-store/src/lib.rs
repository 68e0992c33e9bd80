//! Durable config and trace storage over SQLite.
//!
//! A single [`ConfigStore`] owns the connection and exposes transactional
//! CRUD on tenant instances, access rules and user identities, plus
//! append-style writes and bounded range-scan reads for message traces.
//! Writes go through `spawn_blocking`; the connection is never held across
//! an await point.

mod instances;
mod migrations;
mod traces;

pub use traces::{AnalyticsSummary, CountBucket, TraceQuery};

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

/// Errors the store distinguishes for its callers. The admin surface maps
/// these onto HTTP statuses (404 / 409 / 5xx).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("cannot delete the last remaining instance")]
    LastInstance,
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Persistence(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Persistence(format!("blocking task failed: {err}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Persistence(format!("json: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Clone)]
pub struct ConfigStore {
    db: Arc<Mutex<Connection>>,
}

impl ConfigStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn db(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }
}

pub(crate) fn lock_err() -> StoreError {
    StoreError::Persistence("failed to lock sqlite connection".into())
}

pub(crate) fn parse_dt(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
