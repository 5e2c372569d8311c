//! SQLite storage layer.
//!
//! Single source of truth for item state. Every operation opens its own
//! connection, so the engine holds no in-process lock; all mutual exclusion
//! comes from SQLite's write lock taken by `BEGIN IMMEDIATE`. That holds
//! across threads and across separate processes sharing the file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::error::{Error, Result};
use crate::model::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS images (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        filename    TEXT UNIQUE NOT NULL,
        status      TEXT NOT NULL DEFAULT 'pending',
        labels_json TEXT,
        reserved_by TEXT,
        reserved_at TEXT,
        skipped     INTEGER NOT NULL DEFAULT 0,
        updated_at  TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_images_status ON images(status, id);
";

/// Column list matching [`row_to_item`].
pub(crate) const ITEM_COLUMNS: &str =
    "id, filename, status, labels_json, skipped, reserved_by, reserved_at, updated_at";

/// Storage backend. Knows where the database lives; owns no connection.
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Storage {
    /// Open or create a database at the given path and apply the schema.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Other(format!("cannot create database directory {}: {e}", parent.display()))
            })?;
        }

        let storage = Self { path, busy_timeout };
        let conn = storage.connect()?;
        // WAL lets readers proceed while a writer holds the lock. The mode is
        // persistent, so setting it once here covers later connections.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Run `f` inside an IMMEDIATE write transaction.
    ///
    /// The write lock is taken before the first read, so a select-then-update
    /// inside `f` cannot interleave with another writer. Commits if `f`
    /// returns Ok, rolls back otherwise. Waiting on the lock longer than the
    /// busy timeout fails with `Error::Store`.
    pub(crate) fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Run `f` against a fresh read connection.
    pub(crate) fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    /// Get an item by id.
    pub fn get_item(&self, id: ItemId) -> Result<Item> {
        self.read(|conn| fetch_item(conn, id)?.ok_or(Error::NotFound(id)))
    }

    /// List items matching `filter`, ordered by id.
    pub fn list_items(&self, filter: ItemFilter) -> Result<Vec<Item>> {
        self.read(|conn| list_items_on(conn, filter))
    }

    /// Count items per state.
    pub fn count_states(&self) -> Result<StateCounts> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(skipped), 0) FROM images GROUP BY status",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut counts = StateCounts::default();
            for (status, count, skipped) in rows {
                let count = count as u64;
                match status.parse::<ItemState>()? {
                    ItemState::Pending => counts.pending = count,
                    ItemState::InProgress => counts.in_progress = count,
                    ItemState::Done => {
                        counts.done = count;
                        counts.skipped = skipped as u64;
                    }
                }
            }
            Ok(counts)
        })
    }
}

// ---------------------------------------------------------------------------
// Inner functions. They take &Connection so they work both on a plain
// connection and inside a Transaction (which derefs to Connection).
// ---------------------------------------------------------------------------

pub(crate) fn fetch_item(conn: &Connection, id: ItemId) -> Result<Option<Item>> {
    let item = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM images WHERE id = ?1"),
            params![id.0],
            row_to_item,
        )
        .optional()?;
    Ok(item)
}

pub(crate) fn list_items_on(conn: &Connection, filter: ItemFilter) -> Result<Vec<Item>> {
    let mut sql = format!("SELECT {ITEM_COLUMNS} FROM images");
    if filter.state.is_some() {
        sql.push_str(" WHERE status = ?1");
    }
    sql.push_str(" ORDER BY id");
    // SQLite treats a negative LIMIT as unbounded.
    let limit = match filter.limit {
        Some(n) if n > 0 => i64::try_from(n).unwrap_or(i64::MAX),
        _ => -1,
    };
    sql.push_str(if filter.state.is_some() { " LIMIT ?2" } else { " LIMIT ?1" });

    let mut stmt = conn.prepare(&sql)?;
    let items = match filter.state {
        Some(state) => stmt
            .query_map(params![state.as_str(), limit], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt
            .query_map(params![limit], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };
    Ok(items)
}

/// Every `filename` currently registered.
pub(crate) fn known_source_refs(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT filename FROM images")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(names)
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 in UTC with microseconds and a `Z` suffix.
///
/// Every stored timestamp has the same width, so `reserved_at <= ?` in SQL
/// compares chronologically.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn encode_labels(labels: &Labels) -> Result<String> {
    Ok(serde_json::to_string(labels)?)
}

fn decode_payload(raw: String) -> Option<Payload> {
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<Labels>(&raw) {
        Ok(labels) => Some(Payload::Labels(labels)),
        Err(_) => Some(Payload::Raw(raw)),
    }
}

fn conversion_error<E>(col: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    let status: String = row.get(2)?;
    let state = status
        .parse::<ItemState>()
        .map_err(|e| conversion_error(2, e))?;

    let token: Option<String> = row.get(5)?;
    let reserved_at: Option<String> = row.get(6)?;
    let lease = match (state, token, reserved_at) {
        (ItemState::InProgress, Some(token), Some(at)) => Some(Lease {
            token: LeaseToken::from(token),
            granted_at: decode_ts(&at).map_err(|e| conversion_error(6, e))?,
        }),
        _ => None,
    };

    let updated_at = row
        .get::<_, Option<String>>(7)?
        .map(|s| decode_ts(&s))
        .transpose()
        .map_err(|e| conversion_error(7, e))?;

    Ok(Item {
        id: ItemId(row.get(0)?),
        source_ref: row.get(1)?,
        state,
        lease,
        payload: row.get::<_, Option<String>>(3)?.and_then(decode_payload),
        skipped: row.get::<_, i64>(4)? != 0,
        updated_at,
    })
}
