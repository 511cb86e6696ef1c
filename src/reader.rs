//! # Record Reader
//!
//! Read operations for TherapyDB. Readers query SQLite directly through their
//! own read-only connections; WAL mode guarantees that every statement sees a
//! committed snapshot, either before or after any given transaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Reader Pool                                │
//! │                                                                  │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐            │
//! │  │Reader 1 │  │Reader 2 │  │Reader 3 │  │Reader N │            │
//! │  │(thread) │  │(thread) │  │(thread) │  │(thread) │            │
//! │  └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘            │
//! │       └────────────┴─────┬──────┴────────────┘                  │
//! │                   shared job queue                               │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//!                       ┌─────────────┐
//!                       │   SQLite    │
//!                       │   (WAL)     │
//!                       └─────────────┘
//! ```
//!
//! ## Live, Valid, Historic
//!
//! | Query | `reference_id IS NULL` | `is_valid = 1` |
//! |-------|------------------------|----------------|
//! | [`find_current_by_id`] | yes | no |
//! | [`find_current_by_remote_id`] | yes | no |
//! | [`query_from_time`], [`query_from_time_to_time`] | yes | yes |
//! | [`query_including_invalid`] | yes | no |
//! | [`collect_new_since`] | no | no |

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, ToSql};
use tokio::sync::{mpsc, Mutex};

use crate::codec::{record_from_row, RECORD_COLUMNS};
use crate::error::Result;
use crate::types::{DeviceKey, Record, RecordId, RecordKind};

// =============================================================================
// Read Requests
// =============================================================================

/// A read job run against one reader's connection.
///
/// The job owns its reply channel, so the pool never needs to know the result
/// type.
pub type ReadJob = Box<dyn FnOnce(&Connection) + Send + 'static>;

/// Requests processed by the reader pool.
pub enum ReadRequest {
    Run(ReadJob),
    Shutdown,
}

/// Sort direction for time queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl Order {
    fn sql(&self) -> &'static str {
        match self {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        }
    }
}

// =============================================================================
// Direct Read Functions
// =============================================================================

fn query_records(
    conn: &Connection,
    kind: RecordKind,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, |row| record_from_row(row, kind))?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn query_one(
    conn: &Connection,
    kind: RecordKind,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Option<Record>> {
    let record = conn
        .prepare_cached(sql)?
        .query_row(params, |row| record_from_row(row, kind))
        .optional()?;
    Ok(record)
}

/// The live row `id`, regardless of validity.
///
/// Historic rows are never returned: looking up the id of a snapshot yields
/// `None`.
pub fn find_current_by_id(conn: &Connection, kind: RecordKind, id: RecordId) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?1 AND reference_id IS NULL",
        kind.table()
    );
    query_one(conn, kind, &sql, &[&(id.as_raw() as i64)])
}

/// Any row with `id`, live or historic.
pub fn find_by_id(conn: &Connection, kind: RecordKind, id: RecordId) -> Result<Option<Record>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?1", kind.table());
    query_one(conn, kind, &sql, &[&(id.as_raw() as i64)])
}

/// The live row carrying `remote_id`.
pub fn find_current_by_remote_id(
    conn: &Connection,
    kind: RecordKind,
    remote_id: &str,
) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} WHERE remote_id = ?1 AND reference_id IS NULL \
         ORDER BY id DESC LIMIT 1",
        kind.table()
    );
    query_one(conn, kind, &sql, &[&remote_id])
}

/// The live row originating from the device event `key`.
///
/// Looked up through the `device_key_hash` index; the full key is compared
/// as well so a hash collision cannot match a foreign row.
pub fn find_current_by_device(conn: &Connection, kind: RecordKind, key: &DeviceKey) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} \
         WHERE device_key_hash = ?1 AND pump_id = ?2 AND pump_type = ?3 AND pump_serial = ?4 \
           AND reference_id IS NULL \
         ORDER BY id DESC LIMIT 1",
        kind.table()
    );
    query_one(
        conn,
        kind,
        &sql,
        &[&key.hash(), &key.pump_id, &key.pump_type, &key.pump_serial],
    )
}

/// Valid live rows with `timestamp >= from`.
pub fn query_from_time(conn: &Connection, kind: RecordKind, from: i64, order: Order) -> Result<Vec<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} \
         WHERE is_valid = 1 AND reference_id IS NULL AND timestamp_ms >= ?1 \
         ORDER BY timestamp_ms {order}, id {order}",
        kind.table(),
        order = order.sql()
    );
    query_records(conn, kind, &sql, &[&from])
}

/// Valid live rows with `from <= timestamp <= to`.
pub fn query_from_time_to_time(
    conn: &Connection,
    kind: RecordKind,
    from: i64,
    to: i64,
    order: Order,
) -> Result<Vec<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} \
         WHERE is_valid = 1 AND reference_id IS NULL AND timestamp_ms >= ?1 AND timestamp_ms <= ?2 \
         ORDER BY timestamp_ms {order}, id {order}",
        kind.table(),
        order = order.sql()
    );
    query_records(conn, kind, &sql, &[&from, &to])
}

/// Live rows in the time range, invalid ones included.
///
/// `to = None` leaves the range open-ended.
pub fn query_including_invalid(
    conn: &Connection,
    kind: RecordKind,
    from: i64,
    to: Option<i64>,
    order: Order,
) -> Result<Vec<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} \
         WHERE reference_id IS NULL AND timestamp_ms >= ?1 AND timestamp_ms <= ?2 \
         ORDER BY timestamp_ms {order}, id {order}",
        kind.table(),
        order = order.sql()
    );
    query_records(conn, kind, &sql, &[&from, &to.unwrap_or(i64::MAX)])
}

/// Valid live rows whose effect window `[timestamp, timestamp + duration]`
/// touches `[from, to]`, by timestamp.
pub fn query_overlapping(conn: &Connection, kind: RecordKind, from: i64, to: i64) -> Result<Vec<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} \
         WHERE is_valid = 1 AND reference_id IS NULL \
           AND timestamp_ms <= ?2 AND timestamp_ms + duration_ms >= ?1 \
         ORDER BY timestamp_ms ASC, id ASC",
        kind.table()
    );
    query_records(conn, kind, &sql, &[&from, &to])
}

/// Rows created in `(since, until]`, paginated by creation time.
///
/// Historic rows are returned as they are. Used by the coarse export path,
/// not by live sync.
pub fn collect_new_since(
    conn: &Connection,
    kind: RecordKind,
    since_ms: i64,
    until_ms: i64,
    limit: usize,
    offset: usize,
) -> Result<Vec<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} \
         WHERE date_created_ms > ?1 AND date_created_ms <= ?2 \
         ORDER BY date_created_ms ASC, id ASC LIMIT ?3 OFFSET ?4",
        kind.table()
    );
    query_records(
        conn,
        kind,
        &sql,
        &[&since_ms, &until_ms, &(limit as i64), &(offset as i64)],
    )
}

/// Historic snapshots of live row `live_id`, oldest first.
pub fn history_of(conn: &Connection, kind: RecordKind, live_id: RecordId) -> Result<Vec<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} WHERE reference_id = ?1 ORDER BY id ASC",
        kind.table()
    );
    query_records(conn, kind, &sql, &[&(live_id.as_raw() as i64)])
}

/// Every row of `kind` in id order.
pub fn all_rows(conn: &Connection, kind: RecordKind) -> Result<Vec<Record>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM {} ORDER BY id ASC", kind.table());
    query_records(conn, kind, &sql, &[])
}

/// The acknowledged sync checkpoint of `kind`, [`RecordId::NONE`] if never set.
pub fn read_checkpoint(conn: &Connection, kind: RecordKind) -> Result<RecordId> {
    let last: Option<i64> = conn
        .prepare_cached("SELECT last_id FROM sync_checkpoints WHERE kind = ?1")?
        .query_row(params![kind.as_str()], |row| row.get(0))
        .optional()?;
    Ok(last.map_or(RecordId::NONE, |v| RecordId::from_raw(v as u64)))
}

// =============================================================================
// Reader Pool
// =============================================================================

/// Runs one reader of a pool sharing a single request queue.
///
/// Whichever reader locks the queue first takes the next job.
pub async fn run_reader_pooled(conn: Connection, rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        match request {
            Some(ReadRequest::Run(job)) => job(&conn),
            Some(ReadRequest::Shutdown) | None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
