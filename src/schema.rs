//! # SQLite Schema for TherapyDB
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  one table per RecordKind (boluses, carbs, temporary_basals, ...)       │
//! │  ┌────────────────────────┐                                             │
//! │  │ id (PK, AUTOINCREMENT) │◄──┐                                         │
//! │  │ reference_id ──────────┼───┘  historic row -> live row               │
//! │  │ is_valid               │                                             │
//! │  │ timestamp_ms, ...      │                                             │
//! │  │ remote_id              │                                             │
//! │  │ pump_id/type/serial    │                                             │
//! │  │ device_key_hash        │                                             │
//! │  │ payload (JSON)         │                                             │
//! │  └────────────────────────┘                                             │
//! │                                                                         │
//! │  sync_checkpoints              therapydb_metadata                       │
//! │  ┌─────────────────┐           ┌─────────────┐                          │
//! │  │ kind (PK)       │           │ key (PK)    │                          │
//! │  │ last_id         │           │ value       │                          │
//! │  └─────────────────┘           └─────────────┘                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why AUTOINCREMENT?
//!
//! Plain `INTEGER PRIMARY KEY` may hand out the id of a deleted max row again.
//! The sync cursor orders by id and a retention purge deletes rows, so an id
//! that came back after a purge could be skipped by a checkpoint that already
//! passed it. `AUTOINCREMENT` keeps the high-water mark in `sqlite_sequence`.
//!
//! ### Why a JSON payload column?
//!
//! The eighteen record kinds share every column the store queries on. The rest
//! is only ever read back whole, so it lives in one JSON document per row.

use std::time::Duration;

use rusqlite::Connection;

use crate::types::RecordKind;
use crate::{Error, Result};

/// How long a connection waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: if the version doesn't match, opening fails.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Per-kind record table.
///
/// # Columns
///
/// - `id`: physical row identity, never reused
/// - `version`, `date_created_ms`: schema revision and creation time of the row
/// - `is_valid`: soft-delete flag (0/1)
/// - `reference_id`: NULL for live rows, live row id for historic rows
/// - `timestamp_ms`, `utc_offset_ms`, `duration_ms`: domain time
/// - `remote_id`: id assigned by the remote system
/// - `pump_id`, `pump_type`, `pump_serial`: device linkage
/// - `device_key_hash`: XXH3 of the full device key, NULL when incomplete
/// - `payload`: type-specific JSON
fn create_record_table(kind: RecordKind) -> String {
    let table = kind.table();
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    version         INTEGER NOT NULL,
    date_created_ms INTEGER NOT NULL,
    is_valid        INTEGER NOT NULL DEFAULT 1,
    reference_id    INTEGER,
    timestamp_ms    INTEGER NOT NULL,
    utc_offset_ms   INTEGER NOT NULL DEFAULT 0,
    duration_ms     INTEGER NOT NULL DEFAULT 0,
    remote_id       TEXT,
    pump_id         INTEGER,
    pump_type       TEXT,
    pump_serial     TEXT,
    device_key_hash INTEGER,
    payload         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS {table}_reference_id ON {table}(reference_id);
CREATE INDEX IF NOT EXISTS {table}_timestamp ON {table}(timestamp_ms);
CREATE INDEX IF NOT EXISTS {table}_remote_id ON {table}(remote_id);
CREATE INDEX IF NOT EXISTS {table}_device_key ON {table}(device_key_hash);
CREATE INDEX IF NOT EXISTS {table}_date_created ON {table}(date_created_ms);
"#
    )
}

/// Sync checkpoints, one row per record kind.
///
/// Owned by the sync subsystem. `last_id` only moves forward.
const CREATE_SYNC_CHECKPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS sync_checkpoints (
    kind    TEXT PRIMARY KEY,
    last_id INTEGER NOT NULL
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS therapydb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the TherapyDB schema applied.
///
/// # Ownership
///
/// `Database` owns its `Connection`. The writer takes the connection out with
/// [`Database::into_connection`] once the schema is in place.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        self.conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL: readers see the last committed snapshot while the writer works.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_SYNC_CHECKPOINTS)?;
        for kind in RecordKind::ALL {
            self.conn.execute_batch(&create_record_table(kind))?;
        }

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM therapydb_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO therapydb_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this TherapyDB version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Borrows the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutably borrows the underlying connection, e.g. to open a transaction.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Consumes the wrapper, returning the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
