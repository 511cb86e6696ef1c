//! # Sync Cursor Protocol
//!
//! Lets an uploader walk one record kind incrementally by row id, starting
//! after the last acknowledged checkpoint.
//!
//! ## The Problem
//!
//! A record edited three times after it was last synced looks like this:
//!
//! ```text
//!   checkpoint C = 4
//!   ──────────────────────────────────────────────────────────────
//!   id=3  live    Bolus 2.0U               (id <= C, already synced once)
//!   id=5  historic ref=3  Bolus 1.0U       first value
//!   id=6  historic ref=3  Bolus 1.5U       second value
//!   id=7  historic ref=3  Bolus 1.8U       third value
//!   id=8  live    Carbs 20g                unrelated new record
//! ```
//!
//! Shipping rows one by one would upload three stale values. Instead:
//!
//! 1. Take the first row with `id > C`.
//! 2. If it is historic, ship the *live* row it references.
//! 3. Advance over the whole consecutive run of rows (`id > C`) that belong
//!    to that same live row, so the three snapshots above cost one upload and
//!    the cursor lands on 7.
//!
//! The next call starts at 8. Every row is passed exactly once, in ascending
//! id order, and a stale value is never shipped.
//!
//! ## Resumability
//!
//! [`next_sync_element`] is read-only. The caller persists `advance_to` only
//! after the remote side acknowledged the unit; a crash in between simply
//! recomputes the same unit from the same checkpoint.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, instrument, warn};

use crate::api::TreatmentStore;
use crate::codec::{record_from_row, RECORD_COLUMNS};
use crate::error::Result;
use crate::reader;
use crate::types::{Record, RecordId, RecordKind};

// =============================================================================
// Protocol
// =============================================================================

/// One unit of sync work.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncUnit {
    /// The live value to upload.
    pub payload: Record,
    /// Checkpoint to persist once the upload is acknowledged.
    pub advance_to: RecordId,
}

/// Result of one protocol step.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStep {
    NoMoreWork,
    Unit(SyncUnit),
}

/// Computes the next unit of work after `checkpoint`.
///
/// Runs inside one read transaction so the row, its live value and the run
/// boundary all come from the same snapshot.
pub fn next_sync_element(conn: &Connection, kind: RecordKind, checkpoint: RecordId) -> Result<SyncStep> {
    let tx = conn.unchecked_transaction()?;
    let step = next_sync_element_in(&tx, kind, checkpoint)?;
    tx.finish()?;
    Ok(step)
}

fn next_sync_element_in(conn: &Connection, kind: RecordKind, checkpoint: RecordId) -> Result<SyncStep> {
    let table = kind.table();
    let after = checkpoint.as_raw() as i64;

    let sql = format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE id > ?1 ORDER BY id ASC LIMIT 1");
    let next = conn
        .prepare_cached(&sql)?
        .query_row(params![after], |row| record_from_row(row, kind))
        .optional()?;

    let next = match next {
        Some(record) => record,
        None => return Ok(SyncStep::NoMoreWork),
    };

    let live = match next.reference_id {
        None => next,
        Some(live_id) => match reader::find_current_by_id(conn, kind, live_id)? {
            Some(live) => live,
            None => {
                warn!(%kind, historic = %next.id, live = %live_id, "historic row references a missing live row");
                return Ok(SyncStep::NoMoreWork);
            }
        },
    };
    let live_id = live.id.as_raw() as i64;

    // First row after the checkpoint that is neither the live row nor one of
    // its snapshots ends the run.
    let boundary: Option<i64> = conn
        .prepare_cached(&format!(
            "SELECT MIN(id) FROM {table} WHERE id > ?1 AND NOT (id = ?2 OR reference_id IS ?2)"
        ))?
        .query_row(params![after, live_id], |row| row.get(0))?;

    let advance_to: i64 = match boundary {
        Some(end) => conn
            .prepare_cached(&format!("SELECT MAX(id) FROM {table} WHERE id > ?1 AND id < ?2"))?
            .query_row(params![after, end], |row| row.get(0))?,
        None => conn
            .prepare_cached(&format!("SELECT MAX(id) FROM {table} WHERE id > ?1"))?
            .query_row(params![after], |row| row.get(0))?,
    };

    Ok(SyncStep::Unit(SyncUnit {
        payload: live,
        advance_to: RecordId::from_raw(advance_to as u64),
    }))
}

// =============================================================================
// Sync Driver
// =============================================================================

/// Remote acknowledgement of one upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadAck {
    /// Identifier the remote side assigned, if it assigned one.
    pub remote_id: Option<String>,
}

/// A failed upload. The unit is retried on the next pass.
#[derive(Debug, thiserror::Error)]
#[error("upload failed: {0}")]
pub struct UploadError(pub String);

/// Transport-agnostic remote endpoint.
///
/// Uploads must be idempotent by `remote_id` or domain key: after a crash
/// between upload and checkpoint persistence the same unit is sent again.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, kind: RecordKind, record: &Record) -> std::result::Result<UploadAck, UploadError>;
}

/// Outcome of one [`SyncCursor::run`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Units uploaded and acknowledged.
    pub uploaded: usize,
    /// Remote ids written back to live rows.
    pub reconciled: usize,
    /// Checkpoint after the pass.
    pub checkpoint: RecordId,
    /// True when the pass stopped at a failed upload.
    pub interrupted: bool,
}

/// Drives the protocol for one record kind against an [`Uploader`].
///
/// Each acknowledged unit advances the durable checkpoint before the next one
/// is computed.
pub struct SyncCursor {
    store: TreatmentStore,
    kind: RecordKind,
    uploader: Arc<dyn Uploader>,
}

impl SyncCursor {
    pub fn new(store: TreatmentStore, kind: RecordKind, uploader: Arc<dyn Uploader>) -> Self {
        Self { store, kind, uploader }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Uploads until there is no more work or an upload fails.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn run(&self) -> Result<SyncReport> {
        let mut report = SyncReport {
            checkpoint: self.store.checkpoint(self.kind).await?,
            ..SyncReport::default()
        };

        loop {
            let unit = match self.store.next_sync_element(self.kind).await? {
                SyncStep::NoMoreWork => break,
                SyncStep::Unit(unit) => unit,
            };

            let ack = match self.uploader.upload(self.kind, &unit.payload).await {
                Ok(ack) => ack,
                Err(e) => {
                    warn!(error = %e, id = %unit.payload.id, "upload failed, checkpoint kept");
                    report.interrupted = true;
                    break;
                }
            };

            if let Some(remote_id) = ack.remote_id {
                if unit.payload.remote_id.as_deref() != Some(remote_id.as_str()) {
                    let mut with_id = unit.payload.clone();
                    with_id.remote_id = Some(remote_id);
                    let outcome = self.store.reconcile_remote_ids(vec![with_id]).await?;
                    report.reconciled += outcome.changes.reconciled.len();
                }
            }

            report.checkpoint = self.store.acknowledge(self.kind, unit.advance_to).await?;
            report.uploaded += 1;
            debug!(id = %unit.payload.id, checkpoint = %report.checkpoint, "unit acknowledged");
        }

        info!(
            uploaded = report.uploaded,
            reconciled = report.reconciled,
            checkpoint = %report.checkpoint,
            interrupted = report.interrupted,
            "sync pass finished"
        );
        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::insert_record;
    use crate::payload::{Bolus, BolusType, Carbs};
    use crate::schema::Database;

    fn bolus(amount: f64) -> Record {
        Record::new(1_000, Bolus::new(amount, BolusType::Normal))
    }

    fn historic(amount: f64, live: RecordId) -> Record {
        let mut record = bolus(amount);
        record.reference_id = Some(live);
        record
    }

    fn unit(step: SyncStep) -> SyncUnit {
        match step {
            SyncStep::Unit(unit) => unit,
            SyncStep::NoMoreWork => panic!("expected a unit"),
        }
    }

    #[test]
    fn test_empty_table_has_no_work() {
        let db = Database::open_in_memory().unwrap();
        let step = next_sync_element(db.connection(), RecordKind::Bolus, RecordId::NONE).unwrap();
        assert_eq!(step, SyncStep::NoMoreWork);
    }

    #[test]
    fn test_plain_rows_one_by_one() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let a = insert_record(conn, &bolus(1.0)).unwrap();
        let b = insert_record(conn, &bolus(2.0)).unwrap();

        let first = unit(next_sync_element(conn, RecordKind::Bolus, RecordId::NONE).unwrap());
        assert_eq!(first.payload.id, a);
        assert_eq!(first.advance_to, a);

        let second = unit(next_sync_element(conn, RecordKind::Bolus, first.advance_to).unwrap());
        assert_eq!(second.payload.id, b);
        assert_eq!(
            next_sync_element(conn, RecordKind::Bolus, second.advance_to).unwrap(),
            SyncStep::NoMoreWork
        );
    }

    /// Three edits after the checkpoint ship the live value once.
    #[test]
    fn test_historic_run_coalesces() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let live = insert_record(conn, &bolus(1.8)).unwrap();
        let checkpoint = live;
        insert_record(conn, &historic(1.0, live)).unwrap();
        insert_record(conn, &historic(1.5, live)).unwrap();
        let last = insert_record(conn, &historic(1.6, live)).unwrap();
        let other = insert_record(conn, &Record::new(0, Bolus::new(5.0, BolusType::Smb))).unwrap();

        let step = unit(next_sync_element(conn, RecordKind::Bolus, checkpoint).unwrap());
        assert_eq!(step.payload.id, live);
        assert_eq!(step.advance_to, last);

        let step = unit(next_sync_element(conn, RecordKind::Bolus, step.advance_to).unwrap());
        assert_eq!(step.payload.id, other);
    }

    #[test]
    fn test_run_stops_at_unrelated_row() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let live = insert_record(conn, &bolus(1.0)).unwrap();
        let h1 = insert_record(conn, &historic(0.5, live)).unwrap();
        insert_record(conn, &bolus(3.0)).unwrap();
        let h2 = insert_record(conn, &historic(0.7, live)).unwrap();

        let first = unit(next_sync_element(conn, RecordKind::Bolus, RecordId::NONE).unwrap());
        assert_eq!(first.payload.id, live);
        assert_eq!(first.advance_to, h1);

        let second = unit(next_sync_element(conn, RecordKind::Bolus, h1).unwrap());
        assert_ne!(second.payload.id, live);

        let third = unit(next_sync_element(conn, RecordKind::Bolus, second.advance_to).unwrap());
        assert_eq!(third.payload.id, live);
        assert_eq!(third.advance_to, h2);
    }

    #[test]
    fn test_missing_live_row_is_no_more_work() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        insert_record(conn, &historic(1.0, RecordId::from_raw(999))).unwrap();

        assert_eq!(
            next_sync_element(conn, RecordKind::Bolus, RecordId::NONE).unwrap(),
            SyncStep::NoMoreWork
        );
    }

    #[test]
    fn test_step_is_repeatable() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        insert_record(conn, &Record::new(0, Carbs::new(10.0))).unwrap();

        let a = next_sync_element(conn, RecordKind::Carbs, RecordId::NONE).unwrap();
        let b = next_sync_element(conn, RecordKind::Carbs, RecordId::NONE).unwrap();
        assert_eq!(a, b);
    }
}
