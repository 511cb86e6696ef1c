//! # Interval Resolver
//!
//! Answers "which value is active at time T" for interval-valued kinds
//! (temporary basal, extended bolus, temporary target, running mode, profile
//! switches).
//!
//! Two candidates are looked up independently:
//!
//! ```text
//!   temporary:  duration > 0  and  timestamp <= T < timestamp + duration
//!   permanent:  duration = 0  and  timestamp <= T   (latest one)
//!
//!   permanent  ├───────────────────────────────────────────────►
//!   temporary              ├──────────┤
//!                     T1 ▲      T2 ▲          T3 ▲
//!                   permanent  temporary   permanent
//! ```
//!
//! When both exist the later start wins, so a permanent change issued during
//! a temporary one takes over immediately and vice versa.
//!
//! Only valid, live rows take part.

use rusqlite::{params, Connection, OptionalExtension};

use crate::codec::{record_from_row, RECORD_COLUMNS};
use crate::error::Result;
use crate::payload::{Mode, RunningMode};
use crate::types::{Record, RecordKind};

/// Picks the active value from the two candidates.
///
/// Ties on timestamp go to the temporary candidate.
pub fn resolve(temporary: Option<Record>, permanent: Option<Record>) -> Option<Record> {
    match (temporary, permanent) {
        (Some(t), Some(p)) => {
            if p.timestamp_ms > t.timestamp_ms {
                Some(p)
            } else {
                Some(t)
            }
        }
        (Some(t), None) => Some(t),
        (None, Some(p)) => Some(p),
        (None, None) => None,
    }
}

/// The temporary instance of `kind` covering `at`, if any.
pub fn temporary_at(conn: &Connection, kind: RecordKind, at: i64) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} \
         WHERE is_valid = 1 AND reference_id IS NULL AND duration_ms > 0 \
           AND timestamp_ms <= ?1 AND timestamp_ms + duration_ms > ?1 \
         ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
        kind.table()
    );
    let record = conn
        .prepare_cached(&sql)?
        .query_row(params![at], |row| record_from_row(row, kind))
        .optional()?;
    Ok(record)
}

/// The latest permanent instance of `kind` started at or before `at`.
pub fn permanent_at(conn: &Connection, kind: RecordKind, at: i64) -> Result<Option<Record>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM {} \
         WHERE is_valid = 1 AND reference_id IS NULL AND duration_ms = 0 AND timestamp_ms <= ?1 \
         ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
        kind.table()
    );
    let record = conn
        .prepare_cached(&sql)?
        .query_row(params![at], |row| record_from_row(row, kind))
        .optional()?;
    Ok(record)
}

/// Resolves the value of `kind` active at `at`.
pub fn active_at(conn: &Connection, kind: RecordKind, at: i64) -> Result<Option<Record>> {
    let temporary = temporary_at(conn, kind, at)?;
    let permanent = permanent_at(conn, kind, at)?;
    Ok(resolve(temporary, permanent))
}

/// Like [`active_at`], but running mode falls back to `default_mode`.
///
/// The fallback is a synthetic, unsaved record at `at`.
pub fn active_at_or_default(
    conn: &Connection,
    kind: RecordKind,
    at: i64,
    default_mode: Mode,
) -> Result<Option<Record>> {
    let active = active_at(conn, kind, at)?;
    if active.is_none() && kind == RecordKind::RunningMode {
        return Ok(Some(Record::new(at, RunningMode::new(default_mode))));
    }
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::insert_record;
    use crate::payload::{TargetReason, TemporaryTarget};
    use crate::schema::Database;
    use crate::types::{RecordId, MINUTE_MS};

    fn target(ts: i64, duration: i64, low: f64) -> Record {
        Record::new(ts, TemporaryTarget::new(TargetReason::Custom, low, low)).with_duration(duration)
    }

    fn low(record: &Record) -> f64 {
        match &record.payload {
            crate::payload::Payload::TemporaryTarget(t) => t.low_mg_dl,
            _ => panic!("not a target"),
        }
    }

    #[test]
    fn test_resolve_prefers_later_start() {
        let permanent = target(0, 0, 100.0);
        let temporary = target(10, 60, 140.0);
        assert_eq!(low(&resolve(Some(temporary.clone()), Some(permanent.clone())).unwrap()), 140.0);

        let later_permanent = target(20, 0, 90.0);
        assert_eq!(low(&resolve(Some(temporary), Some(later_permanent)).unwrap()), 90.0);

        assert!(resolve(None, None).is_none());
        assert_eq!(low(&resolve(None, Some(permanent)).unwrap()), 100.0);
    }

    #[test]
    fn test_active_at_tie_break_from_store() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let t1 = 0;
        let t2 = 10 * MINUTE_MS;
        let dur = 30 * MINUTE_MS;

        insert_record(conn, &target(t1, 0, 100.0)).unwrap();
        insert_record(conn, &target(t2, dur, 140.0)).unwrap();

        // Inside the temporary window.
        let active = active_at(conn, RecordKind::TemporaryTarget, t2 + MINUTE_MS).unwrap();
        assert_eq!(low(&active.unwrap()), 140.0);

        // After it ended, the permanent one is back.
        let active = active_at(conn, RecordKind::TemporaryTarget, t2 + dur).unwrap();
        assert_eq!(low(&active.unwrap()), 100.0);

        // A newer permanent value after the window wins.
        let t3 = t2 + dur + MINUTE_MS;
        insert_record(conn, &target(t3, 0, 90.0)).unwrap();
        let active = active_at(conn, RecordKind::TemporaryTarget, t3).unwrap();
        assert_eq!(low(&active.unwrap()), 90.0);

        // Before anything started.
        assert!(active_at(conn, RecordKind::TemporaryTarget, -1).unwrap().is_none());
    }

    #[test]
    fn test_invalid_rows_ignored() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        insert_record(conn, &target(0, 0, 100.0).invalidated()).unwrap();
        assert!(active_at(conn, RecordKind::TemporaryTarget, 5).unwrap().is_none());
    }

    #[test]
    fn test_running_mode_default() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let active =
            active_at_or_default(conn, RecordKind::RunningMode, 1_000, Mode::ClosedLoop).unwrap().unwrap();
        assert_eq!(active.id, RecordId::NONE);
        assert_eq!(active.payload.as_running_mode().unwrap().mode, Mode::ClosedLoop);

        // Other kinds get no default.
        assert!(active_at_or_default(conn, RecordKind::TemporaryTarget, 1_000, Mode::ClosedLoop)
            .unwrap()
            .is_none());
    }
}
