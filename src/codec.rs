//! # Row Encoding and Decoding
//!
//! Maps [`Record`] values to rows of the per-kind tables and back.
//!
//! ## Row Format
//!
//! ```text
//! id | version | date_created_ms | is_valid | reference_id | timestamp_ms | utc_offset_ms
//!    | duration_ms | remote_id | pump_id | pump_type | pump_serial | device_key_hash | payload
//! ```
//!
//! Every read goes through [`RECORD_COLUMNS`] so the column order used by
//! [`record_from_row`] is defined in exactly one place.

use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::payload::Payload;
use crate::types::{DeviceIds, Record, RecordId, RecordKind};

/// Column list matching [`record_from_row`].
pub const RECORD_COLUMNS: &str = "id, version, date_created_ms, is_valid, reference_id, \
     timestamp_ms, utc_offset_ms, duration_ms, remote_id, pump_id, pump_type, pump_serial, payload";

// =============================================================================
// Decoding
// =============================================================================

/// Decodes one row selected with [`RECORD_COLUMNS`] from `kind`'s table.
///
/// A payload that fails to parse, or that parses to a different kind than the
/// table holds, is reported as a conversion failure on the payload column.
pub fn record_from_row(row: &Row<'_>, kind: RecordKind) -> rusqlite::Result<Record> {
    let payload_json: String = row.get(12)?;
    let payload: Payload = serde_json::from_str(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(e)))?;
    if payload.kind() != kind {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            12,
            Type::Text,
            format!("{} payload stored in {} table", payload.kind(), kind.table()).into(),
        ));
    }

    let reference_id: Option<i64> = row.get(4)?;
    Ok(Record {
        id: RecordId::from_raw(row.get::<_, i64>(0)? as u64),
        version: row.get(1)?,
        date_created_ms: row.get(2)?,
        is_valid: row.get(3)?,
        reference_id: reference_id.map(|r| RecordId::from_raw(r as u64)),
        timestamp_ms: row.get(5)?,
        utc_offset_ms: row.get(6)?,
        duration_ms: row.get(7)?,
        remote_id: row.get(8)?,
        device: DeviceIds {
            pump_id: row.get(9)?,
            pump_type: row.get(10)?,
            pump_serial: row.get(11)?,
        },
        payload,
    })
}

// =============================================================================
// Encoding
// =============================================================================

/// Inserts `record` as a new row and returns the assigned id.
///
/// `record.id` is ignored; the table's AUTOINCREMENT assigns the id.
pub fn insert_record(conn: &Connection, record: &Record) -> Result<RecordId> {
    let kind = record.kind();
    let payload = serde_json::to_string(&record.payload)?;
    let device_hash = record.device_key().map(|k| k.hash());
    let sql = format!(
        "INSERT INTO {} (version, date_created_ms, is_valid, reference_id, timestamp_ms, \
         utc_offset_ms, duration_ms, remote_id, pump_id, pump_type, pump_serial, \
         device_key_hash, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        kind.table()
    );
    conn.prepare_cached(&sql)?.execute(params![
        record.version,
        record.date_created_ms,
        record.is_valid,
        record.reference_id.map(|r| r.as_raw() as i64),
        record.timestamp_ms,
        record.utc_offset_ms,
        record.duration_ms,
        record.remote_id,
        record.device.pump_id,
        record.device.pump_type,
        record.device.pump_serial,
        device_hash,
        payload,
    ])?;
    Ok(RecordId::from_raw(conn.last_insert_rowid() as u64))
}

/// Overwrites the content of the live row `id` with `record`.
///
/// `id`, `date_created_ms` and `reference_id` of the stored row are kept.
pub fn overwrite_record(conn: &Connection, id: RecordId, record: &Record) -> Result<()> {
    let payload = serde_json::to_string(&record.payload)?;
    let device_hash = record.device_key().map(|k| k.hash());
    let sql = format!(
        "UPDATE {} SET version = ?1, is_valid = ?2, timestamp_ms = ?3, utc_offset_ms = ?4, \
         duration_ms = ?5, remote_id = ?6, pump_id = ?7, pump_type = ?8, pump_serial = ?9, \
         device_key_hash = ?10, payload = ?11 WHERE id = ?12",
        record.kind().table()
    );
    conn.prepare_cached(&sql)?.execute(params![
        record.version,
        record.is_valid,
        record.timestamp_ms,
        record.utc_offset_ms,
        record.duration_ms,
        record.remote_id,
        record.device.pump_id,
        record.device.pump_type,
        record.device.pump_serial,
        device_hash,
        payload,
        id.as_raw() as i64,
    ])?;
    Ok(())
}

/// Sets `remote_id` on row `id` without touching anything else.
pub fn set_remote_id(conn: &Connection, kind: RecordKind, id: RecordId, remote_id: &str) -> Result<()> {
    let sql = format!("UPDATE {} SET remote_id = ?1 WHERE id = ?2", kind.table());
    conn.prepare_cached(&sql)?
        .execute(params![remote_id, id.as_raw() as i64])?;
    Ok(())
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{Bolus, BolusType, Carbs};
    use crate::schema::Database;

    fn load(conn: &Connection, kind: RecordKind, id: RecordId) -> Record {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?1", kind.table());
        conn.query_row(&sql, [id.as_raw() as i64], |row| record_from_row(row, kind))
            .unwrap()
    }

    #[test]
    fn test_insert_then_read_back() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let record = Record::new(1_000, Bolus::new(2.0, BolusType::Smb))
            .with_utc_offset(3_600_000)
            .with_device(DeviceIds::new(12, "DANA_I", "SN1"))
            .with_remote_id("r-1");
        let id = insert_record(conn, &record).unwrap();
        assert_eq!(id, RecordId::from_raw(1));

        let stored = load(conn, RecordKind::Bolus, id);
        assert_eq!(stored.id, id);
        assert!(stored.content_equals(&record));
        assert_eq!(stored.remote_id.as_deref(), Some("r-1"));
    }

    #[test]
    fn test_ids_never_reused_after_delete() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let first = insert_record(conn, &Record::new(0, Carbs::new(10.0))).unwrap();
        conn.execute("DELETE FROM carbs WHERE id = ?1", [first.as_raw() as i64])
            .unwrap();
        let second = insert_record(conn, &Record::new(0, Carbs::new(10.0))).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_overwrite_keeps_identity() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let mut record = Record::new(1_000, Carbs::new(10.0));
        record.date_created_ms = 5;
        let id = insert_record(conn, &record).unwrap();

        let edited = Record::new(2_000, Carbs::new(25.0));
        overwrite_record(conn, id, &edited).unwrap();

        let stored = load(conn, RecordKind::Carbs, id);
        assert_eq!(stored.date_created_ms, 5);
        assert_eq!(stored.timestamp_ms, 2_000);
        assert!(stored.is_live());
    }

    #[test]
    fn test_wrong_kind_payload_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let id = insert_record(conn, &Record::new(0, Carbs::new(10.0))).unwrap();
        let sql = format!("SELECT {RECORD_COLUMNS} FROM carbs WHERE id = ?1");
        let result = conn.query_row(&sql, [id.as_raw() as i64], |row| {
            record_from_row(row, RecordKind::Bolus)
        });
        assert!(matches!(result, Err(rusqlite::Error::FromSqlConversionFailure(12, _, _))));
    }
}
