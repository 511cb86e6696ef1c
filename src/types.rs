//! # Domain Types for TherapyDB
//!
//! This module defines the record model shared by every treatment type: the
//! row identity ([`RecordId`]), the record kind ([`RecordKind`]), the device
//! linkage ([`DeviceIds`]) and the [`Record`] itself. The type-specific payloads
//! live in [`crate::payload`].
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Row ids are wrapped in a newtype so that a `RecordId` can never be confused
//! with a timestamp or a remote identifier.
//!
//! ## Historization
//!
//! ```text
//!   id=1  Bolus 2.0U  reference_id=None     <- live row, id stable forever
//!   id=7  Bolus 1.5U  reference_id=Some(1)  <- historic snapshot (first value)
//!   id=9  Bolus 1.8U  reference_id=Some(1)  <- historic snapshot (second value)
//! ```
//!
//! Editing a record archives its old payload as a *new* row pointing at the
//! live row, then overwrites the live row in place. The live row's id never
//! changes, and ids are never reused.
//!
//! ## Invariants
//!
//! - [`RecordId`]: strictly increasing per kind, never reused, never zero for a
//!   stored row
//! - `reference_id == None` means live (or brand new), `Some(x)` means historic
//! - Invalidation flips `is_valid`; rows are only removed by explicit purges

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// One hour in milliseconds.
pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// One minute in milliseconds.
pub const MINUTE_MS: i64 = 60 * 1000;

// =============================================================================
// Row Identity
// =============================================================================

/// The physical identity of a row within one record kind's table.
///
/// # Invariants
///
/// - Assigned by the store on insert (`AUTOINCREMENT`), never reused
/// - Defines the total order used by the sync cursor
/// - [`RecordId::NONE`] (0) marks a record that has not been stored yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RecordId(u64);

impl RecordId {
    /// Sentinel for "not stored yet". Also the checkpoint of a sync that has
    /// never run.
    pub const NONE: RecordId = RecordId(0);

    /// Creates a RecordId from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value for database storage.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns true for [`RecordId::NONE`].
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// Record Kinds
// =============================================================================

/// The treatment record types. Each kind has its own table and its own id
/// sequence.
///
/// # Rust Pattern: Tag Instead of Reflection
///
/// Subscribers and queries name the kind they care about with this enum rather
/// than relying on runtime type information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Bolus,
    Carbs,
    TemporaryBasal,
    ExtendedBolus,
    TemporaryTarget,
    ProfileSwitch,
    EffectiveProfileSwitch,
    RunningMode,
    TherapyEvent,
    Food,
    GlucoseValue,
    BolusCalculatorResult,
    DeviceStatus,
    HeartRate,
    StepsCount,
    TotalDailyDose,
    UserEntry,
    AlgorithmResult,
}

impl RecordKind {
    /// Every kind, in table creation order.
    pub const ALL: [RecordKind; 18] = [
        RecordKind::Bolus,
        RecordKind::Carbs,
        RecordKind::TemporaryBasal,
        RecordKind::ExtendedBolus,
        RecordKind::TemporaryTarget,
        RecordKind::ProfileSwitch,
        RecordKind::EffectiveProfileSwitch,
        RecordKind::RunningMode,
        RecordKind::TherapyEvent,
        RecordKind::Food,
        RecordKind::GlucoseValue,
        RecordKind::BolusCalculatorResult,
        RecordKind::DeviceStatus,
        RecordKind::HeartRate,
        RecordKind::StepsCount,
        RecordKind::TotalDailyDose,
        RecordKind::UserEntry,
        RecordKind::AlgorithmResult,
    ];

    /// Stable snake_case name, used as the checkpoint key.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Bolus => "bolus",
            RecordKind::Carbs => "carbs",
            RecordKind::TemporaryBasal => "temporary_basal",
            RecordKind::ExtendedBolus => "extended_bolus",
            RecordKind::TemporaryTarget => "temporary_target",
            RecordKind::ProfileSwitch => "profile_switch",
            RecordKind::EffectiveProfileSwitch => "effective_profile_switch",
            RecordKind::RunningMode => "running_mode",
            RecordKind::TherapyEvent => "therapy_event",
            RecordKind::Food => "food",
            RecordKind::GlucoseValue => "glucose_value",
            RecordKind::BolusCalculatorResult => "bolus_calculator_result",
            RecordKind::DeviceStatus => "device_status",
            RecordKind::HeartRate => "heart_rate",
            RecordKind::StepsCount => "steps_count",
            RecordKind::TotalDailyDose => "total_daily_dose",
            RecordKind::UserEntry => "user_entry",
            RecordKind::AlgorithmResult => "algorithm_result",
        }
    }

    /// Name of the SQLite table holding this kind.
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Bolus => "boluses",
            RecordKind::Carbs => "carbs",
            RecordKind::TemporaryBasal => "temporary_basals",
            RecordKind::ExtendedBolus => "extended_boluses",
            RecordKind::TemporaryTarget => "temporary_targets",
            RecordKind::ProfileSwitch => "profile_switches",
            RecordKind::EffectiveProfileSwitch => "effective_profile_switches",
            RecordKind::RunningMode => "running_modes",
            RecordKind::TherapyEvent => "therapy_events",
            RecordKind::Food => "foods",
            RecordKind::GlucoseValue => "glucose_values",
            RecordKind::BolusCalculatorResult => "bolus_calculator_results",
            RecordKind::DeviceStatus => "device_status",
            RecordKind::HeartRate => "heart_rates",
            RecordKind::StepsCount => "steps_counts",
            RecordKind::TotalDailyDose => "total_daily_doses",
            RecordKind::UserEntry => "user_entries",
            RecordKind::AlgorithmResult => "algorithm_results",
        }
    }

    /// Parses the name produced by [`RecordKind::as_str`].
    pub fn parse(name: &str) -> Option<RecordKind> {
        RecordKind::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// True for kinds whose effect spans `[timestamp, timestamp + duration)`.
    pub fn is_interval(&self) -> bool {
        matches!(
            self,
            RecordKind::TemporaryBasal
                | RecordKind::ExtendedBolus
                | RecordKind::TemporaryTarget
                | RecordKind::RunningMode
                | RecordKind::ProfileSwitch
                | RecordKind::EffectiveProfileSwitch
        )
    }

    /// Kinds that are never removed by the retention sweep.
    ///
    /// Food entries are a user catalog rather than events and carry no
    /// meaningful event time.
    pub fn is_retained_forever(&self) -> bool {
        matches!(self, RecordKind::Food)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Device Linkage
// =============================================================================

/// Identifiers assigned by the pump or CGM that produced a record.
///
/// All three parts are needed to identify a device event unambiguously: pump
/// event ids restart when a pump is replaced, and two pump drivers may use
/// overlapping id ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeviceIds {
    /// Device-assigned event id.
    pub pump_id: Option<i64>,
    /// Device kind, e.g. `"OMNIPOD_DASH"`.
    pub pump_type: Option<String>,
    /// Device serial number.
    pub pump_serial: Option<String>,
}

impl DeviceIds {
    /// Creates fully specified device ids.
    pub fn new(pump_id: i64, pump_type: impl Into<String>, pump_serial: impl Into<String>) -> Self {
        Self {
            pump_id: Some(pump_id),
            pump_type: Some(pump_type.into()),
            pump_serial: Some(pump_serial.into()),
        }
    }

    /// Returns the matching key if all three identifiers are present.
    pub fn key(&self) -> Option<DeviceKey> {
        match (&self.pump_id, &self.pump_type, &self.pump_serial) {
            (Some(id), Some(kind), Some(serial)) => Some(DeviceKey {
                pump_id: *id,
                pump_type: kind.clone(),
                pump_serial: serial.clone(),
            }),
            _ => None,
        }
    }

    /// True when no identifier at all is set.
    pub fn is_empty(&self) -> bool {
        self.pump_id.is_none() && self.pump_type.is_none() && self.pump_serial.is_none()
    }
}

/// A complete device identity for one device-originated record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub pump_id: i64,
    pub pump_type: String,
    pub pump_serial: String,
}

impl DeviceKey {
    /// Hash for the indexed `device_key_hash` column.
    ///
    /// # Algorithm: XXH3
    ///
    /// XXH3-64 is formally specified, so the same key hashes to the same value
    /// across platforms and versions. The full key is still compared in code,
    /// so collisions only cost an extra row comparison.
    pub fn hash(&self) -> i64 {
        let material = format!("{}\u{1f}{}\u{1f}{}", self.pump_type, self.pump_serial, self.pump_id);
        xxhash_rust::xxh3::xxh3_64(material.as_bytes()) as i64
    }
}

/// Keys under which the writer tracks the live row of a record.
///
/// The writer keeps an in-memory map from domain key to live [`RecordId`]
/// per kind. A record can be reachable under two keys at once (its device
/// identity and its remote id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DomainKey {
    Device(DeviceKey),
    Remote(String),
}

// =============================================================================
// Record
// =============================================================================

/// Current schema revision written into [`Record::version`].
pub const RECORD_VERSION: u32 = 1;

/// One row of a treatment table.
///
/// This is both the input form (with `id == RecordId::NONE`) and the output
/// form read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Physical row identity. [`RecordId::NONE`] before insert.
    pub id: RecordId,

    /// Schema revision of this row.
    pub version: u32,

    /// Wall-clock creation time of this row (Unix milliseconds). Set by the store.
    pub date_created_ms: i64,

    /// Soft-delete flag.
    pub is_valid: bool,

    /// `Some(live_id)` for historic snapshots, `None` for live rows.
    pub reference_id: Option<RecordId>,

    /// Domain time of the therapy event (Unix milliseconds).
    pub timestamp_ms: i64,

    /// Local UTC offset at `timestamp_ms`.
    pub utc_offset_ms: i64,

    /// Effect duration. Zero means instantaneous, or "until superseded" for
    /// interval-valued kinds.
    pub duration_ms: i64,

    /// Identifier assigned by the remote system once it accepted this record.
    pub remote_id: Option<String>,

    /// Device linkage for pump/CGM originated records.
    pub device: DeviceIds,

    /// Type-specific payload. Determines [`Record::kind`].
    pub payload: Payload,
}

impl Record {
    /// Creates an unsaved, valid record at `timestamp_ms`.
    pub fn new(timestamp_ms: i64, payload: impl Into<Payload>) -> Self {
        Self {
            id: RecordId::NONE,
            version: RECORD_VERSION,
            date_created_ms: 0,
            is_valid: true,
            reference_id: None,
            timestamp_ms,
            utc_offset_ms: 0,
            duration_ms: 0,
            remote_id: None,
            device: DeviceIds::default(),
            payload: payload.into(),
        }
    }

    /// Sets the duration (builder pattern).
    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Sets the UTC offset (builder pattern).
    pub fn with_utc_offset(mut self, utc_offset_ms: i64) -> Self {
        self.utc_offset_ms = utc_offset_ms;
        self
    }

    /// Sets the device linkage (builder pattern).
    pub fn with_device(mut self, device: DeviceIds) -> Self {
        self.device = device;
        self
    }

    /// Sets the remote identifier (builder pattern).
    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    /// Marks the record invalid (builder pattern). Used for remote copies of
    /// records that were deleted on the remote side.
    pub fn invalidated(mut self) -> Self {
        self.is_valid = false;
        self
    }

    /// The kind of this record, derived from its payload.
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    /// True for live rows (and for unsaved records).
    pub fn is_live(&self) -> bool {
        self.reference_id.is_none()
    }

    /// True for historic snapshots.
    pub fn is_historic(&self) -> bool {
        self.reference_id.is_some()
    }

    /// Device key if all device identifiers are present.
    pub fn device_key(&self) -> Option<DeviceKey> {
        self.device.key()
    }

    /// Every domain key this record can be found under.
    pub fn domain_keys(&self) -> Vec<DomainKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(key) = self.device_key() {
            keys.push(DomainKey::Device(key));
        }
        if let Some(remote_id) = &self.remote_id {
            keys.push(DomainKey::Remote(remote_id.clone()));
        }
        keys
    }

    /// Compares the therapy-relevant content of two records.
    ///
    /// Row bookkeeping (`id`, `version`, `date_created_ms`, `reference_id`) and
    /// the remote identifier are ignored: assigning a remote id is not an edit.
    pub fn content_equals(&self, other: &Record) -> bool {
        self.is_valid == other.is_valid
            && self.timestamp_ms == other.timestamp_ms
            && self.utc_offset_ms == other.utc_offset_ms
            && self.duration_ms == other.duration_ms
            && self.device == other.device
            && self.payload == other.payload
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{Bolus, BolusType, Carbs};

    #[test]
    fn test_record_id_sentinel() {
        assert!(RecordId::NONE.is_none());
        assert!(!RecordId::from_raw(1).is_none());
        assert_eq!(RecordId::NONE.to_string(), "none");
        assert_eq!(RecordId::from_raw(42).to_string(), "42");
        assert!(RecordId::from_raw(1) < RecordId::from_raw(2));
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse("nope"), None);
    }

    #[test]
    fn test_kind_tables_are_unique() {
        let mut tables: Vec<&str> = RecordKind::ALL.iter().map(|k| k.table()).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), RecordKind::ALL.len());
    }

    #[test]
    fn test_interval_kinds() {
        assert!(RecordKind::TemporaryBasal.is_interval());
        assert!(RecordKind::RunningMode.is_interval());
        assert!(!RecordKind::Bolus.is_interval());
        assert!(!RecordKind::Carbs.is_interval());
    }

    #[test]
    fn test_device_key_requires_all_parts() {
        let partial = DeviceIds {
            pump_id: Some(5),
            pump_type: Some("DANA_I".into()),
            pump_serial: None,
        };
        assert!(partial.key().is_none());
        assert!(!partial.is_empty());

        let full = DeviceIds::new(5, "DANA_I", "ABC123");
        let key = full.key().unwrap();
        assert_eq!(key.hash(), DeviceIds::new(5, "DANA_I", "ABC123").key().unwrap().hash());
        assert_ne!(key.hash(), DeviceIds::new(6, "DANA_I", "ABC123").key().unwrap().hash());
    }

    #[test]
    fn test_content_equals_ignores_bookkeeping() {
        let a = Record::new(1_000, Bolus::new(2.0, BolusType::Normal));
        let mut b = a.clone();
        b.id = RecordId::from_raw(9);
        b.date_created_ms = 55;
        b.remote_id = Some("remote-1".into());
        assert!(a.content_equals(&b));

        b.payload = Bolus::new(2.5, BolusType::Normal).into();
        assert!(!a.content_equals(&b));
    }

    #[test]
    fn test_domain_keys() {
        let record = Record::new(0, Carbs::new(10.0))
            .with_device(DeviceIds::new(1, "X", "S"))
            .with_remote_id("r-1");
        let keys = record.domain_keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&DomainKey::Remote("r-1".into())));
    }
}
