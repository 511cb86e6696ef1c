//! # Type-Specific Record Payloads
//!
//! Every record kind carries its own payload struct. The store keeps the common
//! columns (time, validity, linkage) in dedicated SQL columns and the payload as
//! a JSON document, so adding a field to a payload never needs a schema change.
//!
//! ## Encoding
//!
//! [`Payload`] is externally tagged:
//!
//! ```text
//! {"bolus":{"amount":2.5,"bolus_type":"normal"}}
//! {"carbs":{"amount":40.0,"notes":null}}
//! ```
//!
//! The tag doubles as a consistency check: a row read from the `boluses`
//! table whose payload decodes to anything but `Payload::Bolus` is reported as
//! a [`crate::Error::Schema`].
//!
//! ## Sanity Checks
//!
//! [`Payload::validate`] runs inside the writer before the batch holding a
//! transaction begins. Errors name the offending field so that a caller can
//! point the user at it, e.g. `basal_blocks[2].duration_ms`.

use serde::{Deserialize, Serialize};

use crate::audit::ValueWithUnit;
use crate::error::{Error, Result};
use crate::types::{RecordKind, HOUR_MS};

/// Length of one profile day. Profile blocks must cover exactly this span.
pub const DAY_MS: i64 = 24 * HOUR_MS;

// =============================================================================
// Payload Enum
// =============================================================================

/// The type-specific part of a [`crate::Record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Bolus(Bolus),
    Carbs(Carbs),
    TemporaryBasal(TemporaryBasal),
    ExtendedBolus(ExtendedBolus),
    TemporaryTarget(TemporaryTarget),
    ProfileSwitch(ProfileSwitch),
    EffectiveProfileSwitch(EffectiveProfileSwitch),
    RunningMode(RunningMode),
    TherapyEvent(TherapyEvent),
    Food(Food),
    GlucoseValue(GlucoseValue),
    BolusCalculatorResult(BolusCalculatorResult),
    DeviceStatus(DeviceStatus),
    HeartRate(HeartRate),
    StepsCount(StepsCount),
    TotalDailyDose(TotalDailyDose),
    UserEntry(UserEntry),
    AlgorithmResult(AlgorithmResult),
}

impl Payload {
    /// The record kind this payload belongs to.
    pub fn kind(&self) -> RecordKind {
        match self {
            Payload::Bolus(_) => RecordKind::Bolus,
            Payload::Carbs(_) => RecordKind::Carbs,
            Payload::TemporaryBasal(_) => RecordKind::TemporaryBasal,
            Payload::ExtendedBolus(_) => RecordKind::ExtendedBolus,
            Payload::TemporaryTarget(_) => RecordKind::TemporaryTarget,
            Payload::ProfileSwitch(_) => RecordKind::ProfileSwitch,
            Payload::EffectiveProfileSwitch(_) => RecordKind::EffectiveProfileSwitch,
            Payload::RunningMode(_) => RecordKind::RunningMode,
            Payload::TherapyEvent(_) => RecordKind::TherapyEvent,
            Payload::Food(_) => RecordKind::Food,
            Payload::GlucoseValue(_) => RecordKind::GlucoseValue,
            Payload::BolusCalculatorResult(_) => RecordKind::BolusCalculatorResult,
            Payload::DeviceStatus(_) => RecordKind::DeviceStatus,
            Payload::HeartRate(_) => RecordKind::HeartRate,
            Payload::StepsCount(_) => RecordKind::StepsCount,
            Payload::TotalDailyDose(_) => RecordKind::TotalDailyDose,
            Payload::UserEntry(_) => RecordKind::UserEntry,
            Payload::AlgorithmResult(_) => RecordKind::AlgorithmResult,
        }
    }

    /// Runs the domain sanity checks for this payload.
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        match self {
            Payload::Bolus(b) => non_negative(kind, "amount", b.amount),
            Payload::Carbs(c) => finite(kind, "amount", c.amount),
            Payload::TemporaryBasal(t) => non_negative(kind, "rate", t.rate),
            Payload::ExtendedBolus(e) => non_negative(kind, "amount", e.amount),
            Payload::TemporaryTarget(t) => {
                positive(kind, "low_mg_dl", t.low_mg_dl)?;
                positive(kind, "high_mg_dl", t.high_mg_dl)?;
                if t.low_mg_dl > t.high_mg_dl {
                    return Err(Error::sanity(kind, "low_mg_dl", "must not exceed high_mg_dl"));
                }
                Ok(())
            }
            Payload::ProfileSwitch(p) => {
                if p.percentage <= 0 {
                    return Err(Error::sanity(kind, "percentage", "must be positive"));
                }
                p.profile.validate(kind)
            }
            Payload::EffectiveProfileSwitch(p) => {
                if p.original_percentage <= 0 {
                    return Err(Error::sanity(kind, "original_percentage", "must be positive"));
                }
                p.profile.validate(kind)
            }
            Payload::RunningMode(_) => Ok(()),
            Payload::TherapyEvent(t) => {
                if t.event_type.trim().is_empty() {
                    return Err(Error::sanity(kind, "event_type", "must not be empty"));
                }
                Ok(())
            }
            Payload::Food(f) => {
                if f.name.trim().is_empty() {
                    return Err(Error::sanity(kind, "name", "must not be empty"));
                }
                non_negative(kind, "carbs", f.carbs)?;
                positive(kind, "portion", f.portion)
            }
            Payload::GlucoseValue(g) => positive(kind, "value_mg_dl", g.value_mg_dl),
            Payload::BolusCalculatorResult(b) => {
                non_negative(kind, "total_insulin", b.total_insulin)?;
                non_negative(kind, "carbs", b.carbs)
            }
            Payload::DeviceStatus(d) => match d.battery_percent {
                Some(p) if !(0..=100).contains(&p) => {
                    Err(Error::sanity(kind, "battery_percent", "must be within 0..=100"))
                }
                _ => Ok(()),
            },
            Payload::HeartRate(h) => positive(kind, "beats_per_minute", h.beats_per_minute),
            Payload::StepsCount(s) => {
                if s.steps < 0 {
                    return Err(Error::sanity(kind, "steps", "must not be negative"));
                }
                Ok(())
            }
            Payload::TotalDailyDose(t) => {
                non_negative(kind, "basal_amount", t.basal_amount)?;
                non_negative(kind, "bolus_amount", t.bolus_amount)?;
                non_negative(kind, "total_amount", t.total_amount)
            }
            Payload::UserEntry(u) => {
                if u.action.trim().is_empty() {
                    return Err(Error::sanity(kind, "action", "must not be empty"));
                }
                Ok(())
            }
            Payload::AlgorithmResult(a) => {
                if a.algorithm.trim().is_empty() {
                    return Err(Error::sanity(kind, "algorithm", "must not be empty"));
                }
                Ok(())
            }
        }
    }

    /// Borrows the carbs payload, if this is one.
    pub fn as_carbs(&self) -> Option<&Carbs> {
        match self {
            Payload::Carbs(c) => Some(c),
            _ => None,
        }
    }

    /// Borrows the running mode payload, if this is one.
    pub fn as_running_mode(&self) -> Option<&RunningMode> {
        match self {
            Payload::RunningMode(m) => Some(m),
            _ => None,
        }
    }
}

fn finite(kind: RecordKind, field: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::sanity(kind, field, "must be a finite number"));
    }
    Ok(())
}

fn non_negative(kind: RecordKind, field: &str, value: f64) -> Result<()> {
    finite(kind, field, value)?;
    if value < 0.0 {
        return Err(Error::sanity(kind, field, "must not be negative"));
    }
    Ok(())
}

fn positive(kind: RecordKind, field: &str, value: f64) -> Result<()> {
    finite(kind, field, value)?;
    if value <= 0.0 {
        return Err(Error::sanity(kind, field, "must be positive"));
    }
    Ok(())
}

/// Generates `From<T> for Payload` for every payload struct.
macro_rules! payload_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Payload {
                fn from(value: $variant) -> Self {
                    Payload::$variant(value)
                }
            }
        )*
    };
}

payload_from!(
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
);

// =============================================================================
// Insulin
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BolusType {
    Normal,
    Smb,
    Priming,
}

/// A delivered insulin bolus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bolus {
    /// Units of insulin.
    pub amount: f64,
    pub bolus_type: BolusType,
}

impl Bolus {
    pub fn new(amount: f64, bolus_type: BolusType) -> Self {
        Self { amount, bolus_type }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporaryBasalType {
    Normal,
    EmulatedPumpSuspend,
    PumpSuspend,
    SuperBolus,
    FakeExtended,
}

/// A temporary basal rate. Interval-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporaryBasal {
    /// U/h when `is_absolute`, otherwise percent of the profile rate.
    pub rate: f64,
    pub is_absolute: bool,
    pub basal_type: TemporaryBasalType,
}

impl TemporaryBasal {
    pub fn absolute(rate: f64) -> Self {
        Self {
            rate,
            is_absolute: true,
            basal_type: TemporaryBasalType::Normal,
        }
    }

    pub fn percent(percent: f64) -> Self {
        Self {
            rate: percent,
            is_absolute: false,
            basal_type: TemporaryBasalType::Normal,
        }
    }
}

/// An extended (square-wave) bolus. Interval-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedBolus {
    /// Total units delivered over the record's duration.
    pub amount: f64,
    pub is_emulating_temp_basal: bool,
}

impl ExtendedBolus {
    pub fn new(amount: f64) -> Self {
        Self {
            amount,
            is_emulating_temp_basal: false,
        }
    }
}

/// Total daily dose summary for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalDailyDose {
    pub basal_amount: f64,
    pub bolus_amount: f64,
    pub total_amount: f64,
    pub carbs: f64,
}

// =============================================================================
// Carbohydrates and Food
// =============================================================================

/// A carbohydrate intake. A positive record duration spreads the intake over
/// time, see [`crate::carbs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Carbs {
    /// Grams of carbohydrate.
    pub amount: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Carbs {
    pub fn new(amount: f64) -> Self {
        Self { amount, notes: None }
    }
}

/// A food catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Food {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Grams of carbohydrate per portion.
    pub carbs: f64,
    pub portion: f64,
    pub unit: String,
}

// =============================================================================
// Targets, Profiles and Modes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetReason {
    Custom,
    HypoglycemiaTreatment,
    Activity,
    EatingSoon,
    Automation,
    Wear,
}

/// A temporary glucose target range. Interval-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporaryTarget {
    pub reason: TargetReason,
    pub low_mg_dl: f64,
    pub high_mg_dl: f64,
}

impl TemporaryTarget {
    pub fn new(reason: TargetReason, low_mg_dl: f64, high_mg_dl: f64) -> Self {
        Self {
            reason,
            low_mg_dl,
            high_mg_dl,
        }
    }
}

/// One time block of a profile curve: `amount` holds for `duration_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub duration_ms: i64,
    pub amount: f64,
}

impl Block {
    pub fn new(duration_ms: i64, amount: f64) -> Self {
        Self { duration_ms, amount }
    }
}

/// One time block of the target curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetBlock {
    pub duration_ms: i64,
    pub low_mg_dl: f64,
    pub high_mg_dl: f64,
}

/// Profile curves shared by [`ProfileSwitch`] and [`EffectiveProfileSwitch`].
///
/// Each curve is a list of consecutive blocks that together cover one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileData {
    pub name: String,
    pub basal_blocks: Vec<Block>,
    pub isf_blocks: Vec<Block>,
    pub ic_blocks: Vec<Block>,
    pub target_blocks: Vec<TargetBlock>,
}

impl ProfileData {
    /// A profile with one flat block per curve.
    pub fn flat(name: impl Into<String>, basal: f64, isf: f64, ic: f64, target_mg_dl: f64) -> Self {
        Self {
            name: name.into(),
            basal_blocks: vec![Block::new(DAY_MS, basal)],
            isf_blocks: vec![Block::new(DAY_MS, isf)],
            ic_blocks: vec![Block::new(DAY_MS, ic)],
            target_blocks: vec![TargetBlock {
                duration_ms: DAY_MS,
                low_mg_dl: target_mg_dl,
                high_mg_dl: target_mg_dl,
            }],
        }
    }

    fn validate(&self, kind: RecordKind) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::sanity(kind, "name", "must not be empty"));
        }
        validate_blocks(kind, "basal_blocks", &self.basal_blocks)?;
        validate_blocks(kind, "isf_blocks", &self.isf_blocks)?;
        validate_blocks(kind, "ic_blocks", &self.ic_blocks)?;

        if self.target_blocks.is_empty() {
            return Err(Error::sanity(kind, "target_blocks", "must not be empty"));
        }
        let mut total = 0i64;
        for (i, block) in self.target_blocks.iter().enumerate() {
            if block.duration_ms <= 0 {
                return Err(Error::sanity(
                    kind,
                    format!("target_blocks[{i}].duration_ms"),
                    "must be positive",
                ));
            }
            if !(block.low_mg_dl > 0.0 && block.low_mg_dl <= block.high_mg_dl) {
                return Err(Error::sanity(
                    kind,
                    format!("target_blocks[{i}].low_mg_dl"),
                    "must be positive and not exceed high_mg_dl",
                ));
            }
            total = total.saturating_add(block.duration_ms);
        }
        if total != DAY_MS {
            return Err(Error::sanity(kind, "target_blocks", "durations must sum to 24h"));
        }
        Ok(())
    }
}

fn validate_blocks(kind: RecordKind, name: &str, blocks: &[Block]) -> Result<()> {
    if blocks.is_empty() {
        return Err(Error::sanity(kind, name, "must not be empty"));
    }
    let mut total = 0i64;
    for (i, block) in blocks.iter().enumerate() {
        if block.duration_ms <= 0 {
            return Err(Error::sanity(kind, format!("{name}[{i}].duration_ms"), "must be positive"));
        }
        if !(block.amount.is_finite() && block.amount > 0.0) {
            return Err(Error::sanity(kind, format!("{name}[{i}].amount"), "must be positive"));
        }
        total = total.saturating_add(block.duration_ms);
    }
    if total != DAY_MS {
        return Err(Error::sanity(kind, name, "durations must sum to 24h"));
    }
    Ok(())
}

/// A user-requested profile switch. Interval-valued; duration 0 is permanent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSwitch {
    pub profile: ProfileData,
    /// Scales basal and inverse-scales ISF/IC. 100 is unchanged.
    pub percentage: i32,
    pub timeshift_ms: i64,
}

impl ProfileSwitch {
    pub fn new(profile: ProfileData) -> Self {
        Self {
            profile,
            percentage: 100,
            timeshift_ms: 0,
        }
    }
}

/// The profile the pump actually runs after a switch was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveProfileSwitch {
    pub profile: ProfileData,
    pub original_percentage: i32,
    pub original_timeshift_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    OpenLoop,
    ClosedLoop,
    ClosedLoopLgs,
    DisabledLoop,
    SuperBolus,
    DisconnectedPump,
    SuspendedByPump,
    SuspendedByUser,
}

/// The loop's running mode. Interval-valued; duration 0 is permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningMode {
    pub mode: Mode,
}

impl RunningMode {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }
}

// =============================================================================
// Events and Measurements
// =============================================================================

/// A careportal style event (site change, sensor start, note...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TherapyEvent {
    pub event_type: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub glucose_mg_dl: Option<f64>,
}

impl TherapyEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            note: None,
            glucose_mg_dl: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseValue {
    pub value_mg_dl: f64,
    #[serde(default)]
    pub trend: Option<String>,
    pub source: String,
}

impl GlucoseValue {
    pub fn new(value_mg_dl: f64, source: impl Into<String>) -> Self {
        Self {
            value_mg_dl,
            trend: None,
            source: source.into(),
        }
    }
}

/// Inputs and result of one bolus wizard run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BolusCalculatorResult {
    pub glucose_mg_dl: f64,
    pub carbs: f64,
    pub insulin_on_board: f64,
    pub total_insulin: f64,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device: String,
    #[serde(default)]
    pub battery_percent: Option<i32>,
    #[serde(default)]
    pub reservoir_units: Option<f64>,
    #[serde(default)]
    pub insulin_on_board: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRate {
    pub beats_per_minute: f64,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepsCount {
    pub steps: i64,
    pub device: String,
}

/// Persisted copy of an audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    pub action: String,
    pub source: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub values: Vec<ValueWithUnit>,
}

/// Output of the dosing algorithm, stored opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmResult {
    pub algorithm: String,
    pub data: serde_json::Value,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ProfileData {
        ProfileData::flat("Default", 0.8, 45.0, 10.0, 100.0)
    }

    #[test]
    fn test_payload_json_is_tagged() {
        let payload: Payload = Bolus::new(2.5, BolusType::Normal).into();
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"bolus":{"amount":2.5,"bolus_type":"normal"}}"#);

        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.kind(), RecordKind::Bolus);
    }

    #[test]
    fn test_valid_profile_passes() {
        let payload: Payload = ProfileSwitch::new(profile()).into();
        payload.validate().unwrap();
    }

    #[test]
    fn test_empty_basal_blocks_rejected() {
        let mut data = profile();
        data.basal_blocks.clear();
        let err = Payload::from(ProfileSwitch::new(data)).validate().unwrap_err();
        match err {
            Error::Sanity { kind, field, .. } => {
                assert_eq!(kind, RecordKind::ProfileSwitch);
                assert_eq!(field, "basal_blocks");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bad_block_names_index() {
        let mut data = profile();
        data.isf_blocks = vec![
            Block::new(12 * HOUR_MS, 40.0),
            Block::new(0, 45.0),
            Block::new(12 * HOUR_MS, 50.0),
        ];
        let err = Payload::from(ProfileSwitch::new(data)).validate().unwrap_err();
        match err {
            Error::Sanity { field, .. } => assert_eq!(field, "isf_blocks[1].duration_ms"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_blocks_must_cover_day() {
        let mut data = profile();
        data.ic_blocks = vec![Block::new(23 * HOUR_MS, 10.0)];
        let err = Payload::from(ProfileSwitch::new(data)).validate().unwrap_err();
        assert!(err.to_string().contains("24h"));
    }

    #[test]
    fn test_negative_bolus_rejected() {
        let err = Payload::from(Bolus::new(-1.0, BolusType::Normal))
            .validate()
            .unwrap_err();
        assert!(err.is_sanity());
        assert!(Payload::from(Bolus::new(f64::NAN, BolusType::Smb)).validate().is_err());
    }

    #[test]
    fn test_inverted_temporary_target_rejected() {
        let payload: Payload = TemporaryTarget::new(TargetReason::Activity, 140.0, 120.0).into();
        assert!(payload.validate().is_err());
        let ok: Payload = TemporaryTarget::new(TargetReason::Activity, 120.0, 140.0).into();
        ok.validate().unwrap();
    }
}
