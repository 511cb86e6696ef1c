//! Audit trail collaborator.
//!
//! Every mutation can carry an [`AuditEntry`] describing who did what and why.
//! The store never interprets it: after the owning transaction commits, the
//! entry is handed to the installed [`AuditSink`]. Rolled back transactions
//! produce no audit output.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

/// A semantically typed value attached to an audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum ValueWithUnit {
    Insulin(f64),
    InsulinRate(f64),
    Gram(f64),
    MgDl(f64),
    Percent(i32),
    Minute(i64),
    Hour(i64),
    Timestamp(i64),
    Text(String),
}

impl fmt::Display for ValueWithUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueWithUnit::Insulin(v) => write!(f, "{v:.2}U"),
            ValueWithUnit::InsulinRate(v) => write!(f, "{v:.2}U/h"),
            ValueWithUnit::Gram(v) => write!(f, "{v}g"),
            ValueWithUnit::MgDl(v) => write!(f, "{v}mg/dl"),
            ValueWithUnit::Percent(v) => write!(f, "{v}%"),
            ValueWithUnit::Minute(v) => write!(f, "{v}min"),
            ValueWithUnit::Hour(v) => write!(f, "{v}h"),
            ValueWithUnit::Timestamp(v) => write!(f, "@{v}"),
            ValueWithUnit::Text(v) => f.write_str(v),
        }
    }
}

/// One audit record: action kind, originating source, free text and values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// What happened, e.g. `"BOLUS"`, `"CARBS_REMOVED"`.
    pub action: String,
    /// Where it came from, e.g. `"Wizard"`, `"Pump"`, `"Remote"`.
    pub source: String,
    pub note: String,
    pub values: Vec<ValueWithUnit>,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            source: source.into(),
            note: String::new(),
            values: Vec::new(),
        }
    }

    /// Sets the free-text note (builder pattern).
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// Appends a value (builder pattern).
    pub fn with_value(mut self, value: ValueWithUnit) -> Self {
        self.values.push(value);
        self
    }

    fn values_display(&self) -> String {
        self.values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Receives committed audit entries.
///
/// Called from the writer thread after commit, so implementations must be
/// quick and must not call back into the store.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Default sink: one structured `tracing` event per entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) {
        info!(
            target: "therapydb::audit",
            action = %entry.action,
            source = %entry.source,
            note = %entry.note,
            values = %entry.values_display(),
            "audit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<AuditEntry>>);

    impl AuditSink for Collecting {
        fn record(&self, entry: &AuditEntry) {
            self.0.lock().unwrap().push(entry.clone());
        }
    }

    #[test]
    fn test_builder_and_display() {
        let entry = AuditEntry::new("BOLUS", "Wizard")
            .with_note("lunch")
            .with_value(ValueWithUnit::Insulin(2.5))
            .with_value(ValueWithUnit::Gram(40.0));
        assert_eq!(entry.values_display(), "2.50U, 40g");

        let sink = Collecting::default();
        sink.record(&entry);
        TracingAuditSink.record(&entry);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_value_json_shape() {
        let json = serde_json::to_string(&ValueWithUnit::Minute(30)).unwrap();
        assert_eq!(json, r#"{"unit":"minute","value":30}"#);
    }
}
