//! # Error Handling for TherapyDB
//!
//! This module defines the error types used throughout TherapyDB. A single
//! error enum ([`Error`]) represents every failure mode, which keeps function
//! signatures short and lets callers match on one type.
//!
//! ## Rust Pattern: thiserror
//!
//! The `thiserror` crate derives `std::error::Error`:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from the `#[from]` attributes
//!
//! ## What Is NOT an Error
//!
//! Several situations that look like failures are part of normal operation and
//! are reported through return values instead:
//!
//! | Situation | Reported as |
//! |-----------|-------------|
//! | Unknown id / remote id | `None` or an explicit "not found" outcome |
//! | Slow change subscriber | Oldest change-sets silently dropped |
//! | Failed remote upload | Checkpoint not advanced, unit retried later |
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Sanity | Malformed profile blocks | Fix the input, nothing was written |
//! | Internal | SQLite error, corrupt payload | Log and investigate |
//! | Lifecycle | Writer thread gone | Reopen the store |

use thiserror::Error;

use crate::types::RecordKind;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in TherapyDB operations.
///
/// # Example
///
/// ```rust,ignore
/// use therapydb::{Error, Result};
///
/// fn example() -> Result<()> {
///     let err = Error::Sanity {
///         kind: RecordKind::ProfileSwitch,
///         field: "basal_blocks".to_string(),
///         reason: "must not be empty".to_string(),
///     };
///     Err(err)
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Domain Errors (nothing was written)
    // =========================================================================

    /// A record failed a domain sanity check before commit.
    ///
    /// # When This Happens
    ///
    /// Every operation of a transaction is validated before the transaction's
    /// SAVEPOINT is opened. A single failing record aborts the whole
    /// transaction, so the store is left exactly as it was.
    ///
    /// # Recovery
    ///
    /// Correct the offending field and submit the transaction again.
    #[error("sanity check failed for {kind} field '{field}': {reason}")]
    Sanity {
        /// The record kind that was rejected.
        kind: RecordKind,
        /// The offending field, e.g. `basal_blocks[2].duration_ms`.
        field: String,
        /// Human readable explanation.
        reason: String,
    },

    // =========================================================================
    // Internal Errors (investigate and fix)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error> for Error`,
    /// which lets the `?` operator convert rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A payload could not be encoded to or decoded from its JSON column.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema version mismatch or a structurally corrupt row.
    ///
    /// # Recovery
    ///
    /// May require manual intervention or restore from backup.
    #[error("schema error: {0}")]
    Schema(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// The writer or reader threads have shut down.
    #[error("store closed: {0}")]
    Closed(String),
}

impl Error {
    /// Builds a [`Error::Sanity`] for `kind` and `field`.
    pub fn sanity(kind: RecordKind, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Sanity {
            kind,
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error was raised by a sanity check.
    pub fn is_sanity(&self) -> bool {
        matches!(self, Error::Sanity { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
