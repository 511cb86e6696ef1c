//! # TherapyDB - Historized Treatment Record Store
//!
//! TherapyDB persists every insulin-delivery-relevant event (boluses, carbs,
//! basal changes, targets, profile switches, glucose values and more) on top
//! of SQLite and keeps it in step with a remote system over an unreliable
//! link. It provides:
//!
//! - **Historized records**: edits never overwrite silently, the previous value
//!   is kept as a historic row pointing at the stable live row
//! - **Soft deletion**: invalidation flips a flag, nothing is physically removed
//!   outside of explicit purges
//! - **Resumable sync**: a checkpointed cursor that ships each edited record
//!   once, with its latest value
//! - **Atomic transactions**: group commit, each transaction in its own SAVEPOINT
//! - **Change notifications**: one change-set per committed transaction
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │         (insert_or_update, invalidate, query, subscribe)        │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Batch Writer                              │
//! │              (single thread, owns write connection)             │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │ Group Commit│  │  SAVEPOINT  │  │  Live Pointer Map       │ │
//! │  │   Batcher   │  │  per tx     │  │  (domain key -> id)     │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └──────────────┬──────────────────────────────┬───────────────────┘
//!                │                              │ after COMMIT
//!                ▼                              ▼
//! ┌──────────────────────────────┐   ┌─────────────────────────────┐
//! │            SQLite            │   │   Change Bus / Audit Sink   │
//! │   one table per record kind  │   └─────────────────────────────┘
//! └──────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Stable identity**: a live row keeps its id across every edit
//! 2. **No silent mutation**: every content change leaves a historic row
//! 3. **Monotonic ids**: ids strictly increase per kind and are never reused
//! 4. **Atomicity**: a transaction commits entirely or not at all
//! 5. **Notify after commit**: change-sets are published only for committed data
//!
//! ## Module Organization
//!
//! - [`error`]: Error type shared by every operation
//! - [`types`]: Record, ids, kinds and device identity
//! - [`payload`]: Type-specific record payloads and their sanity checks
//! - [`schema`]: SQLite DDL and database initialization
//! - [`codec`]: Row encoding and decoding
//! - [`reader`]: Read queries and the reader pool
//! - [`writer`]: Batch writer, transactions and store operations
//! - [`subscription`]: Change-sets, observers and subscriptions
//! - [`sync`]: Sync cursor protocol and driver
//! - [`interval`]: Active-value resolution for interval kinds
//! - [`carbs`]: Spread carbs expansion
//! - [`api`]: Async API (main entry point)

/// Error types for TherapyDB operations.
pub mod error;

/// Record model: ids, kinds, device identity and the common record envelope.
pub mod types;

/// Type-specific payloads, one per record kind.
pub mod payload;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Mapping between [`Record`] and table rows.
pub mod codec;

/// Read operations against read-only connections.
pub mod reader;

/// Batch writer with group commit.
///
/// Transactions are collected over a short window (default 10ms) and executed
/// together, each inside its own SAVEPOINT so a failing transaction does not
/// affect the others.
pub mod writer;

/// Change notification bus.
pub mod subscription;

/// Incremental, resumable synchronization by row id.
pub mod sync;

/// Interval resolver for temporary and permanent values.
pub mod interval;

/// Spread carbs expansion.
pub mod carbs;

/// Audit trail collaborator.
pub mod audit;

/// Device-state collaborator.
pub mod device;

/// Store configuration.
pub mod config;

/// Async API for TherapyDB.
///
/// The main entry point is [`TreatmentStore`](api::TreatmentStore).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{Collaborators, TreatmentStore};
pub use audit::{AuditEntry, AuditSink, TracingAuditSink, ValueWithUnit};
pub use config::StoreConfig;
pub use device::{DeviceIdentity, DeviceState, FixedDevice, NoDevice};
pub use error::{Error, Result};
pub use reader::Order;
pub use schema::Database;
pub use writer::{
    BatchWriterHandle, OpOutcome, PurgeReport, StoreOp, TransactionBuilder, TransactionOutcome,
    WriterConfig,
};

pub use types::{DeviceIds, DeviceKey, DomainKey, Record, RecordId, RecordKind, HOUR_MS, MINUTE_MS};

pub use payload::{
    AlgorithmResult, Block, Bolus, BolusCalculatorResult, BolusType, Carbs, DeviceStatus,
    EffectiveProfileSwitch, ExtendedBolus, Food, GlucoseValue, HeartRate, Mode, Payload,
    ProfileData, ProfileSwitch, RunningMode, StepsCount, TargetBlock, TargetReason,
    TemporaryBasal, TemporaryBasalType, TemporaryTarget, TherapyEvent, TotalDailyDose, UserEntry,
};

pub use subscription::{ChangeBus, ChangeCategory, ChangeObserver, ChangeSet, Subscription};
pub use sync::{SyncCursor, SyncReport, SyncStep, SyncUnit, UploadAck, UploadError, Uploader};
