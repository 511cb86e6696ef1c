//! # Transaction Coordinator with Group Commit
//!
//! All mutations go through one writer thread that owns the only read-write
//! SQLite connection. Callers submit whole transactions (lists of
//! [`StoreOp`]s); the writer collects them over a short window and executes
//! them in a single SQLite transaction, each caller transaction inside its
//! own SAVEPOINT.
//!
//! ```text
//! validate a, b, c, d   b fails: answered with its sanity error, never written
//! BEGIN IMMEDIATE
//!   SAVEPOINT tx_0 (a) ... RELEASE tx_0
//!   SAVEPOINT tx_1 (c) ... error ... ROLLBACK TO tx_1
//!   SAVEPOINT tx_2 (d) ... RELEASE tx_2
//! COMMIT
//! publish change-set of a, d (once each), forward their audit entries
//! ```
//!
//! A transaction is all-or-nothing: any failing operation rolls the whole
//! transaction back to its savepoint, and the others in the batch are not
//! affected.
//!
//! ## Historized Updates
//!
//! ```text
//! before:  id=4 live  Carbs 20g
//! update:  Carbs 30g
//! after:   id=4 live  Carbs 30g            (id stable)
//!          id=9 ref=4 Carbs 20g            (snapshot of the old value)
//! ```
//!
//! ## Live Pointer Map
//!
//! The writer keeps a map from `(kind, domain key)` to the live row id, where
//! a domain key is a full device identity or a remote id. Remote ids are
//! loaded in full on open. Device identities are only cached as they are
//! written; a miss falls through to the `device_key_hash` index. Like the
//! rest of the writer's memory the map has three layers:
//!
//! ```text
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │  tx_staged       │─►│  batch_staged    │─►│  live_committed  │
//! │  (savepoint)     │  │  (outer tx)      │  │  (mirrors disk)  │
//! └──────────────────┘  └──────────────────┘  └──────────────────┘
//!  lookups: tx_staged → batch_staged → committed
//!  RELEASE: tx → batch     COMMIT: batch → committed
//!  ROLLBACK: discard the layer
//! ```
//!
//! ## Invariants
//!
//! - Memory never leads disk
//! - Change-sets are published only after COMMIT, exactly once
//! - A historic row always references a row that was live when it was written

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEntry, AuditSink};
use crate::carbs::MAX_CARBS_DURATION_MS;
use crate::codec::{current_time_ms, insert_record, overwrite_record, set_remote_id};
use crate::device::DeviceState;
use crate::error::{Error, Result};
use crate::interval;
use crate::reader;
use crate::subscription::{ChangeBus, ChangeCategory, ChangeSet};
use crate::types::{DomainKey, Record, RecordId, RecordKind, RECORD_VERSION};

// =============================================================================
// Configuration
// =============================================================================

/// Default batch timeout in milliseconds.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 10;

/// Maximum transactions per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Size of the request channel.
const COMMAND_CHANNEL_SIZE: usize = 4096;

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum time to wait for more transactions before executing a batch.
    pub batch_timeout: Duration,

    /// Maximum transactions per batch.
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

// =============================================================================
// Operations and Outcomes
// =============================================================================

/// One record-store mutation inside a transaction.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Insert a new record, or historize-and-update the live row it matches
    /// (explicit id, then device identity, then remote id).
    InsertOrUpdate {
        record: Record,
        audit: Option<AuditEntry>,
    },

    /// Soft-delete the live row `id`. The reason goes to the audit sink.
    Invalidate {
        kind: RecordKind,
        id: RecordId,
        reason: AuditEntry,
    },

    /// Write freshly assigned remote ids into live rows, in place.
    ReconcileRemoteIds { records: Vec<Record> },

    /// A record arriving from the remote system. Must carry a remote id.
    SyncFromRemote { record: Record },

    /// A device-originated record; missing pump type/serial are taken from
    /// the active device.
    SyncPumpRecord {
        record: Record,
        audit: Option<AuditEntry>,
    },

    /// Cut the running temporary instance of an interval kind at `at_ms`.
    EndActiveInterval {
        kind: RecordKind,
        at_ms: i64,
        audit: Option<AuditEntry>,
    },

    /// Change the duration of live row `id`.
    UpdateDuration {
        kind: RecordKind,
        id: RecordId,
        duration_ms: i64,
        audit: Option<AuditEntry>,
    },
}

impl StoreOp {
    fn audit(&self) -> Option<&AuditEntry> {
        match self {
            StoreOp::InsertOrUpdate { audit, .. }
            | StoreOp::SyncPumpRecord { audit, .. }
            | StoreOp::EndActiveInterval { audit, .. }
            | StoreOp::UpdateDuration { audit, .. } => audit.as_ref(),
            StoreOp::Invalidate { reason, .. } => Some(reason),
            StoreOp::ReconcileRemoteIds { .. } | StoreOp::SyncFromRemote { .. } => None,
        }
    }

    /// Attaches an audit entry. Ignored by ops that carry none.
    fn set_audit(&mut self, entry: AuditEntry) {
        match self {
            StoreOp::InsertOrUpdate { audit, .. }
            | StoreOp::SyncPumpRecord { audit, .. }
            | StoreOp::EndActiveInterval { audit, .. }
            | StoreOp::UpdateDuration { audit, .. } => *audit = Some(entry),
            StoreOp::Invalidate { reason, .. } => *reason = entry,
            StoreOp::ReconcileRemoteIds { .. } | StoreOp::SyncFromRemote { .. } => {}
        }
    }
}

/// Per-operation result, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Inserted(Record),
    Updated(Record),
    Invalidated(Record),
    Reconciled(Vec<Record>),
    IntervalEnded(Record),
    DurationUpdated(Record),
    /// Matched a live row whose content already equals the input.
    Unchanged(Record),
    /// The id or running interval does not exist. Not an error.
    NotFound,
}

impl OpOutcome {
    /// The resulting live row, for single-record outcomes.
    pub fn record(&self) -> Option<&Record> {
        match self {
            OpOutcome::Inserted(r)
            | OpOutcome::Updated(r)
            | OpOutcome::Invalidated(r)
            | OpOutcome::IntervalEnded(r)
            | OpOutcome::DurationUpdated(r)
            | OpOutcome::Unchanged(r) => Some(r),
            OpOutcome::Reconciled(records) => records.first(),
            OpOutcome::NotFound => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OpOutcome::NotFound)
    }

    /// True when the operation wrote something.
    pub fn changed(&self) -> bool {
        match self {
            OpOutcome::Unchanged(_) | OpOutcome::NotFound => false,
            OpOutcome::Reconciled(records) => !records.is_empty(),
            _ => true,
        }
    }
}

/// Result of a committed transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOutcome {
    /// Everything the transaction touched. Published once on the change bus.
    pub changes: ChangeSet,
    /// One outcome per submitted operation.
    pub outcomes: Vec<OpOutcome>,
}

/// Rows removed by a purge, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: BTreeMap<RecordKind, usize>,
}

impl PurgeReport {
    pub fn count(&self, kind: RecordKind) -> usize {
        self.removed.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.removed.values().sum()
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the writer thread.
pub enum WriteRequest {
    /// A transaction. Batched with others for group commit.
    Transaction {
        ops: Vec<StoreOp>,
        response: oneshot::Sender<Result<TransactionOutcome>>,
    },

    /// Persist a sync checkpoint. Never moves backwards.
    Acknowledge {
        kind: RecordKind,
        advance_to: RecordId,
        response: oneshot::Sender<Result<RecordId>>,
    },

    /// Delete rows whose event time is older than `cutoff_ms`.
    PurgeOlderThan {
        cutoff_ms: i64,
        response: oneshot::Sender<Result<PurgeReport>>,
    },

    /// Delete every historic row.
    PurgeHistoric {
        response: oneshot::Sender<Result<PurgeReport>>,
    },

    /// Flush pending work and stop.
    Shutdown,
}

struct PendingTransaction {
    ops: Vec<StoreOp>,
    response: oneshot::Sender<Result<TransactionOutcome>>,
}

// =============================================================================
// Staged State
// =============================================================================

type LiveKey = (RecordKind, DomainKey);

/// Live pointer changes not yet merged into the layer below.
///
/// `None` marks a key that no longer points anywhere.
#[derive(Default)]
struct StagedState {
    live: HashMap<LiveKey, Option<RecordId>>,
}

impl StagedState {
    fn clear(&mut self) {
        self.live.clear();
    }

    fn get(&self, key: &LiveKey) -> Option<Option<RecordId>> {
        self.live.get(key).copied()
    }

    fn absorb(&mut self, upper: &mut StagedState) {
        self.live.extend(upper.live.drain());
    }
}

/// Accumulates the results of one transaction.
#[derive(Default)]
struct TxContext {
    changes: ChangeSet,
}

// =============================================================================
// Batch Writer
// =============================================================================

/// The writer that owns the read-write connection.
///
/// Runs on a dedicated thread; use [`BatchWriterHandle`] from async code.
pub struct BatchWriter {
    conn: Connection,
    live_committed: HashMap<LiveKey, RecordId>,
    batch_staged: StagedState,
    tx_staged: StagedState,
    bus: Arc<ChangeBus>,
    audit: Arc<dyn AuditSink>,
    device: Arc<dyn DeviceState>,
}

impl BatchWriter {
    /// Creates a writer over an initialized connection and loads the live
    /// pointer map.
    pub fn new(
        conn: Connection,
        bus: Arc<ChangeBus>,
        audit: Arc<dyn AuditSink>,
        device: Arc<dyn DeviceState>,
    ) -> Result<Self> {
        let mut writer = Self {
            conn,
            live_committed: HashMap::new(),
            batch_staged: StagedState::default(),
            tx_staged: StagedState::default(),
            bus,
            audit,
            device,
        };
        writer.load_live_pointers()?;
        Ok(writer)
    }

    /// Rebuilds the committed remote id pointers from disk and drops the
    /// cached device pointers.
    ///
    /// Rows are visited in id order, so when two live rows share a remote id
    /// the newer one wins.
    fn load_live_pointers(&mut self) -> Result<()> {
        self.live_committed.clear();
        for kind in RecordKind::ALL {
            let sql = format!(
                "SELECT id, remote_id FROM {} \
                 WHERE reference_id IS NULL AND remote_id IS NOT NULL ORDER BY id ASC",
                kind.table()
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                let id: i64 = row.get(0)?;
                let remote_id: String = row.get(1)?;
                Ok((RecordId::from_raw(id as u64), remote_id))
            })?;
            for row in rows {
                let (id, remote_id) = row?;
                self.live_committed.insert((kind, DomainKey::Remote(remote_id)), id);
            }
        }
        debug!(pointers = self.live_committed.len(), "live pointer map loaded");
        Ok(())
    }

    /// `None` when no layer knows the key, `Some(None)` when a staged layer
    /// removed it.
    fn lookup_live(&self, kind: RecordKind, key: DomainKey) -> Option<Option<RecordId>> {
        let key = (kind, key);
        if let Some(staged) = self.tx_staged.get(&key) {
            return Some(staged);
        }
        if let Some(staged) = self.batch_staged.get(&key) {
            return Some(staged);
        }
        self.live_committed.get(&key).map(|id| Some(*id))
    }

    /// Moves the pointers of live row `id` from `old` keys to `new` keys.
    fn stage_keys(&mut self, kind: RecordKind, id: RecordId, old: &[DomainKey], new: &[DomainKey]) {
        for key in old {
            if !new.contains(key) && self.lookup_live(kind, key.clone()) == Some(Some(id)) {
                self.tx_staged.live.insert((kind, key.clone()), None);
            }
        }
        for key in new {
            self.tx_staged.live.insert((kind, key.clone()), Some(id));
        }
    }

    fn live_by_id(&self, kind: RecordKind, id: RecordId) -> Result<Option<Record>> {
        reader::find_current_by_id(&self.conn, kind, id)
    }

    fn live_by_key(&self, kind: RecordKind, key: DomainKey) -> Result<Option<Record>> {
        match self.lookup_live(kind, key.clone()) {
            Some(Some(id)) => self.live_by_id(kind, id),
            Some(None) => Ok(None),
            None => match key {
                // Uncommitted writes are visible on this connection, so the
                // index agrees with the staged layers.
                DomainKey::Device(device) => reader::find_current_by_device(&self.conn, kind, &device),
                DomainKey::Remote(_) => Ok(None),
            },
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Sanity checks one operation. Runs before the batch transaction begins.
    fn prepare(&self, op: &mut StoreOp) -> Result<()> {
        match op {
            StoreOp::InsertOrUpdate { record, .. } => validate_record(record),
            StoreOp::SyncFromRemote { record } => {
                validate_record(record)?;
                match record.remote_id.as_deref() {
                    Some(id) if !id.is_empty() => Ok(()),
                    _ => Err(Error::sanity(record.kind(), "remote_id", "required for remote records")),
                }
            }
            StoreOp::SyncPumpRecord { record, .. } => {
                if let Some(device) = self.device.active_device() {
                    device.complete(&mut record.device);
                }
                if record.device_key().is_none() {
                    return Err(Error::sanity(
                        record.kind(),
                        "device",
                        "pump id, pump type and pump serial are required",
                    ));
                }
                validate_record(record)
            }
            StoreOp::ReconcileRemoteIds { records } => {
                for record in records.iter() {
                    if record.remote_id.as_deref().is_some_and(str::is_empty) {
                        return Err(Error::sanity(record.kind(), "remote_id", "must not be empty"));
                    }
                }
                Ok(())
            }
            StoreOp::EndActiveInterval { kind, .. } => {
                if !kind.is_interval() {
                    return Err(Error::sanity(*kind, "kind", "not an interval-valued record kind"));
                }
                Ok(())
            }
            StoreOp::UpdateDuration { kind, duration_ms, .. } => {
                if *duration_ms == 0 && kind.is_interval() {
                    return Err(Error::sanity(
                        *kind,
                        "duration_ms",
                        "0 would make the instance permanent; end or invalidate it instead",
                    ));
                }
                validate_duration(*kind, *duration_ms)
            }
            StoreOp::Invalidate { .. } => Ok(()),
        }
    }

    // =========================================================================
    // Batch Execution
    // =========================================================================

    /// Executes a batch of transactions in one SQLite transaction.
    fn execute_batch(&mut self, items: Vec<PendingTransaction>) {
        if items.is_empty() {
            return;
        }
        debug!(transactions = items.len(), "executing batch");

        self.batch_staged.clear();
        self.tx_staged.clear();

        // Sanity checks do not touch the database, so rejected transactions
        // are answered before the batch starts and keep their own error.
        let mut all_ops = Vec::with_capacity(items.len());
        let mut responses = Vec::with_capacity(items.len());
        for mut item in items {
            match item.ops.iter_mut().try_for_each(|op| self.prepare(op)) {
                Ok(()) => {
                    all_ops.push(item.ops);
                    responses.push(item.response);
                }
                Err(e) => {
                    debug!(error = %e, "transaction rejected before batch");
                    let _ = item.response.send(Err(e));
                }
            }
        }
        if all_ops.is_empty() {
            return;
        }

        match self.execute_batch_inner(all_ops) {
            Ok(results) => {
                self.commit_staged_state();

                for (response, result) in responses.into_iter().zip(results) {
                    let result = result.map(|(outcome, audits)| {
                        self.bus.publish(outcome.changes.clone());
                        for entry in &audits {
                            self.audit.record(entry);
                        }
                        outcome
                    });
                    let _ = response.send(result);
                }
            }
            Err(e) => {
                error!(error = %e, "batch commit failed");
                let msg = format!("batch commit failed: {e}");
                for response in responses {
                    let _ = response.send(Err(Error::Schema(msg.clone())));
                }
                self.batch_staged.clear();
                self.tx_staged.clear();
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn execute_batch_inner(
        &mut self,
        transactions: Vec<Vec<StoreOp>>,
    ) -> Result<Vec<Result<(TransactionOutcome, Vec<AuditEntry>)>>> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;

        match self.execute_transactions(transactions) {
            Ok(results) => match self.conn.execute_batch("COMMIT") {
                Ok(()) => Ok(results),
                Err(e) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    Err(e.into())
                }
            },
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn execute_transactions(
        &mut self,
        transactions: Vec<Vec<StoreOp>>,
    ) -> Result<Vec<Result<(TransactionOutcome, Vec<AuditEntry>)>>> {
        let mut results = Vec::with_capacity(transactions.len());
        for (n, ops) in transactions.into_iter().enumerate() {
            let sp_name = format!("tx_{n}");
            self.conn.execute_batch(&format!("SAVEPOINT {sp_name}"))?;

            match self.execute_transaction(ops) {
                Ok(done) => {
                    self.conn.execute_batch(&format!("RELEASE {sp_name}"))?;
                    self.batch_staged.absorb(&mut self.tx_staged);
                    results.push(Ok(done));
                }
                Err(e) => {
                    warn!(error = %e, "transaction rolled back");
                    self.conn.execute_batch(&format!("ROLLBACK TO {sp_name}"))?;
                    self.conn.execute_batch(&format!("RELEASE {sp_name}"))?;
                    self.tx_staged.clear();
                    results.push(Err(e));
                }
            }
        }
        Ok(results)
    }

    fn execute_transaction(&mut self, ops: Vec<StoreOp>) -> Result<(TransactionOutcome, Vec<AuditEntry>)> {
        let mut ctx = TxContext::default();
        let mut outcomes = Vec::with_capacity(ops.len());
        let mut audits = Vec::new();

        for op in ops {
            let audit = op.audit().cloned();
            let outcome = self.execute_op(op, &mut ctx)?;
            if outcome.changed() {
                audits.extend(audit);
            }
            outcomes.push(outcome);
        }

        Ok((
            TransactionOutcome {
                changes: ctx.changes,
                outcomes,
            },
            audits,
        ))
    }

    fn execute_op(&mut self, op: StoreOp, ctx: &mut TxContext) -> Result<OpOutcome> {
        match op {
            StoreOp::InsertOrUpdate { record, .. } | StoreOp::SyncPumpRecord { record, .. } => {
                self.insert_or_update(record, ctx)
            }
            StoreOp::Invalidate { kind, id, .. } => self.invalidate(kind, id, ctx),
            StoreOp::ReconcileRemoteIds { records } => self.reconcile_remote_ids(records, ctx),
            StoreOp::SyncFromRemote { record } => self.sync_from_remote(record, ctx),
            StoreOp::EndActiveInterval { kind, at_ms, .. } => self.end_active_interval(kind, at_ms, ctx),
            StoreOp::UpdateDuration {
                kind, id, duration_ms, ..
            } => self.update_duration(kind, id, duration_ms, ctx),
        }
    }

    /// Merges staged state into committed state after COMMIT.
    fn commit_staged_state(&mut self) {
        for (key, id) in self.batch_staged.live.drain() {
            match id {
                Some(id) => {
                    self.live_committed.insert(key, id);
                }
                None => {
                    self.live_committed.remove(&key);
                }
            }
        }
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    fn insert_new(&mut self, mut record: Record) -> Result<Record> {
        record.id = RecordId::NONE;
        record.reference_id = None;
        record.version = RECORD_VERSION;
        record.date_created_ms = current_time_ms();

        record.id = insert_record(&self.conn, &record)?;
        let keys = record.domain_keys();
        self.stage_keys(record.kind(), record.id, &[], &keys);
        debug!(kind = %record.kind(), id = %record.id, "inserted");
        Ok(record)
    }

    /// Archives `existing` as a historic row and overwrites it with `updated`.
    fn historize(&mut self, existing: &Record, mut updated: Record) -> Result<Record> {
        let kind = existing.kind();

        let mut snapshot = existing.clone();
        snapshot.reference_id = Some(existing.id);
        snapshot.date_created_ms = current_time_ms();
        let snapshot_id = insert_record(&self.conn, &snapshot)?;

        updated.id = existing.id;
        updated.reference_id = None;
        updated.version = RECORD_VERSION;
        updated.date_created_ms = existing.date_created_ms;
        overwrite_record(&self.conn, existing.id, &updated)?;

        self.stage_keys(kind, existing.id, &existing.domain_keys(), &updated.domain_keys());
        debug!(%kind, id = %existing.id, snapshot = %snapshot_id, "historized update");
        Ok(updated)
    }

    fn set_remote(&mut self, live: &Record, remote_id: String) -> Result<Record> {
        let kind = live.kind();
        set_remote_id(&self.conn, kind, live.id, &remote_id)?;
        let mut updated = live.clone();
        updated.remote_id = Some(remote_id);
        self.stage_keys(kind, live.id, &live.domain_keys(), &updated.domain_keys());
        Ok(updated)
    }

    /// Finds the live row `record` refers to: explicit id, then device
    /// identity, then remote id.
    fn find_existing(&self, record: &Record) -> Result<Option<Record>> {
        let kind = record.kind();
        if !record.id.is_none() {
            if let Some(live) = self.live_by_id(kind, record.id)? {
                return Ok(Some(live));
            }
        }
        if let Some(key) = record.device_key() {
            if let Some(live) = self.live_by_key(kind, DomainKey::Device(key))? {
                return Ok(Some(live));
            }
        }
        if let Some(remote_id) = &record.remote_id {
            if let Some(live) = self.live_by_key(kind, DomainKey::Remote(remote_id.clone()))? {
                return Ok(Some(live));
            }
        }
        Ok(None)
    }

    fn insert_or_update(&mut self, mut record: Record, ctx: &mut TxContext) -> Result<OpOutcome> {
        let existing = match self.find_existing(&record)? {
            Some(existing) => existing,
            None => {
                let inserted = self.insert_new(record)?;
                ctx.changes.push(ChangeCategory::Inserted, inserted.clone());
                return Ok(OpOutcome::Inserted(inserted));
            }
        };

        if record.remote_id.is_none() {
            record.remote_id = existing.remote_id.clone();
        }
        if record.device.is_empty() {
            record.device = existing.device.clone();
        }

        if existing.content_equals(&record) {
            return match record.remote_id {
                Some(remote_id) if existing.remote_id.as_deref() != Some(remote_id.as_str()) => {
                    let updated = self.set_remote(&existing, remote_id)?;
                    ctx.changes.push(ChangeCategory::Reconciled, updated.clone());
                    Ok(OpOutcome::Reconciled(vec![updated]))
                }
                _ => Ok(OpOutcome::Unchanged(existing)),
            };
        }

        let updated = self.historize(&existing, record)?;
        ctx.changes.push(ChangeCategory::Updated, updated.clone());
        Ok(OpOutcome::Updated(updated))
    }

    fn invalidate(&mut self, kind: RecordKind, id: RecordId, ctx: &mut TxContext) -> Result<OpOutcome> {
        let live = match self.live_by_id(kind, id)? {
            Some(live) => live,
            None => return Ok(OpOutcome::NotFound),
        };
        if !live.is_valid {
            return Ok(OpOutcome::Unchanged(live));
        }

        let mut updated = live.clone();
        updated.is_valid = false;
        let updated = self.historize(&live, updated)?;
        ctx.changes.push(ChangeCategory::Invalidated, updated.clone());
        Ok(OpOutcome::Invalidated(updated))
    }

    fn reconcile_remote_ids(&mut self, records: Vec<Record>, ctx: &mut TxContext) -> Result<OpOutcome> {
        let mut reconciled = Vec::new();
        for record in records {
            let remote_id = match record.remote_id.clone() {
                Some(remote_id) => remote_id,
                None => continue,
            };
            let kind = record.kind();

            let live = if !record.id.is_none() {
                self.live_by_id(kind, record.id)?
            } else if let Some(key) = record.device_key() {
                self.live_by_key(kind, DomainKey::Device(key))?
            } else {
                None
            };

            let live = match live {
                Some(live) => live,
                None => {
                    debug!(%kind, id = %record.id, "no live row to reconcile");
                    continue;
                }
            };
            if live.remote_id.as_deref() == Some(remote_id.as_str()) {
                continue;
            }

            let updated = self.set_remote(&live, remote_id)?;
            ctx.changes.push(ChangeCategory::Reconciled, updated.clone());
            reconciled.push(updated);
        }
        Ok(OpOutcome::Reconciled(reconciled))
    }

    fn sync_from_remote(&mut self, mut record: Record, ctx: &mut TxContext) -> Result<OpOutcome> {
        let kind = record.kind();
        let remote_id = match record.remote_id.clone() {
            Some(remote_id) => remote_id,
            None => return Err(Error::sanity(kind, "remote_id", "required for remote records")),
        };

        // Known under its remote id: take the remote content.
        if let Some(live) = self.live_by_key(kind, DomainKey::Remote(remote_id.clone()))? {
            if record.device.is_empty() {
                record.device = live.device.clone();
            }
            if live.content_equals(&record) {
                return Ok(OpOutcome::Unchanged(live));
            }
            let became_invalid = live.is_valid && !record.is_valid;
            let updated = self.historize(&live, record)?;
            return Ok(if became_invalid {
                ctx.changes.push(ChangeCategory::Invalidated, updated.clone());
                OpOutcome::Invalidated(updated)
            } else {
                ctx.changes.push(ChangeCategory::Updated, updated.clone());
                OpOutcome::Updated(updated)
            });
        }

        // Known from the device channel: enrich instead of duplicating.
        if let Some(key) = record.device_key() {
            if let Some(live) = self.live_by_key(kind, DomainKey::Device(key))? {
                let mut current = live;
                let mut outcome = OpOutcome::Unchanged(current.clone());

                if current.remote_id.as_deref() != Some(remote_id.as_str()) {
                    current = self.set_remote(&current, remote_id)?;
                    ctx.changes.push(ChangeCategory::Reconciled, current.clone());
                    outcome = OpOutcome::Reconciled(vec![current.clone()]);
                }
                if !record.is_valid && current.is_valid {
                    let mut invalid = current.clone();
                    invalid.is_valid = false;
                    let updated = self.historize(&current, invalid)?;
                    ctx.changes.push(ChangeCategory::Invalidated, updated.clone());
                    outcome = OpOutcome::Invalidated(updated);
                }
                return Ok(outcome);
            }
        }

        let inserted = self.insert_new(record)?;
        ctx.changes.push(ChangeCategory::Inserted, inserted.clone());
        Ok(OpOutcome::Inserted(inserted))
    }

    fn end_active_interval(&mut self, kind: RecordKind, at_ms: i64, ctx: &mut TxContext) -> Result<OpOutcome> {
        let running = match interval::temporary_at(&self.conn, kind, at_ms)? {
            Some(running) => running,
            None => return Ok(OpOutcome::NotFound),
        };

        let mut ended = running.clone();
        let duration = at_ms - running.timestamp_ms;
        if duration > 0 {
            ended.duration_ms = duration;
        } else {
            // Ended at its start: it never ran, and duration 0 would turn it
            // into a permanent value.
            ended.is_valid = false;
        }

        let updated = self.historize(&running, ended)?;
        ctx.changes.push(ChangeCategory::IntervalEnded, updated.clone());
        Ok(OpOutcome::IntervalEnded(updated))
    }

    fn update_duration(
        &mut self,
        kind: RecordKind,
        id: RecordId,
        duration_ms: i64,
        ctx: &mut TxContext,
    ) -> Result<OpOutcome> {
        let live = match self.live_by_id(kind, id)? {
            Some(live) => live,
            None => return Ok(OpOutcome::NotFound),
        };
        if live.duration_ms == duration_ms {
            return Ok(OpOutcome::Unchanged(live));
        }

        let mut updated = live.clone();
        updated.duration_ms = duration_ms;
        let updated = self.historize(&live, updated)?;
        ctx.changes.push(ChangeCategory::DurationUpdated, updated.clone());
        Ok(OpOutcome::DurationUpdated(updated))
    }

    // =========================================================================
    // Maintenance (not batched)
    // =========================================================================

    /// Persists `advance_to` as the checkpoint of `kind` unless it is behind.
    pub fn acknowledge(&mut self, kind: RecordKind, advance_to: RecordId) -> Result<RecordId> {
        self.conn.execute(
            "INSERT INTO sync_checkpoints (kind, last_id) VALUES (?1, ?2) \
             ON CONFLICT(kind) DO UPDATE SET last_id = MAX(last_id, excluded.last_id)",
            params![kind.as_str(), advance_to.as_raw() as i64],
        )?;
        reader::read_checkpoint(&self.conn, kind)
    }

    /// Deletes rows with an event time before `cutoff_ms`, together with their
    /// historic snapshots. Kinds retained forever are skipped.
    pub fn purge_older_than(&mut self, cutoff_ms: i64) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let tx = self.conn.transaction()?;
        for kind in RecordKind::ALL {
            if kind.is_retained_forever() {
                continue;
            }
            let table = kind.table();
            let historic = tx.execute(
                &format!(
                    "DELETE FROM {table} WHERE reference_id IN \
                     (SELECT id FROM {table} WHERE reference_id IS NULL AND timestamp_ms < ?1)"
                ),
                params![cutoff_ms],
            )?;
            let live = tx.execute(
                &format!("DELETE FROM {table} WHERE reference_id IS NULL AND timestamp_ms < ?1"),
                params![cutoff_ms],
            )?;
            if historic + live > 0 {
                report.removed.insert(kind, historic + live);
            }
        }
        tx.commit()?;

        self.load_live_pointers()?;
        info!(cutoff_ms, removed = report.total(), "retention purge finished");
        Ok(report)
    }

    /// Deletes every historic row.
    pub fn purge_historic(&mut self) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let tx = self.conn.transaction()?;
        for kind in RecordKind::ALL {
            let removed = tx.execute(
                &format!("DELETE FROM {} WHERE reference_id IS NOT NULL", kind.table()),
                [],
            )?;
            if removed > 0 {
                report.removed.insert(kind, removed);
            }
        }
        tx.commit()?;

        self.load_live_pointers()?;
        info!(removed = report.total(), "historic purge finished");
        Ok(report)
    }
}

fn validate_record(record: &Record) -> Result<()> {
    record.payload.validate()?;
    validate_duration(record.kind(), record.duration_ms)
}

fn validate_duration(kind: RecordKind, duration_ms: i64) -> Result<()> {
    if duration_ms < 0 {
        return Err(Error::sanity(kind, "duration_ms", "must not be negative"));
    }
    if kind == RecordKind::Carbs && duration_ms > MAX_CARBS_DURATION_MS {
        return Err(Error::sanity(kind, "duration_ms", "carbs may not be spread over more than 24h"));
    }
    Ok(())
}

// =============================================================================
// Writer Handle
// =============================================================================

/// Async handle to the writer thread.
#[derive(Clone)]
pub struct BatchWriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl BatchWriterHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Closed("writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Closed("writer dropped response".to_string()))?
    }

    /// Starts a transaction.
    pub fn begin_transaction(&self) -> TransactionBuilder {
        TransactionBuilder {
            ops: Vec::new(),
            handle: self.clone(),
        }
    }

    /// Submits a transaction. Empty transactions never reach the writer.
    pub async fn submit(&self, ops: Vec<StoreOp>) -> Result<TransactionOutcome> {
        if ops.is_empty() {
            return Ok(TransactionOutcome::default());
        }
        self.request(|response| WriteRequest::Transaction { ops, response })
            .await
    }

    pub async fn acknowledge(&self, kind: RecordKind, advance_to: RecordId) -> Result<RecordId> {
        self.request(|response| WriteRequest::Acknowledge {
            kind,
            advance_to,
            response,
        })
        .await
    }

    pub async fn purge_older_than(&self, cutoff_ms: i64) -> Result<PurgeReport> {
        self.request(|response| WriteRequest::PurgeOlderThan { cutoff_ms, response })
            .await
    }

    pub async fn purge_historic(&self) -> Result<PurgeReport> {
        self.request(|response| WriteRequest::PurgeHistoric { response })
            .await
    }

    /// Asks the writer to flush and stop.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// Collects operations that commit or abort together.
///
/// ```rust,ignore
/// let mut tx = store.begin_transaction();
/// tx.insert_or_update(bolus).with_audit(AuditEntry::new("BOLUS", "Wizard"));
/// tx.insert_or_update(carbs);
/// let outcome = tx.submit().await?;
/// ```
pub struct TransactionBuilder {
    ops: Vec<StoreOp>,
    handle: BatchWriterHandle,
}

impl TransactionBuilder {
    pub fn push(&mut self, op: StoreOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn insert_or_update(&mut self, record: Record) -> &mut Self {
        self.push(StoreOp::InsertOrUpdate { record, audit: None })
    }

    pub fn invalidate(&mut self, kind: RecordKind, id: RecordId, reason: AuditEntry) -> &mut Self {
        self.push(StoreOp::Invalidate { kind, id, reason })
    }

    pub fn reconcile_remote_ids(&mut self, records: Vec<Record>) -> &mut Self {
        self.push(StoreOp::ReconcileRemoteIds { records })
    }

    pub fn sync_from_remote(&mut self, record: Record) -> &mut Self {
        self.push(StoreOp::SyncFromRemote { record })
    }

    pub fn sync_pump_record(&mut self, record: Record) -> &mut Self {
        self.push(StoreOp::SyncPumpRecord { record, audit: None })
    }

    pub fn end_active_interval(&mut self, kind: RecordKind, at_ms: i64) -> &mut Self {
        self.push(StoreOp::EndActiveInterval {
            kind,
            at_ms,
            audit: None,
        })
    }

    pub fn update_duration(&mut self, kind: RecordKind, id: RecordId, duration_ms: i64) -> &mut Self {
        self.push(StoreOp::UpdateDuration {
            kind,
            id,
            duration_ms,
            audit: None,
        })
    }

    /// Attaches an audit entry to the most recently added operation.
    pub fn with_audit(&mut self, entry: AuditEntry) -> &mut Self {
        if let Some(op) = self.ops.last_mut() {
            op.set_audit(entry);
        }
        self
    }

    /// Submits the transaction.
    pub async fn submit(self) -> Result<TransactionOutcome> {
        self.handle.submit(self.ops).await
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the writer loop, collecting transactions into batches.
pub async fn run_batch_writer(
    mut writer: BatchWriter,
    mut rx: mpsc::Receiver<WriteRequest>,
    config: WriterConfig,
) {
    let mut batch: Vec<PendingTransaction> = Vec::new();
    let mut batch_start = Instant::now();

    loop {
        let wait_timeout = if batch.is_empty() {
            Duration::from_secs(3600)
        } else {
            config.batch_timeout.saturating_sub(batch_start.elapsed())
        };

        match timeout(wait_timeout, rx.recv()).await {
            Ok(Some(WriteRequest::Transaction { ops, response })) => {
                if batch.is_empty() {
                    batch_start = Instant::now();
                }
                batch.push(PendingTransaction { ops, response });

                if batch.len() >= config.batch_max_size {
                    writer.execute_batch(std::mem::take(&mut batch));
                }
            }
            Ok(Some(WriteRequest::Acknowledge {
                kind,
                advance_to,
                response,
            })) => {
                // Keep request order: earlier transactions commit first.
                writer.execute_batch(std::mem::take(&mut batch));
                let _ = response.send(writer.acknowledge(kind, advance_to));
            }
            Ok(Some(WriteRequest::PurgeOlderThan { cutoff_ms, response })) => {
                writer.execute_batch(std::mem::take(&mut batch));
                let _ = response.send(writer.purge_older_than(cutoff_ms));
            }
            Ok(Some(WriteRequest::PurgeHistoric { response })) => {
                writer.execute_batch(std::mem::take(&mut batch));
                let _ = response.send(writer.purge_historic());
            }
            Ok(Some(WriteRequest::Shutdown)) | Ok(None) => {
                writer.execute_batch(std::mem::take(&mut batch));
                break;
            }
            Err(_) => {
                writer.execute_batch(std::mem::take(&mut batch));
            }
        }
    }
    debug!("writer stopped");
}

/// Spawns the writer on a dedicated thread and returns its handle.
pub fn spawn_batch_writer(
    conn: Connection,
    config: WriterConfig,
    bus: Arc<ChangeBus>,
    audit: Arc<dyn AuditSink>,
    device: Arc<dyn DeviceState>,
) -> Result<BatchWriterHandle> {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

    let writer = BatchWriter::new(conn, bus, audit, device)?;

    std::thread::Builder::new()
        .name("therapydb-writer".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "failed to create writer runtime");
                    return;
                }
            };
            rt.block_on(run_batch_writer(writer, rx, config));
        })
        .map_err(|e| Error::Schema(format!("failed to spawn writer thread: {e}")))?;

    Ok(BatchWriterHandle { tx })
}

// =============================================================================
// Tests
// =============================================================================
