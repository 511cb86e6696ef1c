//! # Async API for TherapyDB
//!
//! [`TreatmentStore`] is the entry point. It wraps the writer thread and the
//! reader pool behind async methods.
//!
//! ## The SQLite Challenge
//!
//! `rusqlite::Connection` is `!Sync`, so connections are never shared.
//! Instead every connection lives on its own OS thread and async callers talk
//! to it over channels:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Async Tasks                                   │
//! └────────────────────────────────┬────────────────────────────────────────┘
//!                    ┌─────────────┴─────────────┐
//!                    ▼                           ▼
//!            ┌───────────────┐         ┌─────────────────────┐
//!            │  BatchWriter  │         │     ReadPool        │
//!            │  (1 thread)   │         │   (N threads)       │
//!            │  read-write   │         │  read-only conns    │
//!            └───────┬───────┘         └──────────┬──────────┘
//!                    │  publish after COMMIT      │
//!                    ▼                            │
//!            ┌───────────────┐                    │
//!            │   ChangeBus   │                    │
//!            └───────────────┘                    │
//!                    └─────────────┬──────────────┘
//!                                  ▼
//!                          ┌─────────────┐
//!                          │   SQLite    │
//!                          │   (WAL)     │
//!                          └─────────────┘
//! ```
//!
//! Reads go straight to SQLite through read-only connections, so a reader
//! always sees the latest committed state and never a half-applied
//! transaction.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info};

use crate::audit::{AuditEntry, AuditSink, TracingAuditSink};
use crate::carbs;
use crate::config::StoreConfig;
use crate::device::{DeviceState, NoDevice};
use crate::error::{Error, Result};
use crate::interval;
use crate::reader::{self, Order, ReadJob, ReadRequest};
use crate::schema::Database;
use crate::subscription::{ChangeBus, ChangeObserver, Subscription};
use crate::sync::{self, SyncStep};
use crate::types::{DeviceKey, Record, RecordId, RecordKind};
use crate::writer::{
    spawn_batch_writer, BatchWriterHandle, OpOutcome, PurgeReport, StoreOp, TransactionBuilder,
    TransactionOutcome,
};

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

/// External collaborators installed at open time.
#[derive(Clone)]
pub struct Collaborators {
    pub audit: Arc<dyn AuditSink>,
    pub device: Arc<dyn DeviceState>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            audit: Arc::new(TracingAuditSink),
            device: Arc::new(NoDevice),
        }
    }
}

// =============================================================================
// TreatmentStore
// =============================================================================

/// Async handle to a treatment database.
///
/// `Clone`, `Send` and `Sync`; all clones share the same writer, readers and
/// change bus.
///
/// # Example
///
/// ```rust,ignore
/// use therapydb::{Carbs, Record, StoreConfig, TreatmentStore};
///
/// let store = TreatmentStore::open("therapy.db", StoreConfig::default(), Default::default()).await?;
/// let outcome = store.insert_or_update(Record::new(now, Carbs::new(40.0))).await?;
/// let id = outcome.record().map(|r| r.id);
/// store.shutdown().await;
/// ```
#[derive(Clone)]
pub struct TreatmentStore {
    writer: BatchWriterHandle,
    read_tx: mpsc::Sender<ReadRequest>,
    reader_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    reader_count: usize,
    bus: Arc<ChangeBus>,
    config: Arc<StoreConfig>,
}

impl TreatmentStore {
    /// Opens or creates a database at `path`.
    pub async fn open<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let db = Database::open(&path)?;
        let bus = Arc::new(ChangeBus::new(config.change_buffer_capacity));
        let writer = spawn_batch_writer(
            db.into_connection(),
            config.writer_config(),
            Arc::clone(&bus),
            collaborators.audit,
            collaborators.device,
        )?;

        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let read_rx = Arc::new(Mutex::new(read_rx));
        let reader_count = config.reader_count();
        let mut reader_handles = Vec::with_capacity(reader_count);

        for i in 0..reader_count {
            let rx = Arc::clone(&read_rx);
            let reader_path = path.clone();

            let handle = thread::Builder::new()
                .name(format!("therapydb-reader-{i}"))
                .spawn(move || {
                    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                        Ok(rt) => rt,
                        Err(e) => {
                            error!(error = %e, "failed to create reader runtime");
                            return;
                        }
                    };
                    let conn = match Connection::open_with_flags(
                        &reader_path,
                        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                    ) {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "failed to open read-only connection");
                            return;
                        }
                    };
                    rt.block_on(reader::run_reader_pooled(conn, rx));
                })
                .map_err(|e| Error::Schema(format!("failed to spawn reader thread: {e}")))?;

            reader_handles.push(handle);
        }

        info!(path = %path.display(), readers = reader_count, "store opened");

        Ok(Self {
            writer,
            read_tx,
            reader_handles: Arc::new(Mutex::new(reader_handles)),
            reader_count,
            bus,
            config: Arc::new(config),
        })
    }

    /// Returns the number of reader threads in the pool.
    pub fn reader_count(&self) -> usize {
        self.reader_count
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Runs `f` on a pooled read-only connection.
    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        let job: ReadJob = Box::new(move |conn: &Connection| {
            let _ = response_tx.send(f(conn));
        });

        self.read_tx
            .send(ReadRequest::Run(job))
            .await
            .map_err(|_| Error::Closed("reader pool has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Closed("reader dropped response".to_string()))?
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The live row `id` (valid or not). Historic ids yield `None`.
    pub async fn find_current_by_id(&self, kind: RecordKind, id: RecordId) -> Result<Option<Record>> {
        self.read(move |conn| reader::find_current_by_id(conn, kind, id)).await
    }

    /// Any row `id`, live or historic.
    pub async fn find_by_id(&self, kind: RecordKind, id: RecordId) -> Result<Option<Record>> {
        self.read(move |conn| reader::find_by_id(conn, kind, id)).await
    }

    pub async fn find_current_by_remote_id(
        &self,
        kind: RecordKind,
        remote_id: impl Into<String>,
    ) -> Result<Option<Record>> {
        let remote_id = remote_id.into();
        self.read(move |conn| reader::find_current_by_remote_id(conn, kind, &remote_id))
            .await
    }

    /// The live row recorded for the device event `key`.
    pub async fn find_current_by_device(&self, kind: RecordKind, key: DeviceKey) -> Result<Option<Record>> {
        self.read(move |conn| reader::find_current_by_device(conn, kind, &key)).await
    }

    /// Valid live rows with `timestamp >= from`.
    pub async fn query_from_time(&self, kind: RecordKind, from: i64, order: Order) -> Result<Vec<Record>> {
        self.read(move |conn| reader::query_from_time(conn, kind, from, order)).await
    }

    /// Valid live rows with `from <= timestamp <= to`.
    pub async fn query_from_time_to_time(
        &self,
        kind: RecordKind,
        from: i64,
        to: i64,
        order: Order,
    ) -> Result<Vec<Record>> {
        self.read(move |conn| reader::query_from_time_to_time(conn, kind, from, to, order))
            .await
    }

    /// Live rows in range, invalid ones included.
    pub async fn query_including_invalid(
        &self,
        kind: RecordKind,
        from: i64,
        to: Option<i64>,
        order: Order,
    ) -> Result<Vec<Record>> {
        self.read(move |conn| reader::query_including_invalid(conn, kind, from, to, order))
            .await
    }

    /// Rows created in `(since, until]`, historic ones included.
    pub async fn collect_new_since(
        &self,
        kind: RecordKind,
        since_ms: i64,
        until_ms: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Record>> {
        self.read(move |conn| reader::collect_new_since(conn, kind, since_ms, until_ms, limit, offset))
            .await
    }

    /// Historic snapshots of live row `id`, oldest first.
    pub async fn history_of(&self, kind: RecordKind, id: RecordId) -> Result<Vec<Record>> {
        self.read(move |conn| reader::history_of(conn, kind, id)).await
    }

    /// Every row of `kind`, live and historic, in id order.
    pub async fn all_rows(&self, kind: RecordKind) -> Result<Vec<Record>> {
        self.read(move |conn| reader::all_rows(conn, kind)).await
    }

    // =========================================================================
    // Interval Resolver and Carbs
    // =========================================================================

    /// The value of `kind` active at `at_ms`.
    ///
    /// RunningMode falls back to the configured default mode.
    pub async fn active_at(&self, kind: RecordKind, at_ms: i64) -> Result<Option<Record>> {
        let default_mode = self.config.default_running_mode;
        self.read(move |conn| interval::active_at_or_default(conn, kind, at_ms, default_mode))
            .await
    }

    /// Expands one carbs record into ticks.
    pub fn expand_carbs(&self, record: &Record) -> Vec<Record> {
        carbs::expand_carbs(record, self.config.carbs_tick_ms())
    }

    /// Carbs ticks with `from <= timestamp <= to`, ordered by time.
    ///
    /// Spread entries that started before `from` contribute their later ticks.
    pub async fn query_expanded_carbs(&self, from: i64, to: i64) -> Result<Vec<Record>> {
        let tick_ms = self.config.carbs_tick_ms();
        self.read(move |conn| {
            let rows = reader::query_overlapping(conn, RecordKind::Carbs, from, to)?;
            let mut ticks: Vec<Record> = rows
                .iter()
                .flat_map(|record| carbs::expand_carbs(record, tick_ms))
                .filter(|tick| tick.timestamp_ms >= from && tick.timestamp_ms <= to)
                .collect();
            ticks.sort_by_key(|tick| (tick.timestamp_ms, tick.id));
            Ok(ticks)
        })
        .await
    }

    // =========================================================================
    // Sync Cursor
    // =========================================================================

    /// The acknowledged checkpoint of `kind`.
    pub async fn checkpoint(&self, kind: RecordKind) -> Result<RecordId> {
        self.read(move |conn| reader::read_checkpoint(conn, kind)).await
    }

    /// Next unit of sync work after the stored checkpoint.
    pub async fn next_sync_element(&self, kind: RecordKind) -> Result<SyncStep> {
        self.read(move |conn| {
            let checkpoint = reader::read_checkpoint(conn, kind)?;
            sync::next_sync_element(conn, kind, checkpoint)
        })
        .await
    }

    /// Next unit of sync work after an explicit checkpoint.
    pub async fn next_sync_element_from(&self, kind: RecordKind, checkpoint: RecordId) -> Result<SyncStep> {
        self.read(move |conn| sync::next_sync_element(conn, kind, checkpoint))
            .await
    }

    /// Persists `advance_to` as the checkpoint of `kind`.
    ///
    /// Never moves backwards; returns the checkpoint now stored.
    pub async fn acknowledge(&self, kind: RecordKind, advance_to: RecordId) -> Result<RecordId> {
        self.writer.acknowledge(kind, advance_to).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Begins a transaction of several operations that commit or abort together.
    pub fn begin_transaction(&self) -> TransactionBuilder {
        self.writer.begin_transaction()
    }

    async fn submit_one(&self, op: StoreOp) -> Result<OpOutcome> {
        let outcome = self.writer.submit(vec![op]).await?;
        Ok(outcome.outcomes.into_iter().next().unwrap_or(OpOutcome::NotFound))
    }

    pub async fn insert_or_update(&self, record: Record) -> Result<OpOutcome> {
        self.submit_one(StoreOp::InsertOrUpdate { record, audit: None }).await
    }

    /// Soft-deletes live row `id`. Missing ids yield [`OpOutcome::NotFound`].
    pub async fn invalidate(&self, kind: RecordKind, id: RecordId, reason: AuditEntry) -> Result<OpOutcome> {
        self.submit_one(StoreOp::Invalidate { kind, id, reason }).await
    }

    /// Writes remote ids into live rows in place.
    pub async fn reconcile_remote_ids(&self, records: Vec<Record>) -> Result<TransactionOutcome> {
        self.writer
            .submit(vec![StoreOp::ReconcileRemoteIds { records }])
            .await
    }

    pub async fn sync_from_remote(&self, record: Record) -> Result<OpOutcome> {
        self.submit_one(StoreOp::SyncFromRemote { record }).await
    }

    pub async fn sync_pump_record(&self, record: Record) -> Result<OpOutcome> {
        self.submit_one(StoreOp::SyncPumpRecord { record, audit: None }).await
    }

    pub async fn end_active_interval(&self, kind: RecordKind, at_ms: i64) -> Result<OpOutcome> {
        self.submit_one(StoreOp::EndActiveInterval {
            kind,
            at_ms,
            audit: None,
        })
        .await
    }

    pub async fn update_duration(&self, kind: RecordKind, id: RecordId, duration_ms: i64) -> Result<OpOutcome> {
        self.submit_one(StoreOp::UpdateDuration {
            kind,
            id,
            duration_ms,
            audit: None,
        })
        .await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Deletes rows (and their history) with an event time before `cutoff_ms`.
    pub async fn purge_older_than(&self, cutoff_ms: i64) -> Result<PurgeReport> {
        self.writer.purge_older_than(cutoff_ms).await
    }

    /// Deletes every historic row.
    pub async fn purge_historic(&self) -> Result<PurgeReport> {
        self.writer.purge_historic().await
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Subscribes to committed change-sets, optionally for one kind only.
    pub fn subscribe(&self, filter: Option<RecordKind>) -> Subscription {
        self.bus.subscribe(filter)
    }

    /// Registers a synchronous observer, called on the writer thread.
    pub fn add_observer(&self, observer: Arc<dyn ChangeObserver>) {
        self.bus.add_observer(observer);
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops the readers and the writer.
    ///
    /// Pending transactions are committed first. Other clones get
    /// [`Error::Closed`] afterwards.
    pub async fn shutdown(self) {
        for _ in 0..self.reader_count {
            let _ = self.read_tx.send(ReadRequest::Shutdown).await;
        }

        let handles = std::mem::take(&mut *self.reader_handles.lock().await);
        for handle in handles {
            let _ = handle.join();
        }

        self.writer.shutdown().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{Bolus, BolusType, Carbs, Mode, RunningMode, TemporaryBasal};
    use crate::types::MINUTE_MS;

    /// Returns (store, temp_dir); temp_dir must outlive the store.
    async fn test_store() -> (TreatmentStore, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig {
            reader_threads: Some(2),
            ..StoreConfig::default()
        };
        let store = TreatmentStore::open(temp_dir.path().join("test.db"), config, Collaborators::default())
            .await
            .unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_open() {
        let (store, _temp_dir) = test_store().await;
        assert_eq!(store.reader_count(), 2);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let (store, _temp_dir) = test_store().await;

        let outcome = store
            .insert_or_update(Record::new(1_000, Bolus::new(2.5, BolusType::Normal)))
            .await
            .unwrap();
        let id = outcome.record().unwrap().id;

        let found = store.find_current_by_id(RecordKind::Bolus, id).await.unwrap().unwrap();
        assert_eq!(found.timestamp_ms, 1_000);
        assert!(store.find_current_by_id(RecordKind::Carbs, id).await.unwrap().is_none());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_active_at_default_running_mode() {
        let (store, _temp_dir) = test_store().await;

        let active = store.active_at(RecordKind::RunningMode, 5_000).await.unwrap().unwrap();
        assert_eq!(active.payload.as_running_mode().unwrap().mode, Mode::ClosedLoop);

        store
            .insert_or_update(Record::new(0, RunningMode::new(Mode::OpenLoop)))
            .await
            .unwrap();
        let active = store.active_at(RecordKind::RunningMode, 5_000).await.unwrap().unwrap();
        assert_eq!(active.payload.as_running_mode().unwrap().mode, Mode::OpenLoop);

        assert!(store.active_at(RecordKind::TemporaryBasal, 5_000).await.unwrap().is_none());
        store
            .insert_or_update(Record::new(0, TemporaryBasal::percent(150.0)).with_duration(30 * MINUTE_MS))
            .await
            .unwrap();
        assert!(store.active_at(RecordKind::TemporaryBasal, 5_000).await.unwrap().is_some());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_expanded_carbs_includes_earlier_start() {
        let (store, _temp_dir) = test_store().await;

        store
            .insert_or_update(Record::new(0, Carbs::new(40.0)).with_duration(60 * MINUTE_MS))
            .await
            .unwrap();
        store
            .insert_or_update(Record::new(20 * MINUTE_MS, Carbs::new(12.0)))
            .await
            .unwrap();

        let ticks = store
            .query_expanded_carbs(15 * MINUTE_MS, 45 * MINUTE_MS)
            .await
            .unwrap();
        let shape: Vec<(i64, f64)> = ticks
            .iter()
            .map(|t| (t.timestamp_ms / MINUTE_MS, t.payload.as_carbs().unwrap().amount))
            .collect();
        assert_eq!(shape, vec![(15, 10.0), (20, 12.0), (30, 10.0), (45, 10.0)]);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_unbounded_carbs_spread_is_rejected() {
        let (store, _temp_dir) = test_store().await;

        let err = store
            .insert_or_update(Record::new(0, Carbs::new(40.0)).with_duration(i64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Sanity { field, .. } if field.as_str() == "duration_ms"));

        let id = store
            .insert_or_update(Record::new(0, Carbs::new(40.0)).with_duration(60 * MINUTE_MS))
            .await
            .unwrap()
            .record()
            .unwrap()
            .id;
        assert!(store
            .update_duration(RecordKind::Carbs, id, 25 * 60 * MINUTE_MS)
            .await
            .unwrap_err()
            .is_sanity());

        let ticks = store.query_expanded_carbs(0, 60 * MINUTE_MS).await.unwrap();
        assert_eq!(ticks.len(), 4);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let (store, _temp_dir) = test_store().await;
        let other = store.clone();
        store.shutdown().await;

        let result = other.find_current_by_id(RecordKind::Bolus, RecordId::from_raw(1)).await;
        assert!(matches!(result, Err(Error::Closed(_))));
    }
}
