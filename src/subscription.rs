//! # Change Notification Bus
//!
//! Every committed transaction produces one [`ChangeSet`]. The writer hands it
//! to the [`ChangeBus`] exactly once, and the bus delivers it through two
//! sinks:
//!
//! ```text
//!                         ┌──────────────────────────────┐
//!   writer (after COMMIT) │          ChangeBus           │
//!   ─────── publish ─────►│                              │
//!                         │  1. legacy observers (sync)  │──► ChangeObserver::on_change
//!                         │  2. broadcast (bounded)      │──► Subscription::next
//!                         └──────────────────────────────┘
//! ```
//!
//! ## Backpressure Handling
//!
//! The broadcast channel holds a bounded number of change-sets (64 by
//! default). A subscriber that falls behind loses the *oldest* unread sets,
//! never the producer's time: `tokio::sync::broadcast` overwrites the oldest
//! slot and the receiver later sees `RecvError::Lagged(n)`. A lag is not an
//! error here. [`Subscription`] logs it, counts it in [`Subscription::missed`]
//! and carries on with the oldest set still buffered.
//!
//! Callers that must see every change register a [`ChangeObserver`] instead.
//! Observers run synchronously on the writer thread.
//!
//! ## Filtering
//!
//! Subscribers interested in one record kind pass it at subscribe time and
//! receive only the part of each change-set that concerns that kind. Sets with
//! nothing left after filtering are skipped.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use futures::Stream;
use tokio::sync::broadcast;
use tracing::warn;

use crate::types::{Record, RecordKind};

// =============================================================================
// Configuration
// =============================================================================

/// Default number of change-sets buffered per subscriber.
pub const DEFAULT_CHANGE_BUFFER_CAPACITY: usize = 64;

// =============================================================================
// Change Set
// =============================================================================

/// What happened to a record inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeCategory {
    Inserted,
    Updated,
    Invalidated,
    Reconciled,
    IntervalEnded,
    DurationUpdated,
}

/// All records touched by one committed transaction, by category.
///
/// Records are the live rows as they are after the commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub inserted: Vec<Record>,
    pub updated: Vec<Record>,
    pub invalidated: Vec<Record>,
    pub reconciled: Vec<Record>,
    pub interval_ended: Vec<Record>,
    pub duration_updated: Vec<Record>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `record` under `category`.
    pub fn push(&mut self, category: ChangeCategory, record: Record) {
        self.bucket_mut(category).push(record);
    }

    fn bucket_mut(&mut self, category: ChangeCategory) -> &mut Vec<Record> {
        match category {
            ChangeCategory::Inserted => &mut self.inserted,
            ChangeCategory::Updated => &mut self.updated,
            ChangeCategory::Invalidated => &mut self.invalidated,
            ChangeCategory::Reconciled => &mut self.reconciled,
            ChangeCategory::IntervalEnded => &mut self.interval_ended,
            ChangeCategory::DurationUpdated => &mut self.duration_updated,
        }
    }

    /// Appends every record of `other`.
    pub fn extend(&mut self, other: ChangeSet) {
        self.inserted.extend(other.inserted);
        self.updated.extend(other.updated);
        self.invalidated.extend(other.invalidated);
        self.reconciled.extend(other.reconciled);
        self.interval_ended.extend(other.interval_ended);
        self.duration_updated.extend(other.duration_updated);
    }

    /// Iterates over all `(category, record)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ChangeCategory, &Record)> {
        tagged(ChangeCategory::Inserted, &self.inserted)
            .chain(tagged(ChangeCategory::Updated, &self.updated))
            .chain(tagged(ChangeCategory::Invalidated, &self.invalidated))
            .chain(tagged(ChangeCategory::Reconciled, &self.reconciled))
            .chain(tagged(ChangeCategory::IntervalEnded, &self.interval_ended))
            .chain(tagged(ChangeCategory::DurationUpdated, &self.duration_updated))
    }

    pub fn len(&self) -> usize {
        self.inserted.len()
            + self.updated.len()
            + self.invalidated.len()
            + self.reconciled.len()
            + self.interval_ended.len()
            + self.duration_updated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record kinds present in this set.
    pub fn kinds(&self) -> BTreeSet<RecordKind> {
        self.iter().map(|(_, r)| r.kind()).collect()
    }

    /// A copy holding only records of `kind`.
    pub fn filtered(&self, kind: RecordKind) -> ChangeSet {
        let mut out = ChangeSet::new();
        for (category, record) in self.iter().filter(|(_, r)| r.kind() == kind) {
            out.push(category, record.clone());
        }
        out
    }
}

fn tagged(
    category: ChangeCategory,
    records: &[Record],
) -> impl Iterator<Item = (ChangeCategory, &Record)> {
    records.iter().map(move |r| (category, r))
}

// =============================================================================
// Legacy Observers
// =============================================================================

/// Synchronous change listener.
///
/// Called on the writer thread right after commit, before the transaction's
/// caller is answered. Keep it short and never call back into the store.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, changes: &ChangeSet);
}

// =============================================================================
// Change Bus
// =============================================================================

/// The single emission point for committed change-sets.
pub struct ChangeBus {
    broadcast_tx: broadcast::Sender<Arc<ChangeSet>>,
    observers: RwLock<Vec<Arc<dyn ChangeObserver>>>,
}

impl ChangeBus {
    /// Creates a bus buffering up to `capacity` change-sets per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            broadcast_tx,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a legacy synchronous observer.
    pub fn add_observer(&self, observer: Arc<dyn ChangeObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Subscribes to the buffered stream, optionally for one kind only.
    pub fn subscribe(&self, filter: Option<RecordKind>) -> Subscription {
        Subscription {
            receiver: self.broadcast_tx.subscribe(),
            filter,
            missed: 0,
        }
    }

    /// Delivers `changes` to both sinks. Empty sets are not published.
    pub fn publish(&self, changes: ChangeSet) {
        if changes.is_empty() {
            return;
        }

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            observer.on_change(&changes);
        }

        // No receivers is fine.
        let _ = self.broadcast_tx.send(Arc::new(changes));
    }

    /// Number of live stream subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.broadcast_tx.receiver_count()
    }

    /// Number of registered legacy observers.
    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_BUFFER_CAPACITY)
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// A buffered change-set subscription.
///
/// # Example
///
/// ```rust,ignore
/// let mut sub = store.subscribe(Some(RecordKind::Bolus));
/// while let Some(changes) = sub.next().await {
///     for record in &changes.inserted {
///         println!("new bolus {}", record.id);
///     }
/// }
/// ```
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<ChangeSet>>,
    filter: Option<RecordKind>,
    missed: u64,
}

impl Subscription {
    fn apply_filter(&self, changes: Arc<ChangeSet>) -> Option<Arc<ChangeSet>> {
        match self.filter {
            None => Some(changes),
            Some(kind) => {
                let filtered = changes.filtered(kind);
                (!filtered.is_empty()).then(|| Arc::new(filtered))
            }
        }
    }

    fn note_lag(&mut self, n: u64) {
        self.missed += n;
        warn!(missed = n, total_missed = self.missed, "change subscriber lagged, oldest change-sets dropped");
    }

    /// Waits for the next change-set.
    ///
    /// Returns `None` once the store has shut down.
    pub async fn next(&mut self) -> Option<Arc<ChangeSet>> {
        loop {
            match self.receiver.recv().await {
                Ok(changes) => {
                    if let Some(changes) = self.apply_filter(changes) {
                        return Some(changes);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => self.note_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered change-set without waiting.
    pub fn try_next(&mut self) -> Option<Arc<ChangeSet>> {
        loop {
            match self.receiver.try_recv() {
                Ok(changes) => {
                    if let Some(changes) = self.apply_filter(changes) {
                        return Some(changes);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    /// Change-sets dropped so far because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// The kind filter given at subscribe time.
    pub fn filter(&self) -> Option<RecordKind> {
        self.filter
    }

    /// Converts the subscription into a `Stream`.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Arc<ChangeSet>> + Send>> {
        Box::pin(futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|changes| (changes, sub))
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================
