#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use therapydb::{
    AuditEntry, AuditSink, ChangeObserver, ChangeSet, Collaborators, Database, Record, RecordKind,
    StoreConfig, TreatmentStore, UploadAck, UploadError, Uploader,
};
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once; `RUST_LOG=therapydb=debug` shows writer logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn test_config() -> StoreConfig {
    StoreConfig {
        reader_threads: Some(2),
        ..StoreConfig::default()
    }
}

pub async fn open_store(path: &Path) -> TreatmentStore {
    open_store_with(path, test_config(), Collaborators::default()).await
}

pub async fn open_store_with(
    path: &Path,
    config: StoreConfig,
    collaborators: Collaborators,
) -> TreatmentStore {
    init_tracing();
    TreatmentStore::open(path, config, collaborators)
        .await
        .expect("open store")
}

/// Every row of `kind` straight from disk, live and historic.
pub fn raw_rows(path: &Path, kind: RecordKind) -> Vec<Record> {
    let conn = open_read_only(path);
    therapydb::reader::all_rows(&conn, kind).expect("read rows")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Collaborator doubles
// =============================================================================

#[derive(Default)]
pub struct RecordingAudit {
    pub entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAudit {
    pub fn actions(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, entry: &AuditEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub seen: Mutex<Vec<ChangeSet>>,
}

impl RecordingObserver {
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl ChangeObserver for RecordingObserver {
    fn on_change(&self, changes: &ChangeSet) {
        self.seen.lock().unwrap().push(changes.clone());
    }
}

/// Uploader that assigns `remote-<id>` and can be told to fail.
#[derive(Default)]
pub struct MockUploader {
    pub uploaded: Mutex<Vec<Record>>,
    /// Fail once this many uploads succeeded.
    pub fail_after: Option<usize>,
}

impl MockUploader {
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }

    pub fn uploaded(&self) -> Vec<Record> {
        self.uploaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn upload(&self, _kind: RecordKind, record: &Record) -> Result<UploadAck, UploadError> {
        let mut uploaded = self.uploaded.lock().unwrap();
        if self.fail_after.is_some_and(|n| uploaded.len() >= n) {
            return Err(UploadError("remote unavailable".to_string()));
        }
        uploaded.push(record.clone());
        Ok(UploadAck {
            remote_id: Some(format!("remote-{}", record.id)),
        })
    }
}

pub fn collaborators_with_audit(audit: Arc<RecordingAudit>) -> Collaborators {
    Collaborators {
        audit,
        ..Collaborators::default()
    }
}
