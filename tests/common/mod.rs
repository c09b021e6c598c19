//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dropit::{
    models::file::{FileRecord, NewFile, Owner, UserId},
    services::{
        blob_store::BlobStore,
        file_service::FileService,
        metadata_store::{FileRepository, MetadataError, MetadataResult, SqliteFileStore},
    },
};
use futures::{Stream, stream};
use sqlx::sqlite::SqliteConnectOptions;
use std::{
    io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;

pub struct TestEnv {
    pub dir: TempDir,
    pub store: SqliteFileStore,
    pub blobs: BlobStore,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let options = SqliteConnectOptions::new().filename(dir.path().join("meta.db"));
        let store = SqliteFileStore::connect_with(options, 4, Duration::from_secs(10))
            .await
            .unwrap();
        store.migrate().await.unwrap();
        let blobs = BlobStore::new(dir.path().join("blobs")).await.unwrap();
        Self { dir, store, blobs }
    }

    /// Service over the real store.
    pub fn service(&self) -> FileService {
        FileService::new(Arc::new(self.store.clone()), self.blobs.clone())
    }

    /// Service over an arbitrary repository (usually a wrapper of `store`).
    pub fn service_with(&self, repo: impl FileRepository + 'static) -> FileService {
        FileService::new(Arc::new(repo), self.blobs.clone())
    }

    /// Number of published blobs (staging area excluded).
    pub async fn blob_count(&self) -> usize {
        count_entries(self.blobs.root(), |name| !name.starts_with('.')).await
    }

    /// Number of files still sitting in the staging area.
    pub async fn staged_count(&self) -> usize {
        count_entries(&self.blobs.root().join(".staging"), |_| true).await
    }
}

async fn count_entries(dir: &Path, keep: impl Fn(&str) -> bool) -> usize {
    let mut entries = tokio::fs::read_dir(dir).await.unwrap();
    let mut n = 0;
    while let Some(entry) = entries.next_entry().await.unwrap() {
        if keep(&entry.file_name().to_string_lossy()) {
            n += 1;
        }
    }
    n
}

pub fn user(id: i64) -> Owner {
    Owner::User(UserId::new(id).unwrap())
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Split `data` into a chunked body stream.
pub fn body(data: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + use<> {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(128)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks)
}

/// How [`FlakyRepo`] misbehaves.
#[derive(Clone, Copy, Debug)]
pub enum Fault {
    /// `insert` fails as if the store were unreachable.
    InsertOutage,
    /// `insert` reports the token as already taken.
    InsertDuplicate,
    /// `update` reports an edit conflict without writing anything.
    UpdateConflict,
    /// `insert` hits its deadline before reaching the store.
    InsertTimeout,
    /// `insert` commits, but the caller only sees its deadline expire.
    InsertCommitsLate,
}

fn insert_deadline() -> MetadataError {
    MetadataError::Timeout {
        op: "insert",
        after: Duration::from_secs(3),
    }
}

/// Wraps the real store and injects `fault` into the next `remaining` calls
/// of the affected operation.
pub struct FlakyRepo {
    inner: SqliteFileStore,
    fault: Fault,
    remaining: AtomicU32,
    pub calls: Arc<AtomicU32>,
}

impl FlakyRepo {
    pub fn new(inner: SqliteFileStore, fault: Fault, times: u32) -> Self {
        Self {
            inner,
            fault,
            remaining: AtomicU32::new(times),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn trip(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl FileRepository for FlakyRepo {
    async fn insert(&self, file: NewFile) -> MetadataResult<FileRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Fault::InsertOutage if self.trip() => {
                Err(MetadataError::Sqlx(sqlx::Error::PoolTimedOut))
            }
            Fault::InsertDuplicate if self.trip() => Err(MetadataError::DuplicateToken(file.token)),
            Fault::InsertTimeout if self.trip() => Err(insert_deadline()),
            Fault::InsertCommitsLate if self.trip() => {
                self.inner.insert(file).await?;
                Err(insert_deadline())
            }
            _ => self.inner.insert(file).await,
        }
    }

    async fn get_by_token(&self, token: &str) -> MetadataResult<FileRecord> {
        self.inner.get_by_token(token).await
    }

    async fn update(&self, record: &FileRecord) -> MetadataResult<FileRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Fault::UpdateConflict if self.trip() => Err(MetadataError::EditConflict),
            _ => self.inner.update(record).await,
        }
    }

    async fn delete(&self, token: &str, owner: UserId) -> MetadataResult<()> {
        self.inner.delete(token, owner).await
    }

    async fn get_all_for_user(&self, owner_id: i64) -> MetadataResult<Vec<FileRecord>> {
        self.inner.get_all_for_user(owner_id).await
    }

    async fn ping(&self) -> MetadataResult<()> {
        self.inner.ping().await
    }
}
