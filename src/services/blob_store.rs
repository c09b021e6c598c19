//! src/services/blob_store.rs
//!
//! BlobStore: content blobs on local disk, one file per key directly
//! beneath the storage root. Writes go to `root/.staging/` first and are
//! linked into place only once fully flushed, so a reader never observes a
//! truncated blob. Raw `io::Error`s are classified into `BlobError` before
//! they reach callers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";
const MAX_KEY_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("blob `{0}` already exists")]
    AlreadyExists(String),
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// A fully written, fsynced blob that has not been published under a key yet.
///
/// Must be handed back to [`BlobStore::discard`] once the caller is done
/// publishing it.
#[derive(Debug)]
pub struct StagedBlob {
    path: PathBuf,
    size: u64,
}

impl StagedBlob {
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// An opened blob, ready to be streamed out.
#[derive(Debug)]
pub struct BlobReader {
    pub file: File,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if necessary) a blob store rooted at `root`.
    pub async fn new(root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR)).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to its path beneath the root.
    ///
    /// Keys are single, plain file names: no separators, no `..`, no
    /// leading dot (which also keeps the staging directory unreachable).
    fn key_path(&self, key: &str) -> BlobResult<PathBuf> {
        let invalid = || BlobError::InvalidKey(key.to_string());

        if key.is_empty() || key.len() > MAX_KEY_LEN || key.starts_with('.') {
            return Err(invalid());
        }
        if key.contains("..") || key.contains('/') || key.contains('\\') {
            return Err(invalid());
        }
        if key.bytes().any(|b| b.is_ascii_control()) {
            return Err(invalid());
        }

        let mut components = Path::new(key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(key)),
            _ => Err(invalid()),
        }
    }

    /// Stream `stream` into a new staging file and fsync it.
    ///
    /// The staging file is removed if anything fails along the way.
    pub async fn stage<S>(&self, stream: S) -> BlobResult<StagedBlob>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let path = self
            .root
            .join(STAGING_DIR)
            .join(format!("{}.tmp", Uuid::new_v4()));

        match Self::copy_into(&path, stream).await {
            Ok(size) => {
                debug!(path = %path.display(), size, "staged blob");
                Ok(StagedBlob { path, size })
            }
            Err(err) => {
                let _ = fs::remove_file(&path).await;
                Err(BlobError::Io(err))
            }
        }
    }

    async fn copy_into<S>(path: &Path, stream: S) -> io::Result<u64>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let mut file = File::create(path).await?;
        let mut size: u64 = 0;

        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(size)
    }

    /// Make a staged blob readable under `key`.
    ///
    /// Publishing is a hard link, which is atomic and never replaces an
    /// existing blob: if `key` is taken this fails with `AlreadyExists`.
    pub async fn publish(&self, staged: &StagedBlob, key: &str) -> BlobResult<()> {
        let target = self.key_path(key)?;
        match fs::hard_link(&staged.path, &target).await {
            Ok(()) => {
                debug!(key, "published blob");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(BlobError::AlreadyExists(key.to_string()))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    /// Drop a staged blob. Published copies are unaffected.
    pub async fn discard(&self, staged: StagedBlob) {
        if let Err(err) = fs::remove_file(&staged.path).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    path = %staged.path.display(),
                    error = %err,
                    "failed to remove staging file"
                );
            }
        }
    }

    /// Persist the whole of `stream` under `key`, all or nothing.
    pub async fn write<S>(&self, key: &str, stream: S) -> BlobResult<u64>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        self.key_path(key)?;
        let staged = self.stage(stream).await?;
        let published = self.publish(&staged, key).await;
        let size = staged.size();
        self.discard(staged).await;
        published.map(|_| size)
    }

    /// Open the blob stored under `key`.
    pub async fn open(&self, key: &str) -> BlobResult<BlobReader> {
        let path = self.key_path(key)?;
        let file = File::open(&path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => BlobError::NotFound(key.to_string()),
            _ => BlobError::Io(err),
        })?;
        let meta = file.metadata().await?;
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(BlobReader {
            file,
            size: meta.len(),
            last_modified,
        })
    }

    /// Remove the blob stored under `key`. A missing blob is `NotFound`.
    pub async fn remove(&self, key: &str) -> BlobResult<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "removed blob");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    pub async fn exists(&self, key: &str) -> BlobResult<bool> {
        let path = self.key_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Write, read back and remove a scratch file in the staging area.
    pub async fn check_writable(&self) -> BlobResult<()> {
        const CONTENT: &[u8] = b"ready";
        let path = self
            .root
            .join(STAGING_DIR)
            .join(format!("ready-{}.tmp", Uuid::new_v4()));

        let checked = async {
            fs::write(&path, CONTENT).await?;
            if fs::read(&path).await? != CONTENT {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "scratch file read back different content",
                ));
            }
            Ok::<(), io::Error>(())
        }
        .await;
        let removed = fs::remove_file(&path).await;

        match (checked, removed) {
            (Err(err), _) => Err(BlobError::Io(err)),
            (Ok(()), Err(err)) if err.kind() != ErrorKind::NotFound => Err(BlobError::Io(err)),
            (Ok(()), _) => Ok(()),
        }
    }
}
