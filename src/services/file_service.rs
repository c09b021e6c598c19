//! src/services/file_service.rs
//!
//! FileService: keeps a metadata record and its blob consistent across
//! upload, download and delete.
//!
//! - Upload: stage the body, then per attempt issue a token, publish the
//!   blob under it and insert the record. A failed insert removes the blob
//!   it just published; token collisions retry with a fresh token.
//! - Download: look the record up, open the blob, and once the bytes are
//!   delivered bump the audit counters under the version fence, retrying
//!   conflicts a bounded number of times. A dropped audit never fails the
//!   download.
//! - Delete: check ownership, delete the record, then best-effort remove
//!   the blob. A leaked blob is logged, not reported.

use crate::{
    models::file::{FileRecord, NewFile, Owner, UserId},
    services::{
        blob_store::{BlobError, BlobReader, BlobStore, StagedBlob},
        metadata_store::{FileRepository, MetadataError},
        retry::{RetryError, retry_bounded},
        token::{self, TokenError},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Attempts at finding an unused token for one upload.
pub const TOKEN_ATTEMPTS: u32 = 3;

/// Default attempts at recording one download against concurrent readers.
pub const DEFAULT_AUDIT_ATTEMPTS: u32 = 5;

const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("token generation failed: {0}")]
    Generation(String),
    #[error("blob for `{token}` is unavailable although its record exists: {source}")]
    Integrity {
        token: String,
        #[source]
        source: BlobError,
    },
    #[error(transparent)]
    Metadata(MetadataError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl From<MetadataError> for FileError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound => FileError::NotFound,
            other => FileError::Metadata(other),
        }
    }
}

impl From<TokenError> for FileError {
    fn from(err: TokenError) -> Self {
        FileError::Generation(err.to_string())
    }
}

impl FileError {
    /// A token that is already taken, either in the blob namespace or by
    /// the metadata unique constraint.
    fn is_token_collision(&self) -> bool {
        matches!(
            self,
            FileError::Blob(BlobError::AlreadyExists(_))
                | FileError::Metadata(MetadataError::DuplicateToken(_))
        )
    }
}

pub type FileResult<T> = Result<T, FileError>;

/// A record together with its opened blob.
#[derive(Debug)]
pub struct Download {
    pub record: FileRecord,
    pub blob: BlobReader,
}

/// What happened to the audit update after a delivered download.
#[derive(Debug)]
pub enum AccessAudit {
    /// Counters were bumped; holds the stored record.
    Recorded(FileRecord),
    /// Every attempt lost the race against other readers.
    Dropped { attempts: u32 },
    /// The store failed for another reason (including the record being
    /// deleted mid-download).
    Failed(MetadataError),
}

/// Result of [`FileService::download_to`].
#[derive(Debug)]
pub struct Delivery {
    /// The record as observed before the download.
    pub record: FileRecord,
    pub bytes: u64,
    pub audit: AccessAudit,
}

/// What happened to the blob once its record was deleted.
#[derive(Debug)]
pub enum BlobReclaim {
    Removed,
    AlreadyGone,
    /// Removal failed; the blob is an orphan left for external cleanup.
    Leaked(BlobError),
}

#[derive(Debug)]
pub struct DeleteOutcome {
    pub record: FileRecord,
    pub blob: BlobReclaim,
}

#[derive(Clone)]
pub struct FileService {
    repo: Arc<dyn FileRepository>,
    blobs: BlobStore,
    audit_attempts: u32,
}

impl FileService {
    pub fn new(repo: Arc<dyn FileRepository>, blobs: BlobStore) -> Self {
        Self {
            repo,
            blobs,
            audit_attempts: DEFAULT_AUDIT_ATTEMPTS,
        }
    }

    /// Override how many times a download retries its audit update.
    pub fn with_audit_attempts(mut self, attempts: u32) -> Self {
        self.audit_attempts = attempts.max(1);
        self
    }

    pub fn repo(&self) -> &dyn FileRepository {
        self.repo.as_ref()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Store `body` as a new file named `filename`, owned by `owner`.
    pub async fn upload<S>(&self, owner: Owner, filename: &str, body: S) -> FileResult<FileRecord>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let filename = clean_filename(filename)?;
        let staged = self.blobs.stage(body).await?;
        let size = staged.size();
        let registered = self.register(&staged, owner, &filename).await;
        self.blobs.discard(staged).await;

        let record = registered?;
        info!(token = %record.token, owner = ?record.owner, size, "file uploaded");
        Ok(record)
    }

    async fn register(
        &self,
        staged: &StagedBlob,
        owner: Owner,
        filename: &str,
    ) -> FileResult<FileRecord> {
        let outcome = retry_bounded(
            TOKEN_ATTEMPTS,
            move |attempt| self.register_once(staged, owner, filename, attempt),
            FileError::is_token_collision,
        )
        .await;

        match outcome {
            Ok(record) => Ok(record),
            Err(RetryError::Fatal(err)) => {
                if let FileError::Generation(reason) = &err {
                    error!(%reason, "secure random source failed during upload");
                }
                Err(err)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(attempts, error = %last, "every generated token collided");
                Err(FileError::Generation(format!(
                    "no unused token after {attempts} attempts"
                )))
            }
        }
    }

    /// One pass of token → blob → record. A record never outlives its blob;
    /// the blob is only kept without a record when the insert outcome is
    /// unknown.
    async fn register_once(
        &self,
        staged: &StagedBlob,
        owner: Owner,
        filename: &str,
        attempt: u32,
    ) -> FileResult<FileRecord> {
        let token = token::new_token()?;
        self.blobs.publish(staged, &token).await?;

        let new_file = NewFile {
            token: token.clone(),
            owner,
            filename: filename.to_string(),
            storage_path: token.clone(),
        };

        match self.repo.insert(new_file).await {
            Ok(record) => Ok(record),
            Err(err @ MetadataError::Timeout { .. }) => {
                // The insert may still have landed; the blob must outlive
                // any record that points at it.
                match self.repo.get_by_token(&token).await {
                    Ok(record) if record.storage_path == token => {
                        warn!(%token, attempt, "insert reported a timeout but the record exists");
                        Ok(record)
                    }
                    Err(MetadataError::NotFound) => {
                        self.remove_unregistered(&token, attempt, &err).await;
                        Err(err.into())
                    }
                    Ok(_) | Err(_) => {
                        error!(
                            %token,
                            error = %err,
                            "insert outcome unknown; keeping published blob"
                        );
                        Err(err.into())
                    }
                }
            }
            Err(err) => {
                self.remove_unregistered(&token, attempt, &err).await;
                Err(err.into())
            }
        }
    }

    /// Remove a blob whose record was never inserted.
    async fn remove_unregistered(&self, token: &str, attempt: u32, cause: &MetadataError) {
        debug!(%token, attempt, error = %cause, "insert failed, removing published blob");
        if let Err(cleanup) = self.blobs.remove(token).await {
            error!(
                %token,
                error = %cleanup,
                "failed to remove blob after rejected insert; blob is orphaned"
            );
        }
    }

    /// Metadata only.
    pub async fn get(&self, token: &str) -> FileResult<FileRecord> {
        Ok(self.repo.get_by_token(token).await?)
    }

    /// Every file uploaded by `owner_id`.
    pub async fn list_for_user(&self, owner_id: i64) -> FileResult<Vec<FileRecord>> {
        Ok(self.repo.get_all_for_user(owner_id).await?)
    }

    /// Look up `token` and open its blob for streaming.
    ///
    /// A record whose blob cannot be opened means the two stores diverged;
    /// that is reported as an integrity failure, not as a missing file.
    pub async fn open_download(&self, token: &str) -> FileResult<Download> {
        let record = self.repo.get_by_token(token).await?;
        let blob = self
            .blobs
            .open(&record.storage_path)
            .await
            .map_err(|err| {
                error!(
                    token,
                    storage_path = %record.storage_path,
                    error = %err,
                    "integrity anomaly: record present but blob cannot be opened"
                );
                FileError::Integrity {
                    token: token.to_string(),
                    source: err,
                }
            })?;

        Ok(Download { record, blob })
    }

    /// Bump `download_count` and `last_accessed_at` for a delivered download.
    ///
    /// The first attempt uses `observed`; after an edit conflict the record
    /// is re-read and the increment recomputed from the fresh counters.
    /// This never fails the download: exhaustion and store errors are
    /// logged and returned as an outcome.
    pub async fn record_access(&self, observed: FileRecord) -> AccessAudit {
        let observed = &observed;
        let outcome = retry_bounded(
            self.audit_attempts,
            move |attempt| async move {
                let current = if attempt == 1 {
                    observed.clone()
                } else {
                    self.repo.get_by_token(&observed.token).await?
                };
                self.repo.update(&current.with_access_at(Utc::now())).await
            },
            |err| matches!(err, MetadataError::EditConflict),
        )
        .await;

        match outcome {
            Ok(record) => {
                debug!(
                    token = %record.token,
                    downloads = record.download_count,
                    "recorded download"
                );
                AccessAudit::Recorded(record)
            }
            Err(RetryError::Exhausted { attempts, .. }) => {
                warn!(
                    token = %observed.token,
                    attempts,
                    "audit update kept conflicting; dropping it"
                );
                AccessAudit::Dropped { attempts }
            }
            Err(RetryError::Fatal(err)) => {
                warn!(token = %observed.token, error = %err, "audit update failed; dropping it");
                AccessAudit::Failed(err)
            }
        }
    }

    /// Copy the file behind `token` into `writer`, then record the access.
    ///
    /// If copying fails, or the future is dropped before it finishes, no
    /// audit update is attempted.
    pub async fn download_to<W>(&self, token: &str, writer: &mut W) -> FileResult<Delivery>
    where
        W: AsyncWrite + Unpin,
    {
        let Download { record, mut blob } = self.open_download(token).await?;
        let bytes = tokio::io::copy(&mut blob.file, writer)
            .await
            .map_err(BlobError::Io)?;
        writer.flush().await.map_err(BlobError::Io)?;

        let audit = self.record_access(record.clone()).await;
        Ok(Delivery {
            record,
            bytes,
            audit,
        })
    }

    /// Check that `caller` may delete `token` and prepare the deletion.
    /// Nothing is mutated yet.
    pub async fn begin_delete(&self, token: &str, caller: Owner) -> FileResult<Deletion<'_>> {
        let record = self.repo.get_by_token(token).await?;
        let owner = match caller {
            Owner::User(id) if record.is_owned_by(caller) => id,
            _ => return Err(FileError::PermissionDenied),
        };

        Ok(Deletion {
            service: self,
            record,
            owner,
        })
    }

    /// Delete `token` on behalf of `caller`: record first, then blob.
    pub async fn delete(&self, token: &str, caller: Owner) -> FileResult<DeleteOutcome> {
        let unlinked = self.begin_delete(token, caller).await?.remove_record().await?;
        Ok(unlinked.reclaim_blob().await)
    }
}

/// Phase one of a delete: ownership checked, record still present.
#[derive(Debug)]
pub struct Deletion<'a> {
    service: &'a FileService,
    record: FileRecord,
    owner: UserId,
}

/// Phase two of a delete: record gone, blob possibly still on disk.
#[derive(Debug)]
pub struct Unlinked<'a> {
    service: &'a FileService,
    record: FileRecord,
}

impl<'a> Deletion<'a> {
    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    /// Delete the metadata row, scoped by owner in the store as well.
    pub async fn remove_record(self) -> FileResult<Unlinked<'a>> {
        self.service
            .repo
            .delete(&self.record.token, self.owner)
            .await?;

        Ok(Unlinked {
            service: self.service,
            record: self.record,
        })
    }
}

impl Unlinked<'_> {
    /// Remove the blob. Failure here is logged and reported in the outcome
    /// only; the file is already deleted as far as callers are concerned.
    pub async fn reclaim_blob(self) -> DeleteOutcome {
        let key = &self.record.storage_path;
        let blob = match self.service.blobs.remove(key).await {
            Ok(()) => BlobReclaim::Removed,
            Err(BlobError::NotFound(_)) => {
                warn!(token = %self.record.token, "blob already missing at delete");
                BlobReclaim::AlreadyGone
            }
            Err(err) => {
                warn!(
                    token = %self.record.token,
                    storage_path = %key,
                    error = %err,
                    "failed to remove blob after deleting its record; leaving orphan"
                );
                BlobReclaim::Leaked(err)
            }
        };

        info!(token = %self.record.token, "file deleted");
        DeleteOutcome {
            record: self.record,
            blob,
        }
    }
}

impl std::fmt::Debug for FileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("blobs", &self.blobs)
            .field("audit_attempts", &self.audit_attempts)
            .finish_non_exhaustive()
    }
}

/// Keep the final path segment of a client-supplied filename.
fn clean_filename(raw: &str) -> FileResult<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw)
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();

    if name.is_empty() || name == "." || name == ".." {
        return Err(FileError::InvalidInput("a filename is required".into()));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(FileError::InvalidInput(format!(
            "filename longer than {MAX_FILENAME_LEN} bytes"
        )));
    }
    Ok(name)
}
