//! Represents a shared file: the metadata row that binds a public token to
//! a blob on disk.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use sqlx::FromRow;
use std::fmt;

/// Identifier of a registered user. Always positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(i64);

impl UserId {
    /// Returns `None` for zero or negative ids; there is no such user.
    pub fn new(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who a record belongs to, or who is making a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Anonymous,
    User(UserId),
}

impl Owner {
    /// Maps the nullable `owner_id` column onto an owner. Non-positive ids
    /// cannot be stored, so they are read back as anonymous.
    pub fn from_column(owner_id: Option<i64>) -> Self {
        owner_id
            .and_then(UserId::new)
            .map_or(Owner::Anonymous, Owner::User)
    }

    pub fn as_column(self) -> Option<i64> {
        match self {
            Owner::Anonymous => None,
            Owner::User(id) => Some(id.get()),
        }
    }

    pub fn user_id(self) -> Option<UserId> {
        match self {
            Owner::Anonymous => None,
            Owner::User(id) => Some(id),
        }
    }
}

impl Serialize for Owner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Owner::Anonymous => serializer.serialize_none(),
            Owner::User(id) => serializer.serialize_some(&id.get()),
        }
    }
}

/// The canonical metadata entity for an uploaded file.
///
/// `token` doubles as the public handle and the blob key. `version` is the
/// optimistic-concurrency fence: every successful update bumps it by one,
/// and an update that presents a stale version is rejected.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FileRecord {
    /// Row id assigned by the metadata store.
    pub id: i64,

    /// 8-character base62 public identifier.
    pub token: String,

    /// Uploader, or `Anonymous`. Serialized as `owner_id` (null when anonymous).
    #[serde(rename = "owner_id")]
    pub owner: Owner,

    /// Filename presented to downloaders.
    pub filename: String,

    /// Key of the blob in the blob store.
    #[serde(skip)]
    pub storage_path: String,

    pub created_at: DateTime<Utc>,

    pub last_accessed_at: DateTime<Utc>,

    pub download_count: i64,

    #[serde(skip)]
    pub version: i64,
}

impl FileRecord {
    /// Whether `caller` may mutate this record. Anonymous records belong to
    /// nobody, and anonymous callers own nothing.
    pub fn is_owned_by(&self, caller: Owner) -> bool {
        match (self.owner, caller) {
            (Owner::User(owner), Owner::User(caller)) => owner == caller,
            _ => false,
        }
    }

    /// Applies one successful retrieval: count and timestamp move together.
    pub fn with_access_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            last_accessed_at: at,
            download_count: self.download_count + 1,
            ..self.clone()
        }
    }
}

/// A record about to be inserted; id, timestamps and version are assigned
/// by the store.
#[derive(Clone, Debug)]
pub struct NewFile {
    pub token: String,
    pub owner: Owner,
    pub filename: String,
    pub storage_path: String,
}

/// Row shape of the `files` table.
#[derive(FromRow, Debug)]
pub(crate) struct FileRow {
    pub id: i64,
    pub token: String,
    pub owner_id: Option<i64>,
    pub filename: String,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub download_count: i64,
    pub version: i64,
}

impl From<FileRow> for FileRecord {
    fn from(row: FileRow) -> Self {
        Self {
            id: row.id,
            token: row.token,
            owner: Owner::from_column(row.owner_id),
            filename: row.filename,
            storage_path: row.storage_path,
            created_at: row.created_at,
            last_accessed_at: row.last_accessed_at,
            download_count: row.download_count,
            version: row.version,
        }
    }
}
