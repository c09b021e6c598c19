//! Core data models for the file-sharing service.
//!
//! A shared file is a metadata row (SQLite) bound to a content blob (local
//! disk) by its token. Rows map onto `FileRecord` via `sqlx::FromRow` and
//! serialize as JSON via `serde`.

pub mod file;
