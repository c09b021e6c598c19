//! dropit: anonymous or authenticated file sharing by short token.
//!
//! Metadata lives in SQLite, content lives on local disk; `FileService`
//! keeps the two consistent under concurrent access.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
