//! Core services: token issuing, blob and metadata storage, and the
//! `FileService` that keeps the two stores consistent.

pub mod blob_store;
pub mod file_service;
pub mod metadata_store;
pub mod retry;
pub mod token;
