use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::file_service::DEFAULT_AUDIT_ATTEMPTS;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub query_timeout: Duration,
    pub audit_attempts: u32,
    pub max_upload_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Share files by short token")]
pub struct Args {
    /// Host to bind to (overrides DROPIT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DROPIT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded blobs are stored (overrides DROPIT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DROPIT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum pooled database connections (overrides DROPIT_DB_MAX_CONNECTIONS)
    #[arg(long)]
    pub db_max_connections: Option<u32>,

    /// Deadline for each metadata query, in seconds (overrides DROPIT_QUERY_TIMEOUT_SECS)
    #[arg(long)]
    pub query_timeout_secs: Option<u64>,

    /// Attempts at recording a download under contention (overrides DROPIT_AUDIT_ATTEMPTS)
    #[arg(long)]
    pub audit_attempts: Option<u32>,

    /// Largest accepted upload body, in bytes (overrides DROPIT_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// Merge CLI arguments over environment variables over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("DROPIT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("DROPIT_PORT", 8000u16)?;
        let env_storage =
            env::var("DROPIT_STORAGE_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_db = env::var("DROPIT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/dropit.db".into());
        let env_max_conns = env_or("DROPIT_DB_MAX_CONNECTIONS", 5u32)?;
        let env_timeout = env_or("DROPIT_QUERY_TIMEOUT_SECS", 3u64)?;
        let env_audit = env_or("DROPIT_AUDIT_ATTEMPTS", DEFAULT_AUDIT_ATTEMPTS)?;
        let env_max_upload = env_or("DROPIT_MAX_UPLOAD_BYTES", 100 * 1024 * 1024usize)?;

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            db_max_connections: args.db_max_connections.unwrap_or(env_max_conns).max(1),
            query_timeout: Duration::from_secs(
                args.query_timeout_secs.unwrap_or(env_timeout).max(1),
            ),
            audit_attempts: args.audit_attempts.unwrap_or(env_audit).max(1),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse `name`, falling back to `default` when it is unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
