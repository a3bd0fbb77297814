use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::env;

/// Which object store backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Disk blobs with SQLite metadata.
    Local,
    /// In-process store, nothing survives a restart.
    Memory,
}

impl StoreBackend {
    fn from_env_value(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store backend `{other}` (expected `local` or `memory`)"),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub backend: StoreBackend,
    pub part_size_mib: usize,
    pub upload_concurrency: usize,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Tenant file drive over a flat object store")]
pub struct Args {
    /// Host to bind to (overrides DRIVEBOX_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DRIVEBOX_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object blobs are stored (overrides DRIVEBOX_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DRIVEBOX_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object store backend (overrides DRIVEBOX_STORE_BACKEND)
    #[arg(long, value_enum)]
    pub store_backend: Option<StoreBackend>,

    /// Multipart part size in MiB (overrides DRIVEBOX_PART_SIZE_MIB)
    #[arg(long)]
    pub part_size_mib: Option<usize>,

    /// Concurrent part uploads per file (overrides DRIVEBOX_UPLOAD_CONCURRENCY)
    #[arg(long)]
    pub upload_concurrency: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("DRIVEBOX_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("DRIVEBOX_PORT", 3000u16)?;
        let env_storage = env::var("DRIVEBOX_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = env::var("DRIVEBOX_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/drivebox.db".into());
        let env_backend = match env::var("DRIVEBOX_STORE_BACKEND") {
            Ok(value) => StoreBackend::from_env_value(&value)?,
            Err(_) => StoreBackend::Local,
        };
        let env_part_size = parse_env("DRIVEBOX_PART_SIZE_MIB", 8usize)?;
        let env_concurrency = parse_env("DRIVEBOX_UPLOAD_CONCURRENCY", 4usize)?;
        let env_retry_attempts = parse_env("DRIVEBOX_RETRY_MAX_ATTEMPTS", 3u32)?;
        let env_retry_base = parse_env("DRIVEBOX_RETRY_BASE_MS", 100u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            backend: args.store_backend.unwrap_or(env_backend),
            part_size_mib: args.part_size_mib.unwrap_or(env_part_size).max(1),
            upload_concurrency: args.upload_concurrency.unwrap_or(env_concurrency).max(1),
            retry_max_attempts: env_retry_attempts.max(1),
            retry_base_ms: env_retry_base,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn part_size_bytes(&self) -> usize {
        self.part_size_mib * 1024 * 1024
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}
