use crate::services::reaper::DEFAULT_UPLOAD_TTL;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr};

/// Which storage backend receives chunks and holds assembled objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Filesystem,
    S3,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "fs" | "filesystem" | "local" => Ok(Self::Filesystem),
            "s3" => Ok(Self::S3),
            other => bail!("unknown storage backend `{}` (expected `fs` or `s3`)", other),
        }
    }
}

/// Connection settings for the multipart object-store backend.
#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: String,
    /// Static credentials; when absent the AWS default provider chain is used.
    pub credentials: Option<(String, String)>,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("prefix", &self.prefix)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub media_root: String,
    pub database_url: String,
    pub backend: BackendKind,
    pub s3: Option<S3Settings>,
    pub upload_ttl_secs: u64,
    pub reap_interval_secs: u64,
    pub max_chunk_bytes: usize,
    pub upstream_timeout_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked media upload and range delivery service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for chunks and assembled uploads (overrides MEDIA_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Root that relative media locations resolve against (overrides MEDIA_STORE_MEDIA_ROOT)
    #[arg(long)]
    pub media_root: Option<String>,

    /// Database URL (overrides MEDIA_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend, `fs` or `s3` (overrides MEDIA_STORE_BACKEND)
    #[arg(long)]
    pub backend: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run one expired-upload sweep and exit
    #[arg(long)]
    pub sweep: bool,
}

/// One-shot maintenance mode requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    Sweep,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("MEDIA_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse::<u16>("MEDIA_STORE_PORT", 3000)?;
        let env_storage =
            env::var("MEDIA_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_media_root = env::var("MEDIA_STORE_MEDIA_ROOT").ok();
        let env_db = env::var("MEDIA_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/media_store.db".into());
        let env_backend = env::var("MEDIA_STORE_BACKEND").unwrap_or_else(|_| "fs".into());

        // --- Merge ---
        let storage_dir = args.storage_dir.unwrap_or(env_storage);
        let backend: BackendKind = args.backend.unwrap_or(env_backend).parse()?;
        let s3 = match backend {
            BackendKind::S3 => Some(S3Settings::from_env()?),
            BackendKind::Filesystem => None,
        };

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            media_root: args
                .media_root
                .or(env_media_root)
                .unwrap_or_else(|| storage_dir.clone()),
            storage_dir,
            database_url: args.database_url.unwrap_or(env_db),
            backend,
            s3,
            upload_ttl_secs: env_parse(
                "MEDIA_STORE_UPLOAD_TTL_SECS",
                DEFAULT_UPLOAD_TTL.as_secs(),
            )?,
            reap_interval_secs: env_parse("MEDIA_STORE_REAP_INTERVAL_SECS", 60 * 60)?,
            max_chunk_bytes: env_parse("MEDIA_STORE_MAX_CHUNK_BYTES", 8 * 1024 * 1024)?,
            upstream_timeout_secs: env_parse("MEDIA_STORE_UPSTREAM_TIMEOUT_SECS", 30)?,
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.sweep {
            RunMode::Sweep
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl S3Settings {
    fn from_env() -> Result<Self> {
        let bucket = env::var("MEDIA_STORE_S3_BUCKET")
            .context("MEDIA_STORE_S3_BUCKET is required for the s3 backend")?;
        let mut prefix = env::var("MEDIA_STORE_S3_PREFIX").unwrap_or_default();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        Ok(Self {
            bucket,
            region: env::var("MEDIA_STORE_S3_REGION").unwrap_or_else(|_| "us-east-1".into()),
            endpoint: env::var("MEDIA_STORE_S3_ENDPOINT").ok(),
            prefix,
            credentials: match (
                env::var("MEDIA_STORE_S3_ACCESS_KEY_ID"),
                env::var("MEDIA_STORE_S3_SECRET_ACCESS_KEY"),
            ) {
                (Ok(id), Ok(secret)) => Some((id, secret)),
                _ => None,
            },
        })
    }
}

/// Read and parse an optional environment variable, falling back to `default`.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
