use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub build: BuildConfig,
    pub storage: StorageConfig,
    /// When absent, update records are kept in memory.
    #[serde(default)]
    pub keydb: Option<KeyDbConfig>,
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:3000`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Path prefix for the update API.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Request header carrying the caller's account.  Set by the gateway in
    /// front of this service.
    #[serde(default = "default_account_header")]
    pub account_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            api_prefix: default_api_prefix(),
            account_header: default_account_header(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_api_prefix() -> String {
    "/api/edge/v1".to_string()
}

fn default_account_header() -> String {
    "x-account".to_string()
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Parent of the per-record working directories.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// `ostree` executable, resolved through `PATH` when not absolute.
    #[serde(default = "default_ostree_bin")]
    pub ostree_bin: PathBuf,
    /// `User-Agent` sent when downloading commit tarballs.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            ostree_bin: default_ostree_bin(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_work_root() -> PathBuf {
    PathBuf::from("/tmp/update")
}

fn default_ostree_bin() -> PathBuf {
    PathBuf::from("ostree")
}

fn default_user_agent() -> String {
    concat!("edge-updates/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Storage (local + S3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub local: LocalStorageConfig,
    #[serde(default)]
    pub s3: S3StorageConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory that uploaded repositories are copied under.  Only
    /// required when no bucket is configured.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// Target bucket.  Empty selects the local uploader.
    #[serde(default)]
    pub bucket: String,
    /// Environment variable that overrides `bucket` when set and non-empty.
    #[serde(default = "default_bucket_env")]
    pub bucket_env: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    /// Use the FIPS endpoints for S3 operations.
    #[serde(default)]
    pub use_fips: bool,
}

impl Default for S3StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            bucket_env: default_bucket_env(),
            region: default_s3_region(),
            use_fips: false,
        }
    }
}

fn default_bucket_env() -> String {
    "EDGE_TARBALLS_BUCKET".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config> {
    Ok(serde_yaml::from_str(contents)?)
}

/// Environment values win over the file.  `lookup` is `std::env::var` outside
/// of tests.
fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(bucket) = lookup(&config.storage.s3.bucket_env).filter(|b| !b.trim().is_empty()) {
        config.storage.s3.bucket = bucket.trim().to_string();
    }
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.server.api_prefix.starts_with('/'),
        "api_prefix must start with '/'"
    );
    anyhow::ensure!(
        !config.server.api_prefix.ends_with('/') || config.server.api_prefix == "/",
        "api_prefix must not end with '/'"
    );
    anyhow::ensure!(
        axum::http::HeaderName::from_bytes(config.server.account_header.as_bytes()).is_ok(),
        "account_header is not a valid header name"
    );
    anyhow::ensure!(
        !config.build.work_root.as_os_str().is_empty(),
        "build.work_root must not be empty"
    );
    anyhow::ensure!(
        !config.storage.local.path.trim().is_empty() || !config.storage.s3.bucket.trim().is_empty(),
        "storage.local.path must be set when no S3 bucket is configured"
    );
    if let Some(keydb) = &config.keydb {
        anyhow::ensure!(!keydb.endpoint.is_empty(), "keydb.endpoint must not be empty");
    }
    Ok(())
}
