//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level application configuration.
///
/// Loaded once at startup and shared as an immutable snapshot; readers
/// always see a complete configuration, never a mix of old and new fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Primary object storage backend.
    pub storage: StorageConfig,
    /// Optional secondary backend that pending blobs are replicated to.
    #[serde(default)]
    pub backup: Option<BackupConfig>,
    /// Storage for the pass-through dumps namespace.
    #[serde(default)]
    pub dumps: DumpsConfig,
    /// Metadata store settings.
    pub metadata: MetadataConfig,
    /// Tenant identities and their shared secrets.
    #[serde(default)]
    pub users: BTreeMap<String, String>,
    /// Rivet retrieval protocol settings.
    #[serde(default)]
    pub rivet: RivetConfig,
}

impl AppConfig {
    /// Create a configuration suitable for tests: local paths, one test
    /// identity, Rivet enabled and allowed to reach private networks so
    /// mock upstreams on loopback work.
    ///
    /// **For testing only.**
    pub fn for_testing(base: &std::path::Path) -> Self {
        let mut users = BTreeMap::new();
        users.insert("testid".to_string(), "test-secret".to_string());
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::Filesystem {
                path: base.join("storage"),
            },
            backup: None,
            dumps: DumpsConfig {
                path: base.join("dumps"),
            },
            metadata: MetadataConfig::Sqlite {
                path: base.join("metadata.db"),
            },
            users,
            rivet: RivetConfig {
                enabled: true,
                allow_private_networks: true,
                connect_timeout_secs: default_connect_timeout_secs(),
            },
        }
    }
}

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the redirect server.
    #[serde(default = "default_redirect_bind")]
    pub redirect_bind: String,
    /// Bind address for the Rivet server.
    #[serde(default = "default_rivet_bind")]
    pub rivet_bind: String,
    /// Public base URL under which stored blobs are reachable
    /// (e.g. "https://pool.example.org"). Redirects and the Rivet
    /// short-circuit check are both derived from it.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Start in read-only maintenance mode: every mutating operation
    /// fails fast before any side effect.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            redirect_bind: default_redirect_bind(),
            rivet_bind: default_rivet_bind(),
            public_url: default_public_url(),
            read_only: false,
        }
    }
}

fn default_redirect_bind() -> String {
    "127.0.0.1:23279".to_string()
}

fn default_rivet_bind() -> String {
    "127.0.0.1:23280".to_string()
}

fn default_public_url() -> String {
    "http://localhost:23279".to_string()
}

/// Object storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, DigitalOcean Spaces, etc.).
        endpoint: Option<String>,
        /// Region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// Access key ID. Falls back to ambient AWS credentials if unset.
        access_key_id: Option<String>,
        /// Secret access key. Falls back to ambient AWS credentials if unset.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for
        /// MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

/// Backup replication configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupConfig {
    /// The secondary backend.
    pub storage: StorageConfig,
    /// How often to drain the pending-backup queue, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

/// Storage for the dumps namespace, which bypasses content addressing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpsConfig {
    /// Root directory for dump objects.
    #[serde(default = "default_dumps_path")]
    pub path: PathBuf,
}

impl Default for DumpsConfig {
    fn default() -> Self {
        Self {
            path: default_dumps_path(),
        }
    }
}

fn default_dumps_path() -> PathBuf {
    PathBuf::from("./data/dumps")
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite-backed metadata store.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
}

/// Rivet retrieval protocol configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RivetConfig {
    /// Whether the Rivet server is started at all.
    #[serde(default)]
    pub enabled: bool,
    /// Permit outbound fetches to loopback/private/link-local addresses.
    /// Disables the SSRF address checks; only ever enable this for local
    /// development or tests.
    #[serde(default)]
    pub allow_private_networks: bool,
    /// Connect timeout for outbound fetches, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for RivetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_private_networks: false,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    8
}
