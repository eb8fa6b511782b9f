//! Node configuration
//!
//! Loaded from TOML; every section and field is optional and falls back to
//! defaults tuned for slow, intermittent links. Durations use humantime
//! strings (`"30s"`, `"5m"`).
//!
//! ```toml
//! [node]
//! display_name = "river-camp"
//! community_secret = "valley-commons"
//!
//! [discovery]
//! interval = "10s"
//! static_peers = ["<endpoint id>@192.168.1.20:4433"]
//!
//! [bundles]
//! max_bundles = 256
//! default_ttl = "3d"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dtn::{Priority, StoreLimits};
use crate::error::{SyncError, SyncResult};
use crate::sync::SessionConfig;
use crate::transport::BackoffPolicy;

/// Database file name inside `node.data_dir`
pub const DATABASE_FILE: &str = "meshsync.redb";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub node: NodeConfig,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
    pub bundles: BundleConfig,
    pub document: DocumentConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,

    /// Name announced in handshakes and used for the log file
    pub display_name: Option<String>,

    /// Shared passphrase of the community. Every member derives the same
    /// broadcast-bundle key from it.
    pub community_secret: String,

    /// Write JSONL logs here in addition to the console
    pub log_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./meshsync-data"),
            display_name: None,
            community_secret: "meshsync-community".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Pause between discovery cycles on each bearer
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Backoff unit after a failed dial
    #[serde(with = "humantime_serde")]
    pub retry_base: Duration,

    #[serde(with = "humantime_serde")]
    pub retry_max: Duration,

    /// Wait after a finished session before dialing the same peer again
    #[serde(with = "humantime_serde")]
    pub revisit: Duration,

    /// Addresses dialed on the local-network bearer without discovery
    pub static_peers: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            interval: Duration::from_secs(10),
            retry_base: backoff.base,
            retry_max: backoff.max,
            revisit: backoff.revisit,
            static_peers: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.retry_base,
            max: self.retry_max,
            revisit: self.revisit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub max_bundles: usize,
    pub max_bytes: usize,
    pub max_hops: u16,

    /// Lifetime of bundles created for local changes
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    #[serde(with = "humantime_serde")]
    pub expiry_interval: Duration,

    /// Priority of bundles created for local changes
    pub priority: Priority,

    /// Relay local changes as bundles at all
    pub relay_local_changes: bool,
}

impl Default for BundleConfig {
    fn default() -> Self {
        let limits = StoreLimits::default();
        Self {
            max_bundles: limits.max_bundles,
            max_bytes: limits.max_bytes,
            max_hops: 8,
            default_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            expiry_interval: Duration::from_secs(60),
            priority: Priority::Normal,
            relay_local_changes: true,
        }
    }
}

impl BundleConfig {
    pub fn limits(&self) -> StoreLimits {
        StoreLimits {
            max_bundles: self.max_bundles,
            max_bytes: self.max_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Changes kept after a checkpoint for incremental catch-up
    pub max_log_changes: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            max_log_changes: crate::document::DEFAULT_MAX_LOG_CHANGES,
        }
    }
}

impl EngineConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> SyncResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {}", e)))
    }

    pub fn database_path(&self) -> PathBuf {
        self.node.data_dir.join(DATABASE_FILE)
    }

    /// Name for logs and handshakes, falling back to "node".
    pub fn node_name(&self) -> &str {
        self.node.display_name.as_deref().unwrap_or("node")
    }

    pub fn validate(&self) -> SyncResult<()> {
        fn fail(msg: &str) -> SyncResult<()> {
            Err(SyncError::Config(msg.to_string()))
        }

        if self.node.community_secret.is_empty() {
            return fail("node.community_secret must not be empty");
        }
        if self.discovery.interval.is_zero() {
            return fail("discovery.interval must be greater than 0");
        }
        if self.discovery.retry_base > self.discovery.retry_max {
            return fail("discovery.retry_base must not exceed discovery.retry_max");
        }
        if self.session.handshake_timeout.is_zero() || self.session.idle_timeout.is_zero() {
            return fail("session timeouts must be greater than 0");
        }
        if self.bundles.max_bundles == 0 || self.bundles.max_bytes == 0 {
            return fail("bundle store capacity must be greater than 0");
        }
        if self.bundles.max_hops == 0 {
            return fail("bundles.max_hops must be at least 1");
        }
        if self.bundles.default_ttl.is_zero() || self.bundles.expiry_interval.is_zero() {
            return fail("bundle ttl and expiry interval must be greater than 0");
        }
        if self.document.max_log_changes == 0 {
            return fail("document.max_log_changes must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node_name(), "node");
        assert!(config.database_path().ends_with(DATABASE_FILE));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [node]
            display_name = "river-camp"

            [discovery]
            interval = "30s"
            static_peers = ["abc@10.0.0.2:4433"]

            [bundles]
            default_ttl = "2h"
            priority = "high"

            [session]
            keep_alive = false
            "#,
        )
        .unwrap();

        assert_eq!(config.node_name(), "river-camp");
        assert_eq!(config.discovery.interval, Duration::from_secs(30));
        assert_eq!(config.discovery.static_peers.len(), 1);
        assert_eq!(config.bundles.default_ttl, Duration::from_secs(7200));
        assert_eq!(config.bundles.priority, Priority::High);
        assert_eq!(config.bundles.max_hops, 8);
        assert!(!config.session.keep_alive);
        assert_eq!(config.session.idle_timeout, SessionConfig::default().idle_timeout);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.bundles.max_hops = 0;
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.discovery.retry_base = Duration::from_secs(600);
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.node.community_secret.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("[bundles]\nmax_hops = \"many\"").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        let err = EngineConfig::from_toml_str("[discovery]\ninterval = \"0s\"").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = EngineConfig::default();
        config.node.display_name = Some("north-gate".into());
        config.bundles.priority = Priority::Critical;

        let text = config.to_toml_string().unwrap();
        assert!(text.contains("priority = \"critical\""));
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("meshsync.toml");
        std::fs::write(&path, "[document]\nmax_log_changes = 50\n").unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().document.max_log_changes, 50);
        assert!(EngineConfig::load(temp.path().join("missing.toml")).is_err());
    }
}
