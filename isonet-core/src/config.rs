//! Configuration parsing and management.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use isonet_types::{IsolateUid, NodeUid};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Main configuration struct matching the isonet.yml schema
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsonetConfig {
    #[serde(default)]
    pub isolate: IsolateConfig,

    #[serde(default)]
    pub receiver: ReceiverConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub broadcaster: BroadcasterConfig,

    #[serde(default)]
    pub updater: UpdaterConfig,
}

/// Identity of the local isolate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsolateConfig {
    /// Generated when missing
    #[serde(default)]
    pub uid: Option<String>,

    /// Defaults to the uid
    #[serde(default)]
    pub name: Option<String>,

    /// Defaults to the host name
    #[serde(default)]
    pub node: Option<String>,

    /// Group tags, e.g. "forkers" or "monitors"
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_signal_path")]
    pub path: String,
}

fn default_listen_addr() -> String {
    String::from("0.0.0.0:0")
}

fn default_signal_path() -> String {
    String::from("/isonet-signal")
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            path: default_signal_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_multicast_group")]
    pub group: String,

    #[serde(default = "default_multicast_port")]
    pub port: u16,

    /// Maximum number of confirm exchanges running at once
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    /// How long `stop()` waits for the listener task
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_multicast_group() -> String {
    String::from("239.0.0.1")
}

fn default_multicast_port() -> u16 {
    42000
}

fn default_max_inflight() -> usize {
    16
}

fn default_join_timeout_ms() -> u64 {
    500
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: default_multicast_group(),
            port: default_multicast_port(),
            max_inflight: default_max_inflight(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn group_addr(&self) -> Result<Ipv4Addr, ConfigError> {
        let addr: Ipv4Addr = self.group.parse().map_err(|_| ConfigError::InvalidValue {
            field: "discovery.group".to_string(),
            reason: format!("'{}' is not an IPv4 address", self.group),
        })?;
        if !addr.is_multicast() {
            return Err(ConfigError::InvalidValue {
                field: "discovery.group".to_string(),
                reason: format!("{} is not a multicast address", addr),
            });
        }
        Ok(addr)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    /// Per-target deadline for `send` and `post`; none means the transport decides
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    /// Maximum number of `post` dispatches running at once
    #[serde(default = "default_post_concurrency")]
    pub post_concurrency: usize,
}

fn default_post_concurrency() -> usize {
    32
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            deadline_ms: None,
            post_concurrency: default_post_concurrency(),
        }
    }
}

impl BroadcasterConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `host:port` of a receiver to fetch the directory from at startup
    #[serde(default)]
    pub dump_source: Option<String>,

    #[serde(default = "default_dump_attempts")]
    pub dump_attempts: u32,
}

fn default_dump_attempts() -> u32 {
    5
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dump_source: None,
            dump_attempts: default_dump_attempts(),
        }
    }
}

impl UpdaterConfig {
    /// Split `dump_source` into host and port
    pub fn dump_source_addr(&self) -> Result<Option<(String, u16)>, ConfigError> {
        let Some(source) = self.dump_source.as_deref() else {
            return Ok(None);
        };
        let invalid = || ConfigError::InvalidValue {
            field: "updater.dump_source".to_string(),
            reason: format!("'{}' is not host:port", source),
        };
        let (host, port) = source.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Some((host.to_string(), port)))
    }
}

/// Fully resolved identity of the local isolate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub uid: IsolateUid,
    pub name: String,
    pub node: NodeUid,
    pub groups: Vec<String>,
}

impl IsonetConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: IsonetConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check values serde can't check on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.enabled {
            self.discovery.group_addr()?;
        }
        if self.broadcaster.post_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "broadcaster.post_concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.discovery.max_inflight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "discovery.max_inflight".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.receiver.path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "receiver.path".to_string(),
                reason: "must start with '/'".to_string(),
            });
        }
        self.updater.dump_source_addr()?;
        Ok(())
    }

    /// Fill in the generated parts of the identity
    ///
    /// Resolving twice keeps the first generated uid.
    pub fn resolve_identity(&mut self) -> LocalIdentity {
        let uid = self
            .isolate
            .uid
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let name = self.isolate.name.get_or_insert_with(|| uid.clone()).clone();
        let node = self.isolate.node.get_or_insert_with(default_node).clone();
        LocalIdentity {
            uid: IsolateUid::new(uid),
            name,
            node: NodeUid::new(node),
            groups: self.isolate.groups.clone(),
        }
    }
}

fn default_node() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| String::from("localhost"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = IsonetConfig::from_yaml_str("{}").unwrap();
        assert!(config.discovery.enabled);
        assert_eq!(config.discovery.port, 42000);
        assert_eq!(config.receiver.path, "/isonet-signal");
        assert_eq!(config.broadcaster.deadline(), None);
        assert_eq!(config.updater.dump_attempts, 5);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "isolate:\n  uid: iso-1\n  name: worker\n  node: node-a\n  groups: [monitors]\n\
             discovery:\n  group: 239.1.2.3\n  port: 5000\n\
             broadcaster:\n  deadline_ms: 250"
        )
        .unwrap();

        let mut config = IsonetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.discovery.port, 5000);
        assert_eq!(config.broadcaster.deadline(), Some(Duration::from_millis(250)));

        let identity = config.resolve_identity();
        assert_eq!(identity.uid.as_str(), "iso-1");
        assert_eq!(identity.name, "worker");
        assert_eq!(identity.node.as_str(), "node-a");
        assert_eq!(identity.groups, vec!["monitors".to_string()]);
    }

    #[test]
    fn test_generated_uid_is_stable() {
        let mut config = IsonetConfig::default();
        let first = config.resolve_identity();
        let second = config.resolve_identity();
        assert_eq!(first.uid, second.uid);
        assert_eq!(first.name, first.uid.as_str());
    }

    #[test]
    fn test_rejects_unicast_group() {
        let err = IsonetConfig::from_yaml_str("discovery:\n  group: 10.0.0.1\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_dump_source_parsing() {
        let mut updater = UpdaterConfig::default();
        assert_eq!(updater.dump_source_addr().unwrap(), None);

        updater.dump_source = Some("10.0.0.2:9000".to_string());
        assert_eq!(
            updater.dump_source_addr().unwrap(),
            Some(("10.0.0.2".to_string(), 9000))
        );

        updater.dump_source = Some("nope".to_string());
        assert!(updater.dump_source_addr().is_err());
    }
}
