//! Load config from file and environment.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use shoal_core::{NodeId, Version};

/// Daemon configuration. File: `--config <path>`, else ~/.config/shoal/config.toml,
/// else /etc/shoal/config.toml. Env overrides: SHOAL_NODE_ID, SHOAL_VERSION,
/// SHOAL_ROOT_DIR, SHOAL_CONTROL_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's id (default 1).
    #[serde(default = "default_node_id")]
    pub node_id: NodeId,
    /// Protocol version, "1.0" or "1.1" (default 1.0).
    #[serde(default = "default_version")]
    pub version: Version,
    /// Metadata and chunk root; this node's files live under `<root_dir>/<node_id>/`.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Local control socket port on 127.0.0.1 (default 47100).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Control channel, "group:port".
    #[serde(default = "default_mc")]
    pub mc: String,
    /// Backup data channel, "group:port".
    #[serde(default = "default_mdb")]
    pub mdb: String,
    /// Restore data channel, "group:port".
    #[serde(default = "default_mdr")]
    pub mdr: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Backoff unit for backup and restore retries.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Wait after a deferred delete before the local tree is removed.
    #[serde(default = "default_purge_grace_secs")]
    pub purge_grace_secs: u64,
}

fn default_node_id() -> NodeId {
    NodeId(1)
}
fn default_version() -> Version {
    Version::V1_0
}
fn default_root_dir() -> PathBuf {
    PathBuf::from("shoal-data")
}
fn default_control_port() -> u16 {
    47100
}
fn default_mc() -> String {
    "230.0.0.1:4446".to_string()
}
fn default_mdb() -> String {
    "230.0.0.2:4447".to_string()
}
fn default_mdr() -> String {
    "230.0.0.3:4448".to_string()
}
fn default_chunk_size() -> u64 {
    shoal_core::chunk::DEFAULT_CHUNK_SIZE
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_purge_grace_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            version: default_version(),
            root_dir: default_root_dir(),
            control_port: default_control_port(),
            mc: default_mc(),
            mdb: default_mdb(),
            mdr: default_mdr(),
            chunk_size: default_chunk_size(),
            retry_base_ms: default_retry_base_ms(),
            purge_grace_secs: default_purge_grace_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error("invalid channel address {0:?}, expected <multicast group>:<port>")]
    Channel(String),
    #[error("chunk_size must be between 1 and {max} bytes")]
    ChunkSize { max: u64 },
}

/// Largest chunk that still fits one datagram with its header.
pub const MAX_CHUNK_SIZE: u64 = 64_000;

impl Config {
    /// Directory holding this node's metadata and chunks.
    pub fn node_dir(&self) -> PathBuf {
        self.root_dir.join(self.node_id.to_string())
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn purge_grace(&self) -> Duration {
        Duration::from_secs(self.purge_grace_secs)
    }

    /// Parsed channel addresses: (MC, MDB, MDR).
    pub fn channels(&self) -> Result<(SocketAddrV4, SocketAddrV4, SocketAddrV4), ConfigError> {
        Ok((
            parse_group(&self.mc)?,
            parse_group(&self.mdb)?,
            parse_group(&self.mdr)?,
        ))
    }

    fn validate(self) -> Result<Self, ConfigError> {
        self.channels()?;
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize {
                max: MAX_CHUNK_SIZE,
            });
        }
        Ok(self)
    }
}

fn parse_group(raw: &str) -> Result<SocketAddrV4, ConfigError> {
    let addr: SocketAddrV4 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::Channel(raw.to_string()))?;
    let group: &Ipv4Addr = addr.ip();
    if !group.is_multicast() {
        return Err(ConfigError::Channel(raw.to_string()));
    }
    Ok(addr)
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    c.validate()
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = lookup("SHOAL_NODE_ID") {
        c.node_id = s.parse().map_err(|_| ConfigError::Env {
            var: "SHOAL_NODE_ID",
            value: s.clone(),
        })?;
    }
    if let Some(s) = lookup("SHOAL_VERSION") {
        c.version = s.parse().map_err(|_| ConfigError::Env {
            var: "SHOAL_VERSION",
            value: s.clone(),
        })?;
    }
    if let Some(s) = lookup("SHOAL_ROOT_DIR") {
        c.root_dir = PathBuf::from(s);
    }
    if let Some(s) = lookup("SHOAL_CONTROL_PORT") {
        c.control_port = s.parse().map_err(|_| ConfigError::Env {
            var: "SHOAL_CONTROL_PORT",
            value: s.clone(),
        })?;
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/shoal/config.toml"));
    }
    out.push(PathBuf::from("/etc/shoal/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let c = Config::default().validate().unwrap();
        let (mc, mdb, mdr) = c.channels().unwrap();
        assert_eq!(mc.port(), 4446);
        assert_eq!(mdb.port(), 4447);
        assert_eq!(mdr.port(), 4448);
        assert_eq!(c.node_dir(), PathBuf::from("shoal-data/1"));
    }

    #[test]
    fn file_fields_and_defaults_merge() {
        let c: Config = toml::from_str(
            r#"
            node_id = 7
            version = "1.1"
            mc = "239.1.1.1:9000"
            "#,
        )
        .unwrap();
        assert_eq!(c.node_id, NodeId(7));
        assert_eq!(c.version, Version::V1_1);
        assert_eq!(c.chunk_size, 64_000);
        assert_eq!(c.purge_grace(), Duration::from_secs(30));
        assert_eq!(c.channels().unwrap().0.port(), 9000);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1").is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SHOAL_NODE_ID", "3"),
            ("SHOAL_VERSION", "1.1"),
            ("SHOAL_ROOT_DIR", "/tmp/x"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |v| vars.get(v).map(|s| s.to_string())).unwrap();
        assert_eq!(c.node_id, NodeId(3));
        assert_eq!(c.version, Version::V1_1);
        assert_eq!(c.node_dir(), PathBuf::from("/tmp/x/3"));
        assert_eq!(c.control_port, 47100);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut c = Config::default();
        let err = apply_env(&mut c, |v| (v == "SHOAL_VERSION").then(|| "2.0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "SHOAL_VERSION", .. }));
    }

    #[test]
    fn channel_must_be_multicast() {
        assert!(parse_group("10.0.0.1:4000").is_err());
        assert!(parse_group("230.0.0.1").is_err());
        assert!(parse_group("230.0.0.1:4000").is_ok());
    }

    #[test]
    fn chunk_size_bounds() {
        let c = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::ChunkSize { .. })));
    }

    #[test]
    fn explicit_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shoal.toml");
        std::fs::write(&path, "node_id = 9\nchunk_size = 1000\n").unwrap();
        let c = read_file(&path).unwrap();
        assert_eq!(c.node_id, NodeId(9));
        assert_eq!(c.chunk_size, 1000);
        assert!(matches!(
            read_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
