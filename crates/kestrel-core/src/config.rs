//! Client configuration, read from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::paths::{LEADER_GLOB, NODE_ADDR_GLOB};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub cluster: ClusterConfig,
    pub connection: ConnectionConfig,
    pub membership: MembershipConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    /// Seed addresses (`host:port`). Any reachable one is enough to join.
    pub addrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Dial timeout, e.g. `"5s"` or `"250ms"`.
    pub connect_timeout: String,
    /// Largest frame accepted from the remote end, in bytes.
    pub max_frame_len: u32,
    pub nodelay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Track cluster membership on every connection.
    pub enabled: bool,
    pub node_addr_glob: String,
    pub leader_glob: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            addrs: Vec::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: "5s".to_string(),
            max_frame_len: 16 * 1024 * 1024,
            nodelay: true,
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_addr_glob: NODE_ADDR_GLOB.to_string(),
            leader_glob: LEADER_GLOB.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Configuration for a cluster reachable through a single seed address.
    pub fn for_addr(name: &str, addr: &str) -> Self {
        Self {
            cluster: ClusterConfig {
                name: name.to_string(),
                addrs: vec![addr.to_string()],
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.connection.connect_timeout()?;
        if self.connection.max_frame_len == 0 {
            bail!("connection.max_frame_len must be > 0");
        }
        if !self.membership.node_addr_glob.contains('*') {
            bail!(
                "membership.node_addr_glob must contain a '*' for the node id: {}",
                self.membership.node_addr_glob
            );
        }
        Ok(())
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.connect_timeout)
    }
}

impl MembershipConfig {
    /// Address entry path for node `id`, derived from `node_addr_glob`.
    pub fn node_addr_path(&self, id: &str) -> String {
        self.node_addr_glob.replacen('*', id, 1)
    }
}

/// Parse `"<n>s"` or `"<n>ms"`.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.parse().with_context(|| format!("invalid duration: {s:?}"))?;
        return Ok(Duration::from_millis(n));
    }
    if let Some(secs) = s.strip_suffix('s') {
        let n: u64 = secs.parse().with_context(|| format!("invalid duration: {s:?}"))?;
        return Ok(Duration::from_secs(n));
    }
    bail!("invalid duration (expected \"<n>s\" or \"<n>ms\"): {s:?}")
}
