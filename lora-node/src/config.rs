//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lora_core::protocol::{ClimateData, MAX_CHUNK_SIZE};
use lora_core::{EngineConfig, NodeId, StreamConfig};
use serde::Deserialize;

/// Node configuration. File: $LORA_NODE_CONFIG, ~/.config/lora-node/config.toml or
/// /etc/lora-node/config.toml (first that exists).
/// Env overrides: LORA_NODE_ID, LORA_NODE_PORT, LORA_NODE_GROUP, LORA_NODE_PING_INTERVAL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's address (default 1). 0 and 255 are reserved.
    #[serde(default = "default_node_id")]
    pub node_id: NodeId,
    /// Multicast group standing in for the radio channel.
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Stream clock period.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_transmit_timeout_ms")]
    pub transmit_timeout_ms: u64,
    /// Broadcast ping period; 0 disables.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// File served to peers that send a Stream-Request.
    #[serde(default)]
    pub stream_file: Option<PathBuf>,
    /// Where received streams are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Reading reported on Data-Request(Climate).
    #[serde(default = "default_climate")]
    pub climate: ClimateData,
    #[serde(default)]
    pub stream: StreamConfig,
}

fn default_node_id() -> NodeId {
    NodeId(1)
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 76, 82)
}
fn default_port() -> u16 {
    47800
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_transmit_timeout_ms() -> u64 {
    200
}
fn default_ping_interval_secs() -> u64 {
    10
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_climate() -> ClimateData {
    ClimateData {
        temperature_tenths: 215,
        humidity_tenths: 450,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            multicast_group: default_multicast_group(),
            port: default_port(),
            tick_ms: default_tick_ms(),
            transmit_timeout_ms: default_transmit_timeout_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            stream_file: None,
            output_dir: default_output_dir(),
            climate: default_climate(),
            stream: StreamConfig::default(),
        }
    }
}

impl Config {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            transmit_timeout: Duration::from_millis(self.transmit_timeout_ms),
            stream: self.stream,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_unset() || self.node_id.is_broadcast() {
            bail!("node_id {} is reserved", self.node_id);
        }
        if self.stream.chunk_size == 0 || self.stream.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "stream.chunk_size must be 1..={MAX_CHUNK_SIZE}, got {}",
                self.stream.chunk_size
            );
        }
        if self.tick_ms == 0 {
            bail!("tick_ms must be positive");
        }
        if self.stream.ack_timeout_ticks == 0 || self.stream.idle_timeout_ticks == 0 {
            bail!("stream timeouts must be at least one tick");
        }
        Ok(())
    }
}

/// Load config: defaults, then the first config file found, then env vars.
pub fn load() -> Result<Config> {
    let path = config_paths().into_iter().find(|p| p.exists());
    let mut c = match path {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("LORA_NODE_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/lora-node/config.toml"));
    }
    out.push(PathBuf::from("/etc/lora-node/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(s) = var("LORA_NODE_ID") {
        c.node_id = NodeId(s.parse().with_context(|| format!("LORA_NODE_ID={s}"))?);
    }
    if let Some(s) = var("LORA_NODE_PORT") {
        c.port = s.parse().with_context(|| format!("LORA_NODE_PORT={s}"))?;
    }
    if let Some(s) = var("LORA_NODE_GROUP") {
        c.multicast_group = s.parse().with_context(|| format!("LORA_NODE_GROUP={s}"))?;
    }
    if let Some(s) = var("LORA_NODE_PING_INTERVAL") {
        c.ping_interval_secs = s
            .parse()
            .with_context(|| format!("LORA_NODE_PING_INTERVAL={s}"))?;
    }
    Ok(())
}
