use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;
use swarmpush_p2p::{
    EngineConfig, Role, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_ACTIVE_PER_PEER, DEFAULT_PIPELINE_DEPTH,
};

/// Node configuration, one TOML file per node.
///
/// The same file shape serves both roles; agents additionally need
/// `downloads_dir`. Credentials are fleet-shared: they guard the local
/// management API and sign the status reports posted to the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub name: String,
    pub net: NetConfig,
    pub auth: AuthConfig,
    /// Optional log file; stdout when unset.
    #[serde(default)]
    pub log: Option<PathBuf>,
    /// Where agent nodes materialize dispatched files.
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_pipeline_depth")]
    pub request_pipeline_depth: usize,
    #[serde(default = "default_max_active")]
    pub max_active_pieces_per_peer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetConfig {
    pub ip: String,
    pub mgnt_port: u16,
    pub data_port: u16,
    /// Recognized for deployments that terminate TLS in front of the
    /// management port; the node itself serves plain HTTP.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_pipeline_depth() -> usize {
    DEFAULT_PIPELINE_DEPTH
}

fn default_max_active() -> usize {
    DEFAULT_MAX_ACTIVE_PER_PEER
}

impl Config {
    pub fn load(path: &Path, role: Role) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate(role)?;
        Ok(cfg)
    }

    pub fn validate(&self, role: Role) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!("name must not be empty");
        }
        if self.block_size == 0 {
            bail!("block_size must be positive");
        }
        if role == Role::Agent && self.downloads_dir.is_none() {
            bail!("agent role requires downloads_dir");
        }
        if let Some(tls) = &self.net.tls {
            if !tls.cert.exists() || !tls.key.exists() {
                bail!("net.tls cert/key files do not exist");
            }
        }
        Ok(())
    }

    /// This node's id on the data plane; the orchestrator publishes it in
    /// address books, so it doubles as the address peers dial.
    pub fn peer_id(&self) -> String {
        format!("{}:{}", self.net.ip, self.net.data_port)
    }

    /// Management address other nodes use to reach this one.
    pub fn mgnt_addr(&self) -> String {
        format!("{}:{}", self.net.ip, self.net.mgnt_port)
    }

    pub fn mgnt_bind(&self) -> anyhow::Result<SocketAddr> {
        self.mgnt_addr()
            .parse()
            .with_context(|| format!("net.ip {} is not a bindable address", self.net.ip))
    }

    pub fn data_bind(&self) -> anyhow::Result<SocketAddr> {
        self.peer_id()
            .parse()
            .with_context(|| format!("net.ip {} is not a bindable address", self.net.ip))
    }

    pub fn engine(&self) -> EngineConfig {
        let mut engine = EngineConfig::new(self.peer_id());
        engine.downloads_dir = self.downloads_dir.clone();
        engine.block_size = self.block_size;
        engine.pipeline_depth = self.request_pipeline_depth;
        engine.max_active_per_peer = self.max_active_pieces_per_peer;
        engine.username = self.auth.username.clone();
        engine.password = self.auth.password.clone();
        engine
    }
}
