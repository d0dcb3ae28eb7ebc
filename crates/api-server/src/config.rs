//! Server configuration from the environment

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;

pub const ENV_BIND_ADDR: &str = "DAGRUN_BIND_ADDR";
pub const ENV_PIPELINES: &str = "DAGRUN_PIPELINES";
pub const ENV_WORKER_DIR: &str = "DAGRUN_WORKER_DIR";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8081";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// JSON pipeline catalog; `None` starts with no pipelines
    pub pipelines: Option<PathBuf>,
    pub worker_dir: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let raw_addr = value(ENV_BIND_ADDR).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = raw_addr
            .parse()
            .with_context(|| format!("invalid {}: {}", ENV_BIND_ADDR, raw_addr))?;

        Ok(Self {
            bind_addr,
            pipelines: value(ENV_PIPELINES).map(PathBuf::from),
            worker_dir: value(ENV_WORKER_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }
}
