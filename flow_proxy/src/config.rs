use std::{net::SocketAddr, path::Path};

use serde::Deserialize;

use crate::{Error, Result};

#[derive(Deserialize)]
pub struct Config {
    #[serde(default)]
    pub socks5_listen: Vec<SocketAddr>,
    #[serde(default)]
    pub http_listen: Vec<SocketAddr>,
    /// Absent or empty means every session connects directly.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Deserialize, Clone)]
pub struct RouteConfig {
    #[serde(default)]
    pub delay_ms: u64,
    /// Chained in order; the first one is dialed first.
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Deserialize, Clone)]
pub struct ProxyConfig {
    /// `http` or `socks5`, optionally layered as in `tls+http`.
    pub protocol: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub server: String,
}

fn default_idle_timeout() -> u64 {
    300
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        json5::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }
}
