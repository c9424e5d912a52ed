use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub version: Option<String>,
    /// TCP 监听配置。
    #[serde(default)]
    pub tcp: ListenerSettings,
    /// UDP 监听配置。
    #[serde(default)]
    pub udp: ListenerSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 监听地址，IP 或可解析主机名。
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSettings {
    /// DoT 上游 host:port。
    #[serde(default = "default_upstream")]
    pub addr: String,
    /// TLS 证书校验使用的名称；缺省取 addr 的主机部分。
    #[serde(default)]
    pub tls_name: Option<String>,
    /// PEM 格式的信任根；缺省使用 webpki 内置根证书。
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// 单次上游往返超时（毫秒），0 表示不限制。
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            addr: default_upstream(),
            tls_name: None,
            ca_file: None,
            timeout_ms: 0,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if !self.tcp.enabled && !self.udp.enabled {
            anyhow::bail!("both tcp and udp listeners are disabled");
        }
        let addr = self.upstream.addr.trim();
        if addr.is_empty() {
            anyhow::bail!("upstream address is empty");
        }
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
            _ => anyhow::bail!("upstream address {addr:?} must be host:port"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Settings = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    Ok(cfg)
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8053
}

fn default_upstream() -> String {
    "1.1.1.1:853".to_string()
}
