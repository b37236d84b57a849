use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::{Path, PathBuf}, time::Duration};

use crate::dns;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Wait after rule teardown so the kernel settles before new rules go in.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Skip the TPROXY probe and force the answer.
    #[serde(default)]
    pub tproxy: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            paths: PathsConfig::default(),
            proxy: ProxyConfig::default(),
            settle_ms: default_settle_ms(),
            tproxy: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// If set, logs will also be appended here.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_settings_path")]
    pub settings: PathBuf,
    #[serde(default = "default_whitelist_path")]
    pub whitelist: PathBuf,
    /// Directory with `<strategy>.<setup|clean>.rules` overrides.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
    #[serde(default = "default_resolver")]
    pub resolver: PathBuf,
    /// Defaults to the resolver path plus `.tpctlbak`.
    #[serde(default)]
    pub resolver_backup: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            settings: default_settings_path(),
            whitelist: default_whitelist_path(),
            templates_dir: None,
            resolver: default_resolver(),
            resolver_backup: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Process name expected on the control port.
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_nameserver")]
    pub nameserver: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { process_name: default_process_name(), nameserver: default_nameserver() }
    }
}

pub const CONFIG_DIR: &str = "/etc/tpctl";

fn default_log_level() -> String { "info".to_string() }
fn default_settle_ms() -> u64 { 100 }
fn default_settings_path() -> PathBuf { Path::new(CONFIG_DIR).join("settings.json") }
fn default_whitelist_path() -> PathBuf { Path::new(CONFIG_DIR).join("whitelist.json") }
fn default_resolver() -> PathBuf { PathBuf::from(dns::RESOLVER_FILE) }
fn default_process_name() -> String { "v2ray".to_string() }
fn default_nameserver() -> String { dns::HIJACK_NAMESERVER.to_string() }

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))?;

        if let Some(d) = &cfg.paths.templates_dir {
            if d.as_os_str().is_empty() {
                cfg.paths.templates_dir = None;
            }
        }
        Ok(cfg)
    }

    /// Built-in defaults when started without `--config`.
    pub fn default_fixed() -> Self {
        Self::default()
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}
