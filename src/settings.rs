use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::iptables::ports::{PortSpec, Proto};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterceptionMode {
    #[default]
    Closed,
    Proxy,
    Whitelist,
    Gfwlist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AntiPollutionMode {
    #[default]
    Closed,
    Enabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub transparent: InterceptionMode,
    #[serde(default)]
    pub anti_pollution: AntiPollutionMode,
    /// Forces the REDIRECT strategy even on TPROXY-capable hosts.
    #[serde(default)]
    pub enhanced_mode: bool,
    /// `host:port` the proxy's own inbound listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Persisted switch for the spoofed-DNS-response countermeasure.
    #[serde(default)]
    pub drop_spoofing: bool,
}

fn default_listen_address() -> String {
    "0.0.0.0:2017".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transparent: InterceptionMode::Closed,
            anti_pollution: AntiPollutionMode::Closed,
            enhanced_mode: false,
            listen_address: default_listen_address(),
            drop_spoofing: false,
        }
    }
}

impl Settings {
    pub fn listen_port(&self) -> Result<u16> {
        let (_, port) = self
            .listen_address
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("listen address without port: {:?}", self.listen_address))?;
        port.parse()
            .with_context(|| format!("bad listen port in {:?}", self.listen_address))
    }
}

/// Ports whose traffic is never intercepted, per protocol, in user order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortWhitelist {
    #[serde(default)]
    pub tcp: Vec<PortSpec>,
    #[serde(default)]
    pub udp: Vec<PortSpec>,
}

impl PortWhitelist {
    pub fn has(&self, spec: &PortSpec, proto: Proto) -> bool {
        let list = match proto {
            Proto::Tcp => &self.tcp,
            Proto::Udp => &self.udp,
        };
        list.contains(spec)
    }
}

pub trait SettingsStore {
    fn settings(&self) -> Result<Settings>;
    fn whitelist(&self) -> Result<PortWhitelist>;
}

/// Decides whether the spoofed-DNS countermeasure should run right now.
pub trait DnsPoisonPolicy {
    /// `settings` is the snapshot the current enable works from.
    fn should_enable(&self, settings: &Settings) -> bool;
}

/// `settings.json` + `whitelist.json` on disk.
#[derive(Debug, Clone)]
pub struct JsonStore {
    settings_path: PathBuf,
    whitelist_path: PathBuf,
}

impl JsonStore {
    pub fn new(settings_path: impl Into<PathBuf>, whitelist_path: impl Into<PathBuf>) -> Self {
        Self {
            settings_path: settings_path.into(),
            whitelist_path: whitelist_path.into(),
        }
    }

    pub fn save_settings(&self, st: &Settings) -> Result<()> {
        write_json(&self.settings_path, st)
    }

    pub fn save_whitelist(&self, wl: &PortWhitelist) -> Result<()> {
        write_json(&self.whitelist_path, wl)
    }
}

impl SettingsStore for JsonStore {
    fn settings(&self) -> Result<Settings> {
        load_or_init(&self.settings_path)
    }

    fn whitelist(&self) -> Result<PortWhitelist> {
        load_or_init(&self.whitelist_path)
    }
}

impl DnsPoisonPolicy for JsonStore {
    fn should_enable(&self, settings: &Settings) -> bool {
        settings.drop_spoofing
    }
}

/// Read a JSON file, writing out the defaults first if it is missing.
fn load_or_init<T: DeserializeOwned + Serialize + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        let v = T::default();
        // A read-only settings dir should not make defaults unusable.
        if let Err(e) = write_json(path, &v) {
            warn!("cannot write default {}: {e:#}", path.display());
        }
        return Ok(v);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, v: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let txt = serde_json::to_string_pretty(v)?;
    fs::write(&tmp, txt).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
