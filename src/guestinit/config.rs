//! The host-written `config.json` read from the config disk at boot.
//! Parsed exactly once; immutable afterwards.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Baseline environment every workload sees; config entries are appended.
pub const DEFAULT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, Deserialize)]
pub struct GuestConfig {
    pub entrypoint: String,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Presence enables networking.
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub has_gpu: bool,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub init_mode: InitMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub ip: Ipv4Addr,
    pub cidr: u8,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMode {
    /// Run the entrypoint directly, with the guest agent as a sibling child.
    #[default]
    Exec,
    /// Hand the machine to a full service manager.
    Systemd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeMode {
    Ro,
    Rw,
    Overlay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeMount {
    pub device: String,
    pub path: String,
    pub mode: VolumeMode,
    /// Writable overlay disk; required for `overlay` mode.
    #[serde(default)]
    pub overlay_device: Option<String>,
}

impl GuestConfig {
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("config.json");
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("parse config.json")
    }

    pub fn network_enabled(&self) -> bool {
        self.network.is_some()
    }

    /// Entrypoint argv for process replacement. The shell path handles
    /// word splitting in exec mode; systemd mode splits here.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.entrypoint.clone()];
        if let Some(cmd) = &self.cmd {
            argv.extend(cmd.split_whitespace().map(str::to_string));
        }
        argv
    }

    /// PATH and HOME first, then the config map in key order.
    pub fn merged_env(&self) -> Vec<(String, String)> {
        let mut merged = vec![
            ("PATH".to_string(), DEFAULT_PATH_ENV.to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        merged.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}
