use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::resources::parse::{parse_bandwidth, parse_byte_size, parse_disk_io_bandwidth};
use crate::resources::types::ResourceKind;

/// Default disk I/O capacity when the operator doesn't configure one.
const DEFAULT_DISK_IO_LIMIT: u64 = 1024 * 1024 * 1024; // 1 GB/s

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of all manager-owned storage; statfs target for disk
    /// auto-detection (env: DATA_DIR)
    pub data_dir: PathBuf,

    /// Oversubscription ratios per resource kind
    pub oversub_cpu: f64,
    pub oversub_memory: f64,
    pub oversub_disk: f64,
    pub oversub_network: f64,
    pub oversub_disk_io: f64,

    /// Operator-pinned disk capacity in bytes (env: DISK_LIMIT, "" → statfs)
    pub disk_limit: Option<u64>,

    /// Operator-pinned network capacity in bytes/sec (env: NETWORK_LIMIT,
    /// "" → uplink speed auto-detect)
    pub network_limit: Option<u64>,

    /// Disk I/O capacity in bytes/sec (env: DISK_IO_LIMIT)
    pub disk_io_limit: u64,

    /// Fraction of disk capacity usable for image storage, in (0, 1]
    /// (env: MAX_IMAGE_STORAGE)
    pub max_image_storage: f64,

    /// Uplink interface override (env: UPLINK_INTERFACE, "" → default route)
    pub uplink_interface: Option<String>,

    /// Burst multipliers applied on top of the proportional default rates
    pub upload_burst_multiplier: u64,
    pub download_burst_multiplier: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/hypeman"),
            oversub_cpu: 4.0,
            oversub_memory: 1.0,
            oversub_disk: 1.0,
            oversub_network: 2.0,
            oversub_disk_io: 2.0,
            disk_limit: None,
            network_limit: None,
            disk_io_limit: DEFAULT_DISK_IO_LIMIT,
            max_image_storage: 0.2,
            uplink_interface: None,
            upload_burst_multiplier: 4,
            download_burst_multiplier: 4,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let defaults = Settings::default();

        let settings = Self {
            data_dir: match non_empty_var("DATA_DIR") {
                Some(v) => PathBuf::from(v),
                None => defaults.data_dir,
            },
            oversub_cpu: ratio_var("OVERSUB_CPU", defaults.oversub_cpu)?,
            oversub_memory: ratio_var("OVERSUB_MEMORY", defaults.oversub_memory)?,
            oversub_disk: ratio_var("OVERSUB_DISK", defaults.oversub_disk)?,
            oversub_network: ratio_var("OVERSUB_NETWORK", defaults.oversub_network)?,
            oversub_disk_io: ratio_var("OVERSUB_DISK_IO", defaults.oversub_disk_io)?,
            disk_limit: match non_empty_var("DISK_LIMIT") {
                Some(v) => Some(parse_byte_size(&v).context("invalid DISK_LIMIT")?),
                None => None,
            },
            network_limit: match non_empty_var("NETWORK_LIMIT") {
                Some(v) => Some(parse_bandwidth(&v).context("invalid NETWORK_LIMIT")?),
                None => None,
            },
            disk_io_limit: match non_empty_var("DISK_IO_LIMIT") {
                Some(v) => parse_disk_io_bandwidth(&v).context("invalid DISK_IO_LIMIT")?,
                None => defaults.disk_io_limit,
            },
            max_image_storage: match non_empty_var("MAX_IMAGE_STORAGE") {
                Some(v) => v.parse().context("invalid MAX_IMAGE_STORAGE")?,
                None => defaults.max_image_storage,
            },
            uplink_interface: non_empty_var("UPLINK_INTERFACE"),
            upload_burst_multiplier: int_var(
                "UPLOAD_BURST_MULTIPLIER",
                defaults.upload_burst_multiplier,
            )?,
            download_burst_multiplier: int_var(
                "DOWNLOAD_BURST_MULTIPLIER",
                defaults.download_burst_multiplier,
            )?,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if !(self.max_image_storage > 0.0 && self.max_image_storage <= 1.0) {
            bail!(
                "MAX_IMAGE_STORAGE must be in (0, 1], got {}",
                self.max_image_storage
            );
        }
        for (name, ratio) in [
            ("OVERSUB_CPU", self.oversub_cpu),
            ("OVERSUB_MEMORY", self.oversub_memory),
            ("OVERSUB_DISK", self.oversub_disk),
            ("OVERSUB_NETWORK", self.oversub_network),
            ("OVERSUB_DISK_IO", self.oversub_disk_io),
        ] {
            if !ratio.is_finite() || ratio < 0.0 {
                bail!("{name} must be a non-negative number, got {ratio}");
            }
        }
        Ok(())
    }

    /// The oversubscription ratio governing a resource kind.
    pub fn oversub(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.oversub_cpu,
            ResourceKind::Memory => self.oversub_memory,
            ResourceKind::Disk => self.oversub_disk,
            ResourceKind::Network => self.oversub_network,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn ratio_var(key: &str, default: f64) -> Result<f64> {
    match non_empty_var(key) {
        Some(v) => v.parse().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn int_var(key: &str, default: u64) -> Result<u64> {
    match non_empty_var(key) {
        Some(v) => v.parse().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}
