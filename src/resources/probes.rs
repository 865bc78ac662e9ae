//! Host capacity discovery.
//!
//! Each probe reads host state once at construction and exposes an
//! immutable capacity plus an `allocated` aggregation over a live instance
//! snapshot. All probes apply the same active-state predicate.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use super::types::{CapacitySource, DiskBreakdown, InstanceAllocation, ResourceKind};

/// Narrow seam over procfs/sysfs/statfs so tests can inject synthetic
/// host state.
pub trait HostReader: Send + Sync {
    fn cpu_info(&self) -> io::Result<String>;
    fn mem_info(&self) -> io::Result<String>;
    /// Link speed in megabits/sec; negative means the driver doesn't know.
    fn interface_speed(&self, iface: &str) -> io::Result<i64>;
    /// `(f_blocks, f_bsize)` for the filesystem holding `path`.
    fn statfs(&self, path: &Path) -> io::Result<(u64, u64)>;
    /// Interface carrying the IPv4 default route.
    fn default_route_interface(&self) -> io::Result<String>;
}

/// Production reader backed by the real /proc and /sys.
pub struct ProcReader;

impl HostReader for ProcReader {
    fn cpu_info(&self) -> io::Result<String> {
        std::fs::read_to_string("/proc/cpuinfo")
    }

    fn mem_info(&self) -> io::Result<String> {
        std::fs::read_to_string("/proc/meminfo")
    }

    fn interface_speed(&self, iface: &str) -> io::Result<i64> {
        let raw = std::fs::read_to_string(format!("/sys/class/net/{iface}/speed"))?;
        raw.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn statfs(&self, path: &Path) -> io::Result<(u64, u64)> {
        let fs = nix::sys::statfs::statfs(path).map_err(io::Error::from)?;
        Ok((fs.blocks(), fs.block_size() as u64))
    }

    fn default_route_interface(&self) -> io::Result<String> {
        let table = std::fs::read_to_string("/proc/net/route")?;
        parse_default_route(&table).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no IPv4 default route found")
        })
    }
}

/// Everything `allocated` computations need: the instance list plus the
/// host-wide storage totals from the image and volume listers.
#[derive(Debug, Clone, Default)]
pub struct AllocationSnapshot {
    pub instances: Vec<InstanceAllocation>,
    pub images_bytes: u64,
    pub oci_cache_bytes: u64,
    pub volumes_bytes: u64,
}

impl AllocationSnapshot {
    /// Instances that count toward allocation.
    pub fn active(&self) -> impl Iterator<Item = &InstanceAllocation> {
        self.instances.iter().filter(|i| i.state.is_active())
    }
}

/// Shallow polymorphism over the four kinds: capacity is fixed at
/// construction, allocation is recomputed per snapshot.
pub trait Probe: Send + Sync {
    fn kind(&self) -> ResourceKind;
    fn capacity(&self) -> u64;
    fn source(&self) -> CapacitySource;
    fn allocated(&self, snapshot: &AllocationSnapshot) -> u64;
}

// ---- CPU ----

pub struct CpuProbe {
    capacity: u64,
}

impl CpuProbe {
    pub fn new(reader: &dyn HostReader) -> Result<Self> {
        let cpuinfo = reader.cpu_info().context("failed to read /proc/cpuinfo")?;
        Ok(Self {
            capacity: parse_cpu_capacity(&cpuinfo),
        })
    }
}

impl Probe for CpuProbe {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Cpu
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn source(&self) -> CapacitySource {
        CapacitySource::Detected
    }

    fn allocated(&self, snapshot: &AllocationSnapshot) -> u64 {
        snapshot.active().map(|i| i.vcpus).sum()
    }
}

/// Preferred: `siblings × distinct physical ids` (counts hyperthreads once
/// per socket). Fallback: `processor` entry count. Ultimate fallback: 1.
fn parse_cpu_capacity(cpuinfo: &str) -> u64 {
    let mut processors: u64 = 0;
    let mut siblings: Option<u64> = None;
    let mut physical_ids: HashSet<&str> = HashSet::new();

    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "processor" => processors += 1,
            "siblings" => {
                if let Ok(v) = value.parse() {
                    siblings = Some(v);
                }
            }
            "physical id" => {
                physical_ids.insert(value);
            }
            _ => {}
        }
    }

    match siblings {
        Some(s) if !physical_ids.is_empty() => s * physical_ids.len() as u64,
        _ if processors > 0 => processors,
        _ => 1,
    }
}

// ---- Memory ----

pub struct MemoryProbe {
    capacity: u64,
}

impl MemoryProbe {
    pub fn new(reader: &dyn HostReader) -> Result<Self> {
        let meminfo = reader.mem_info().context("failed to read /proc/meminfo")?;
        let capacity = parse_mem_total_bytes(&meminfo)
            .context("MemTotal not found in /proc/meminfo")?;
        Ok(Self { capacity })
    }
}

impl Probe for MemoryProbe {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Memory
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn source(&self) -> CapacitySource {
        CapacitySource::Detected
    }

    fn allocated(&self, snapshot: &AllocationSnapshot) -> u64 {
        snapshot.active().map(|i| i.memory_bytes).sum()
    }
}

/// `MemTotal` is reported in KiB.
fn parse_mem_total_bytes(meminfo: &str) -> Option<u64> {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kib * 1024);
        }
    }
    None
}

// ---- Disk ----

pub struct DiskProbe {
    capacity: u64,
    source: CapacitySource,
}

impl DiskProbe {
    pub fn new(reader: &dyn HostReader, data_dir: &Path, configured: Option<u64>) -> Result<Self> {
        if let Some(limit) = configured {
            return Ok(Self {
                capacity: limit,
                source: CapacitySource::Configured,
            });
        }
        let (blocks, bsize) = reader
            .statfs(data_dir)
            .with_context(|| format!("statfs failed for {}", data_dir.display()))?;
        Ok(Self {
            capacity: blocks * bsize,
            source: CapacitySource::Detected,
        })
    }

    /// The four-way split of `allocated`.
    pub fn breakdown(&self, snapshot: &AllocationSnapshot) -> DiskBreakdown {
        DiskBreakdown {
            images_bytes: snapshot.images_bytes,
            oci_cache_bytes: snapshot.oci_cache_bytes,
            volumes_bytes: snapshot.volumes_bytes,
            overlays_bytes: snapshot.active().map(|i| i.overlay_total_bytes()).sum(),
        }
    }
}

impl Probe for DiskProbe {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Disk
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn source(&self) -> CapacitySource {
        self.source
    }

    fn allocated(&self, snapshot: &AllocationSnapshot) -> u64 {
        self.breakdown(snapshot).total()
    }
}

// ---- Network ----

pub struct NetworkProbe {
    capacity: u64,
    source: CapacitySource,
}

impl NetworkProbe {
    /// Never fails: when neither a configured limit nor auto-detection
    /// yields a usable figure, capacity is 0 and network limiting is
    /// disabled (logged once here).
    pub fn new(
        reader: &dyn HostReader,
        configured: Option<u64>,
        uplink_override: Option<&str>,
    ) -> Self {
        if let Some(limit) = configured {
            return Self {
                capacity: limit,
                source: CapacitySource::Configured,
            };
        }

        let capacity = match Self::detect(reader, uplink_override) {
            Ok(bps) => bps,
            Err(e) => {
                warn!(error = %e, "network capacity auto-detect failed; network limiting disabled");
                0
            }
        };
        Self {
            capacity,
            source: CapacitySource::Detected,
        }
    }

    fn detect(reader: &dyn HostReader, uplink_override: Option<&str>) -> Result<u64> {
        let iface = match uplink_override {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => reader
                .default_route_interface()
                .context("failed to determine uplink interface")?,
        };
        let mbits = reader
            .interface_speed(&iface)
            .with_context(|| format!("failed to read speed of {iface}"))?;
        if mbits <= 0 {
            anyhow::bail!("interface {iface} reports unknown speed ({mbits})");
        }
        Ok(mbits as u64 * 1_000_000 / 8)
    }
}

impl Probe for NetworkProbe {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn source(&self) -> CapacitySource {
        self.source
    }

    fn allocated(&self, snapshot: &AllocationSnapshot) -> u64 {
        snapshot.active().map(|i| i.network_bps()).sum()
    }
}

/// Pick the interface of the first usable 0.0.0.0/0 route. Malformed lines
/// are skipped.
fn parse_default_route(table: &str) -> Option<String> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let (iface, destination, flags) = (fields[0], fields[1], fields[3]);
        let Ok(flags) = u32::from_str_radix(flags, 16) else {
            continue;
        };
        const RTF_UP: u32 = 0x1;
        if destination == "00000000" && flags & RTF_UP != 0 {
            return Some(iface.to_string());
        }
    }
    None
}
