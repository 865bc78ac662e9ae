//! Host GPU capability probe.
//!
//! Inspects PCI sysfs for NVIDIA hardware and classifies the host into one
//! of two sharing modes: SR-IOV virtual functions with mediated-device
//! support ("vgpu"), or whole-device VFIO passthrough. Hosts without an
//! NVIDIA device report no GPU at all.

use std::path::{Path, PathBuf};

use serde::Serialize;

const SYS_PCI_DEVICES: &str = "/sys/bus/pci/devices";
const NVIDIA_VENDOR: &str = "0x10de";
const VFIO_DRIVER: &str = "vfio-pci";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    Vgpu,
    Passthrough,
}

/// One SR-IOV virtual function slot.
#[derive(Debug, Clone, Serialize)]
pub struct VfProfile {
    /// PCI address of the VF (e.g. "0000:65:00.4").
    pub address: String,
    /// Whether a mediated device currently occupies this VF.
    pub has_mdev: bool,
}

/// One physical NVIDIA GPU eligible for passthrough.
#[derive(Debug, Clone, Serialize)]
pub struct PassthroughDevice {
    pub address: String,
    /// False once the device is bound to vfio-pci (claimed by a VM).
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuStatus {
    pub mode: GpuMode,
    pub total_slots: u64,
    pub used_slots: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<VfProfile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<PassthroughDevice>,
}

/// Probe the host's PCI tree. Returns `None` when no NVIDIA device is
/// present in either mode.
pub fn detect() -> Option<GpuStatus> {
    detect_at(Path::new(SYS_PCI_DEVICES))
}

/// Same as [`detect`] with an injectable sysfs root.
pub fn detect_at(pci_root: &Path) -> Option<GpuStatus> {
    let mut devices = list_nvidia_devices(pci_root);
    if devices.is_empty() {
        return None;
    }
    devices.sort();

    // One sysfs walk serves both the slot count and the profile catalog.
    let vf_profiles: Vec<VfProfile> = devices
        .iter()
        .filter(|dir| dir.join("physfn").exists() && dir.join("mdev_supported_types").exists())
        .map(|dir| VfProfile {
            address: device_address(dir),
            has_mdev: hosts_mdev(dir),
        })
        .collect();

    if !vf_profiles.is_empty() {
        let used = vf_profiles.iter().filter(|p| p.has_mdev).count() as u64;
        return Some(GpuStatus {
            mode: GpuMode::Vgpu,
            total_slots: vf_profiles.len() as u64,
            used_slots: used,
            profiles: vf_profiles,
            devices: Vec::new(),
        });
    }

    let passthrough: Vec<PassthroughDevice> = devices
        .iter()
        .filter(|dir| !dir.join("physfn").exists())
        .map(|dir| PassthroughDevice {
            address: device_address(dir),
            available: !bound_to_vfio(dir),
        })
        .collect();

    if passthrough.is_empty() {
        return None;
    }
    let used = passthrough.iter().filter(|d| !d.available).count() as u64;
    Some(GpuStatus {
        mode: GpuMode::Passthrough,
        total_slots: passthrough.len() as u64,
        used_slots: used,
        devices: passthrough,
        profiles: Vec::new(),
    })
}

fn list_nvidia_devices(pci_root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(pci_root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|dir| {
            std::fs::read_to_string(dir.join("vendor"))
                .map(|v| v.trim() == NVIDIA_VENDOR)
                .unwrap_or(false)
        })
        .collect()
}

fn device_address(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Mediated devices appear as UUID-named children of the VF directory.
fn hosts_mdev(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|e| is_uuid_like(&e.file_name().to_string_lossy()))
}

fn bound_to_vfio(dir: &Path) -> bool {
    std::fs::read_link(dir.join("driver"))
        .ok()
        .and_then(|t| t.file_name().map(|n| n.to_string_lossy().into_owned()))
        .map(|name| name == VFIO_DRIVER)
        .unwrap_or(false)
}

fn is_uuid_like(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    name.char_indices().all(|(i, c)| match i {
        8 | 13 | 18 | 23 => c == '-',
        _ => c.is_ascii_hexdigit(),
    })
}
