//! M6: attach configured volumes under the new root.
//!
//! Read-only volumes mount `ro,noload`; read-write volumes mount ext4 with
//! defaults; overlay volumes stage the base disk read-only and merge a
//! writable overlay disk on top. Each mount fails independently.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::MsFlags;

use super::boot_log;
use super::config::{VolumeMode, VolumeMount};
use super::mounts::mount_fs;

/// Mount every configured volume, logging and skipping the ones that fail.
pub fn mount_all(volumes: &[VolumeMount], newroot: &Path) {
    for volume in volumes {
        boot_log::info(
            "volumes",
            format_args!("mounting {} at {}", volume.device, volume.path),
        );
        if let Err(e) = mount_volume(volume, newroot) {
            boot_log::error(
                "volumes",
                format_args!("skipping {}: {e:#}", volume.path),
            );
        }
    }
}

pub fn mount_volume(volume: &VolumeMount, newroot: &Path) -> Result<()> {
    let target = newroot.join(volume.path.trim_start_matches('/'));
    std::fs::create_dir_all(&target)
        .with_context(|| format!("create mountpoint {}", target.display()))?;

    match volume.mode {
        VolumeMode::Ro => mount_fs(
            &volume.device,
            &target,
            "ext4",
            MsFlags::MS_RDONLY,
            Some("noload"),
        ),
        VolumeMode::Rw => mount_fs(&volume.device, &target, "ext4", MsFlags::empty(), None),
        VolumeMode::Overlay => mount_overlay_volume(volume, &target),
    }
}

fn mount_overlay_volume(volume: &VolumeMount, target: &Path) -> Result<()> {
    let overlay_device = volume
        .overlay_device
        .as_deref()
        .context("overlay volume has no overlay_device")?;

    let (base_dir, overlay_dir) = staging_dirs(&volume.device);
    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("create {}", base_dir.display()))?;
    std::fs::create_dir_all(&overlay_dir)
        .with_context(|| format!("create {}", overlay_dir.display()))?;

    mount_fs(
        &volume.device,
        &base_dir,
        "ext4",
        MsFlags::MS_RDONLY,
        Some("noload"),
    )?;
    mount_fs(overlay_device, &overlay_dir, "ext4", MsFlags::empty(), None)?;

    let upper = overlay_dir.join("upper");
    let work = overlay_dir.join("work");
    std::fs::create_dir_all(&upper).context("create overlay upper")?;
    std::fs::create_dir_all(&work).context("create overlay work")?;

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        base_dir.display(),
        upper.display(),
        work.display()
    );
    mount_fs("overlay", target, "overlay", MsFlags::empty(), Some(&options))
}

/// Staging mountpoints for an overlay volume, keyed by the device basename
/// so two volumes with identical mountpoint basenames cannot collide.
fn staging_dirs(device: &str) -> (PathBuf, PathBuf) {
    let devname = device_basename(device);
    (
        PathBuf::from(format!("/mnt/vol-base-{devname}")),
        PathBuf::from(format!("/mnt/vol-overlay-{devname}")),
    )
}

fn device_basename(device: &str) -> &str {
    device.rsplit('/').next().unwrap_or(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_dirs_use_device_basename() {
        let (base, overlay) = staging_dirs("/dev/vdd");
        assert_eq!(base, PathBuf::from("/mnt/vol-base-vdd"));
        assert_eq!(overlay, PathBuf::from("/mnt/vol-overlay-vdd"));
    }

    #[test]
    fn staging_dirs_disambiguate_by_device_not_mountpoint() {
        // Two volumes mounted at /a/data and /b/data share the basename
        // "data"; their staging dirs still differ because devices differ.
        let (base_d, _) = staging_dirs("/dev/vdd");
        let (base_e, _) = staging_dirs("/dev/vde");
        assert_ne!(base_d, base_e);
    }

    #[test]
    fn device_basename_handles_plain_names() {
        assert_eq!(device_basename("vdd"), "vdd");
        assert_eq!(device_basename("/dev/vde"), "vde");
    }

    #[test]
    fn overlay_volume_without_overlay_device_fails_early() {
        let root = tempfile::tempdir().unwrap();
        let volume = VolumeMount {
            device: "/dev/vdd".into(),
            path: "/data".into(),
            mode: VolumeMode::Overlay,
            overlay_device: None,
        };
        let err = mount_volume(&volume, root.path()).unwrap_err();
        assert!(err.to_string().contains("overlay_device"));
    }

    #[test]
    fn mountpoint_is_created_under_newroot() {
        let root = tempfile::tempdir().unwrap();
        let volume = VolumeMount {
            device: "/dev/nonexistent-device".into(),
            path: "/data/nested".into(),
            mode: VolumeMode::Rw,
            overlay_device: None,
        };
        // The mount itself fails (no such device in a test environment),
        // but the mountpoint must exist by then.
        let _ = mount_volume(&volume, root.path());
        assert!(root.path().join("data/nested").is_dir());
    }
}
