//! Mount plumbing for the boot sequence: essentials (M1), the overlay
//! rootfs (M2), the config disk (M3), and pseudo-filesystem propagation
//! into the new root (M7).

use std::os::fd::IntoRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::mount::MsFlags;

pub const LOWER_DIR: &str = "/lower";
pub const OVERLAY_DIR: &str = "/overlay";
pub const NEWROOT_DIR: &str = "/overlay/newroot";
pub const CONFIG_DIR: &str = "/mnt/config";

pub const ROOTFS_DEVICE: &str = "/dev/vda";
pub const OVERLAY_DEVICE: &str = "/dev/vdb";
pub const CONFIG_DEVICE: &str = "/dev/vdc";

/// Grace for virtio block devices to settle after the kernel hands off.
const DEVICE_SETTLE: Duration = Duration::from_millis(500);
const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn mount_fs(
    source: &str,
    target: impl AsRef<Path>,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    let target = target.as_ref();
    nix::mount::mount(Some(source), target, Some(fstype), flags, data)
        .with_context(|| format!("mount {source} on {} ({fstype})", target.display()))
}

pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| {
        format!("bind mount {} on {}", source.display(), target.display())
    })
}

/// Block until a device node appears; provisioning races the guest boot.
pub fn wait_for_device(path: &str) -> Result<()> {
    let start = Instant::now();
    while !Path::new(path).exists() {
        if start.elapsed() > DEVICE_WAIT_TIMEOUT {
            bail!("device {path} did not appear within {DEVICE_WAIT_TIMEOUT:?}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

/// M1: /dev/pts, /dev/shm, and the serial console bound to stdout/stderr.
/// The wrapper script has already mounted /proc, /sys, /dev.
pub fn setup_essentials() -> Result<PathBuf> {
    std::fs::create_dir_all("/dev/pts").context("create /dev/pts")?;
    std::fs::create_dir_all("/dev/shm").context("create /dev/shm")?;
    mount_fs(
        "devpts",
        "/dev/pts",
        "devpts",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
        Some("mode=0620,ptmxmode=000"),
    )?;
    std::fs::set_permissions("/dev/shm", std::fs::Permissions::from_mode(0o1777))
        .context("chmod /dev/shm")?;

    let console = console_device();
    bind_console(&console)?;
    Ok(console)
}

/// ARM64 guests expose a PL011 UART; x86_64 a 16550.
fn console_device() -> PathBuf {
    let pl011 = Path::new("/dev/ttyAMA0");
    if pl011.exists() {
        pl011.to_path_buf()
    } else {
        PathBuf::from("/dev/ttyS0")
    }
}

/// Re-open stdout and stderr onto the serial console so every later log
/// line is visible to the host.
fn bind_console(console: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(console)
        .with_context(|| format!("open console {}", console.display()))?;
    let fd = file.into_raw_fd();
    nix::unistd::dup2(fd, 1).context("dup2 console to stdout")?;
    nix::unistd::dup2(fd, 2).context("dup2 console to stderr")?;
    Ok(())
}

/// M2: assemble the merged rootfs from the immutable image disk and the
/// per-instance writable overlay disk.
pub fn setup_overlay_root() -> Result<()> {
    std::thread::sleep(DEVICE_SETTLE);
    wait_for_device(ROOTFS_DEVICE)?;
    wait_for_device(OVERLAY_DEVICE)?;

    std::fs::create_dir_all(LOWER_DIR).context("create /lower")?;
    std::fs::create_dir_all(OVERLAY_DIR).context("create /overlay")?;
    mount_fs(ROOTFS_DEVICE, LOWER_DIR, "ext4", MsFlags::MS_RDONLY, None)?;
    mount_fs(OVERLAY_DEVICE, OVERLAY_DIR, "ext4", MsFlags::empty(), None)?;

    for dir in ["upper", "work", "newroot"] {
        std::fs::create_dir_all(Path::new(OVERLAY_DIR).join(dir))
            .with_context(|| format!("create /overlay/{dir}"))?;
    }

    mount_fs(
        "overlay",
        NEWROOT_DIR,
        "overlay",
        MsFlags::empty(),
        Some("lowerdir=/lower,upperdir=/overlay/upper,workdir=/overlay/work"),
    )
}

/// M3 (mount half): the read-only config disk.
pub fn mount_config_device() -> Result<PathBuf> {
    wait_for_device(CONFIG_DEVICE)?;
    std::fs::create_dir_all(CONFIG_DIR).context("create /mnt/config")?;
    mount_fs(CONFIG_DEVICE, CONFIG_DIR, "ext4", MsFlags::MS_RDONLY, None)?;
    Ok(PathBuf::from(CONFIG_DIR))
}

/// M7: propagate the pseudo-filesystems into the new root and install the
/// standard /dev convenience symlinks.
pub fn bind_pseudo_filesystems(newroot: &Path) -> Result<()> {
    for mount in ["proc", "sys", "dev", "dev/pts"] {
        let target = newroot.join(mount);
        std::fs::create_dir_all(&target)
            .with_context(|| format!("create {}", target.display()))?;
        bind_mount(&Path::new("/").join(mount), &target)?;
    }

    dev_symlinks(newroot)
}

/// `/dev/{fd,stdin,stdout,stderr}` → /proc/self/fd[/0..2], replacing any
/// pre-existing entries from the image.
fn dev_symlinks(newroot: &Path) -> Result<()> {
    let links = [
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ];
    for (name, target) in links {
        let link = newroot.join("dev").join(name);
        match std::fs::symlink_metadata(&link) {
            Ok(_) => std::fs::remove_file(&link)
                .with_context(|| format!("remove stale {}", link.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(format!("stat {}", link.display())),
        }
        std::os::unix::fs::symlink(target, &link)
            .with_context(|| format!("symlink {} -> {target}", link.display()))?;
    }
    Ok(())
}
