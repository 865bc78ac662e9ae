//! M5: NVIDIA driver stack inside the guest.
//!
//! Loads the kernel modules from the initrd's module tree, creates the
//! device nodes, and injects the userspace driver (libraries + tools) into
//! the new root so the workload can link against it.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::kmod::ModuleInitFlags;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use super::exec::command_in_root;

/// Load order matters: uvm/modeset/drm all depend on the core module.
const MODULE_LOAD_ORDER: [(&str, &str); 4] = [
    ("nvidia.ko", ""),
    ("nvidia-uvm.ko", ""),
    ("nvidia-modeset.ko", ""),
    ("nvidia-drm.ko", "modeset=1"),
];

/// Userspace driver payload staged in the initrd by image build.
const USERSPACE_LIB_SOURCE: &str = "/usr/lib/nvidia";
const TOOLS: [&str; 2] = ["nvidia-smi", "nvidia-modprobe"];

pub fn setup(newroot: &Path) -> Result<()> {
    load_driver_modules()?;
    create_device_nodes()?;
    inject_userspace(newroot)?;
    run_ldconfig(newroot)
}

fn load_driver_modules() -> Result<()> {
    let uname = nix::sys::utsname::uname().context("uname")?;
    let release = uname.release().to_string_lossy();
    let module_dir = PathBuf::from(format!("/lib/modules/{release}/kernel/drivers/gpu"));

    for (module, params) in MODULE_LOAD_ORDER {
        let path = module_dir.join(module);
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let params = CString::new(params).expect("static module params");
        match nix::kmod::finit_module(&file, &params, ModuleInitFlags::empty()) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => return Err(e).with_context(|| format!("insert module {module}")),
        }
    }
    Ok(())
}

/// nvidia-modprobe knows the device majors; without it, read them from
/// /proc/devices and mknod by hand.
fn create_device_nodes() -> Result<()> {
    if let Ok(status) = Command::new("nvidia-modprobe").args(["-c", "0", "-u"]).status() {
        if status.success() {
            return Ok(());
        }
    }

    let devices = std::fs::read_to_string("/proc/devices").context("read /proc/devices")?;
    let nvidia = char_major(&devices, "nvidia-frontend")
        .or_else(|| char_major(&devices, "nvidia"))
        .context("nvidia major not listed in /proc/devices")?;
    mknod_chr("/dev/nvidiactl", nvidia, 255)?;
    mknod_chr("/dev/nvidia0", nvidia, 0)?;

    let uvm = char_major(&devices, "nvidia-uvm")
        .context("nvidia-uvm major not listed in /proc/devices")?;
    mknod_chr("/dev/nvidia-uvm", uvm, 0)?;
    mknod_chr("/dev/nvidia-uvm-tools", uvm, 1)?;
    Ok(())
}

fn mknod_chr(path: &str, major: u64, minor: u64) -> Result<()> {
    match mknod(
        path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o666),
        makedev(major, minor),
    ) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("mknod {path}")),
    }
}

/// Major number of a character device by name, or None.
fn char_major(devices: &str, name: &str) -> Option<u64> {
    let mut in_char_section = false;
    for line in devices.lines() {
        if line.starts_with("Character devices:") {
            in_char_section = true;
            continue;
        }
        if line.starts_with("Block devices:") {
            in_char_section = false;
            continue;
        }
        if !in_char_section {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(major), Some(device)) = (fields.next(), fields.next()) else {
            continue;
        };
        if device == name {
            return major.parse().ok();
        }
    }
    None
}

fn inject_userspace(newroot: &Path) -> Result<()> {
    let lib_dir = newroot.join("usr/lib").join(arch_lib_dir());
    copy_versioned_libs(Path::new(USERSPACE_LIB_SOURCE), &lib_dir)?;

    let bin_dir = newroot.join("usr/bin");
    std::fs::create_dir_all(&bin_dir).context("create usr/bin in new root")?;
    for tool in TOOLS {
        let source = Path::new("/usr/bin").join(tool);
        if !source.exists() {
            continue;
        }
        let dest = bin_dir.join(tool);
        std::fs::copy(&source, &dest).with_context(|| format!("copy {tool}"))?;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {tool}"))?;
    }
    Ok(())
}

fn arch_lib_dir() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "aarch64-linux-gnu"
    } else {
        "x86_64-linux-gnu"
    }
}

/// Copy every versioned shared object and lay down the standard
/// `libX.so → libX.so.1 → libX.so.VERSION` chain.
fn copy_versioned_libs(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("create {}", dest.display()))?;
    let entries = std::fs::read_dir(source)
        .with_context(|| format!("read {}", source.display()))?;

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.contains(".so.") {
            continue;
        }
        std::fs::copy(entry.path(), dest.join(&name))
            .with_context(|| format!("copy {name}"))?;
        symlink_chain(dest, &name)?;
    }
    Ok(())
}

fn symlink_chain(dir: &Path, file_name: &str) -> Result<()> {
    let stem = file_name
        .split(".so.")
        .next()
        .unwrap_or(file_name);
    let soname = format!("{stem}.so.1");
    if soname != file_name {
        replace_symlink(file_name, &dir.join(&soname))?;
    }
    replace_symlink(&soname, &dir.join(format!("{stem}.so")))
}

fn replace_symlink(target: &str, link: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(link)
            .with_context(|| format!("remove stale {}", link.display()))?;
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("symlink {} -> {target}", link.display()))
}

fn run_ldconfig(newroot: &Path) -> Result<()> {
    let status = command_in_root(newroot, "ldconfig")
        .status()
        .context("run ldconfig in new root")?;
    if !status.success() {
        bail!("ldconfig exited with {status}");
    }
    Ok(())
}
