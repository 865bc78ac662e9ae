//! M8/M9: stage the guest agent and start the workload.
//!
//! Exec mode keeps this process as PID 1, running the agent and the
//! entrypoint as chrooted children. Systemd mode installs the agent unit
//! and replaces the process image entirely.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, ExitStatus};

use anyhow::{anyhow, Context, Result};

use super::boot_log;
use super::config::GuestConfig;

/// Where the initramfs build stages the agent binary, next to this init.
pub const AGENT_SOURCE: &str = "/guest-agent";
/// Where workloads find the agent inside the rootfs.
pub const AGENT_GUEST_PATH: &str = "/opt/hypeman/guest-agent";

const AGENT_UNIT_NAME: &str = "hypeman-agent.service";
const AGENT_UNIT: &str = "\
[Unit]
Description=Hypeman guest agent

[Service]
ExecStart=/opt/hypeman/guest-agent
Restart=always

[Install]
WantedBy=multi-user.target
";

/// M8: copy the agent binary into the new root, mode 0755.
pub fn copy_agent(newroot: &Path) -> Result<()> {
    let dest = newroot.join(AGENT_GUEST_PATH.trim_start_matches('/'));
    let parent = dest.parent().expect("agent path has a parent");
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create {}", parent.display()))?;
    std::fs::copy(AGENT_SOURCE, &dest)
        .with_context(|| format!("copy {AGENT_SOURCE} to {}", dest.display()))?;
    std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
        .context("chmod guest agent")?;
    Ok(())
}

/// A command whose child chroots into the new root before exec.
pub(crate) fn command_in_root(root: &Path, program: &str) -> Command {
    let mut cmd = Command::new(program);
    let root = root.to_path_buf();
    unsafe {
        cmd.pre_exec(move || {
            std::os::unix::fs::chroot(&root)?;
            std::env::set_current_dir("/")
        });
    }
    cmd
}

/// M9, exec mode: agent in the background, entrypoint in the foreground.
/// Returns the entrypoint's exit code after both children are reaped —
/// PID 1 must outlive its children or the kernel panics.
pub fn run_exec(newroot: &Path, config: &GuestConfig) -> Result<i32> {
    let agent = match command_in_root(newroot, AGENT_GUEST_PATH).spawn() {
        Ok(child) => Some(child),
        Err(e) => {
            boot_log::error("exec", format_args!("guest agent failed to start: {e}"));
            None
        }
    };

    let shell_line = entry_shell_line(config);
    let mut child = command_in_root(newroot, "/bin/sh")
        .arg("-c")
        .arg(&shell_line)
        .env_clear()
        .envs(config.merged_env())
        .spawn()
        .context("start entrypoint")?;

    let status = child.wait().context("wait for entrypoint")?;
    let code = exit_code(status);
    boot_log::info("exec", format_args!("entrypoint exited with code {code}"));

    if let Some(mut agent) = agent {
        let _ = agent.wait();
    }
    Ok(code)
}

/// M9, systemd mode: install the agent unit, chroot, and replace this
/// process with the service manager. Returns only on failure.
pub fn run_systemd(newroot: &Path, config: &GuestConfig) -> anyhow::Error {
    if let Err(e) = install_agent_unit(newroot) {
        return e;
    }
    if let Err(e) = std::os::unix::fs::chroot(newroot) {
        return anyhow!(e).context("chroot into new root");
    }
    if let Err(e) = std::env::set_current_dir("/") {
        return anyhow!(e).context("chdir to new root");
    }

    let mut argv = config.argv();
    if argv.first().map(|s| s.is_empty()).unwrap_or(true) {
        argv = vec!["/sbin/init".to_string()];
    }

    let err = Command::new(&argv[0])
        .args(&argv[1..])
        .env_clear()
        .envs(config.merged_env())
        .exec();
    anyhow!(err).context(format!("exec {}", argv[0]))
}

/// Unit file plus the multi-user.target.wants enablement symlink.
fn install_agent_unit(newroot: &Path) -> Result<()> {
    let unit_dir = newroot.join("etc/systemd/system");
    std::fs::create_dir_all(&unit_dir).context("create systemd unit dir")?;
    std::fs::write(unit_dir.join(AGENT_UNIT_NAME), AGENT_UNIT)
        .context("write agent unit")?;

    let wants_dir = unit_dir.join("multi-user.target.wants");
    std::fs::create_dir_all(&wants_dir).context("create wants dir")?;
    let link = wants_dir.join(AGENT_UNIT_NAME);
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(&link).context("remove stale unit link")?;
    }
    std::os::unix::fs::symlink(format!("../{AGENT_UNIT_NAME}"), &link)
        .context("enable agent unit")?;
    Ok(())
}

/// The workload runs through the shell so workdir and word splitting
/// behave like a container entrypoint.
fn entry_shell_line(config: &GuestConfig) -> String {
    let workdir = config.workdir.as_deref().unwrap_or("/");
    match config.cmd.as_deref() {
        Some(cmd) if !cmd.is_empty() => {
            format!("cd {workdir} && exec {} {cmd}", config.entrypoint)
        }
        _ => format!("cd {workdir} && exec {}", config.entrypoint),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}
