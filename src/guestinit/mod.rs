//! Guest PID-1 boot sequencer.
//!
//! Invoked after a tiny wrapper script mounts /proc, /sys and /dev. Boots
//! the micro-VM from a known-empty state: essentials, overlay rootfs,
//! config, network, GPU, volumes, pseudo-filesystem propagation, agent
//! staging, and finally the workload hand-off. Fatal phases drop to an
//! interactive shell on the serial console and exit 1; the rest log and
//! continue.

pub mod boot_log;
pub mod config;
pub mod exec;
pub mod gpu;
pub mod mounts;
pub mod network;
pub mod volumes;

use std::path::Path;

use anyhow::Result;

use config::{GuestConfig, InitMode};

pub fn run() -> i32 {
    match boot() {
        Ok(code) => code,
        Err(()) => {
            emergency_shell();
            1
        }
    }
}

fn boot() -> Result<i32, ()> {
    let newroot = Path::new(mounts::NEWROOT_DIR);

    boot_log::info("essentials", "preparing /dev and serial console");
    let console = fatal("essentials", mounts::setup_essentials())?;
    boot_log::info(
        "essentials",
        format_args!("console bound to {}", console.display()),
    );

    boot_log::info("rootfs", "assembling overlay rootfs");
    fatal("rootfs", mounts::setup_overlay_root())?;

    boot_log::info("config", "reading instance configuration");
    let config = fatal(
        "config",
        mounts::mount_config_device().and_then(|dir| GuestConfig::load(&dir)),
    )?;

    match &config.network {
        Some(net) => {
            boot_log::info(
                "network",
                format_args!("configuring eth0 {}/{} via {}", net.ip, net.cidr, net.gateway),
            );
            degraded("network", network::configure(net, newroot));
        }
        None => boot_log::info("network", "no network configured, skipping"),
    }

    if config.has_gpu {
        boot_log::info("gpu", "loading nvidia driver stack");
        degraded("gpu", gpu::setup(newroot));
    }

    volumes::mount_all(&config.volume_mounts, newroot);

    boot_log::info("pseudo-fs", "binding /proc, /sys, /dev into new root");
    fatal("pseudo-fs", mounts::bind_pseudo_filesystems(newroot))?;

    degraded("agent", exec::copy_agent(newroot));

    match config.init_mode {
        InitMode::Systemd => {
            boot_log::info("exec", "handing off to systemd");
            let err = exec::run_systemd(newroot, &config);
            // run_systemd only returns when process replacement failed
            boot_log::error("exec", format_args!("systemd hand-off failed: {err:#}"));
            Err(())
        }
        InitMode::Exec => {
            boot_log::info(
                "exec",
                format_args!("starting entrypoint {}", config.entrypoint),
            );
            fatal("exec", exec::run_exec(newroot, &config))
        }
    }
}

fn fatal<T>(phase: &str, result: Result<T>) -> Result<T, ()> {
    result.map_err(|e| boot_log::error(phase, format_args!("{e:#}")))
}

fn degraded(phase: &str, result: Result<()>) {
    if let Err(e) = result {
        boot_log::error(phase, format_args!("continuing after failure: {e:#}"));
    }
}

/// Leave an operator shell on the console before PID 1 exits.
fn emergency_shell() {
    boot_log::error("init", "boot failed, dropping to emergency shell");
    match std::process::Command::new("/bin/sh").spawn() {
        Ok(mut shell) => {
            let _ = shell.wait();
        }
        Err(e) => boot_log::error("init", format_args!("emergency shell failed to start: {e}")),
    }
}
