//! M4: guest network bring-up via rtnetlink.
//!
//! Loopback up, the configured address on eth0, the default route, and a
//! resolv.conf inside the new root. Failures here degrade the boot rather
//! than aborting it; a VM without networking is still debuggable.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use futures::TryStreamExt;

use super::config::NetworkConfig;

pub fn configure(net: &NetworkConfig, newroot: &Path) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("build network runtime")?;
    runtime.block_on(bring_up(net))?;
    write_resolv_conf(newroot, net)
}

async fn bring_up(net: &NetworkConfig) -> Result<()> {
    let (connection, handle, _) =
        rtnetlink::new_connection().context("open rtnetlink connection")?;
    let connection = tokio::spawn(connection);

    // loopback
    let lo = handle
        .link()
        .get()
        .match_name("lo".to_string())
        .execute()
        .try_next()
        .await
        .context("query lo")?
        .context("interface lo not found")?;
    handle
        .link()
        .set(lo.header.index)
        .up()
        .execute()
        .await
        .context("set lo up")?;

    // eth0: address, then up
    let eth0 = handle
        .link()
        .get()
        .match_name("eth0".to_string())
        .execute()
        .try_next()
        .await
        .context("query eth0")?
        .context("interface eth0 not found")?;
    handle
        .address()
        .add(eth0.header.index, IpAddr::V4(net.ip), net.cidr)
        .execute()
        .await
        .context("add address to eth0")?;
    handle
        .link()
        .set(eth0.header.index)
        .up()
        .execute()
        .await
        .context("set eth0 up")?;

    // default route via the configured gateway
    handle
        .route()
        .add()
        .v4()
        .gateway(net.gateway)
        .execute()
        .await
        .context("add default route")?;

    connection.abort();
    Ok(())
}

fn write_resolv_conf(newroot: &Path, net: &NetworkConfig) -> Result<()> {
    let etc = newroot.join("etc");
    std::fs::create_dir_all(&etc).context("create etc in new root")?;
    std::fs::write(etc.join("resolv.conf"), format!("nameserver {}\n", net.dns))
        .context("write resolv.conf")
}
