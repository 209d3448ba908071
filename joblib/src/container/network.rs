//! Bridge, veth, and network-namespace plumbing.
//!
//! The host side owns a singleton bridge (`workernator0`, 172.16.0.1/16).
//! Each container gets a veth pair: `veth0_<id>` stays on the bridge,
//! `veth1_<id>` is moved into a network namespace that was bind-mounted
//! under `<run>/net-ns/<id>` by the `setup-net-ns` helper.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use nix::mount::{mount, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use rand::Rng;
use rtnetlink::Handle;
use tracing::debug;

use crate::error::{Error, Result};

pub const BRIDGE_NAME: &str = "workernator0";
pub const BRIDGE_ADDR: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 1);
const NET_PREFIX: u8 = 16;

pub fn veth_host_name(id: &str) -> String {
    format!("veth0_{}", &id[..6])
}

pub fn veth_peer_name(id: &str) -> String {
    format!("veth1_{}", &id[..6])
}

pub fn net_ns_dir(run: &Path) -> PathBuf {
    run.join("net-ns")
}

pub fn net_ns_mount(run: &Path, id: &str) -> PathBuf {
    net_ns_dir(run).join(id)
}

async fn connect() -> Result<Handle> {
    let (connection, handle, _) = rtnetlink::new_connection()
        .map_err(|err| Error::io("unable to open netlink socket", err))?;
    tokio::spawn(connection);
    Ok(handle)
}

async fn link_index(handle: &Handle, name: &str) -> Result<Option<u32>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(Some(link.header.index)),
        // a name miss comes back as an ENODEV error, not an empty stream
        Ok(None) | Err(_) => Ok(None),
    }
}

/// Create the `workernator0` bridge if it does not exist, assign it
/// 172.16.0.1/16, and bring it up. Called once at manager startup.
pub async fn ensure_bridge() -> Result<()> {
    let handle = connect().await?;
    if link_index(&handle, BRIDGE_NAME).await?.is_some() {
        debug!(bridge = BRIDGE_NAME, "bridge already present");
        return Ok(());
    }

    handle
        .link()
        .add()
        .bridge(BRIDGE_NAME.to_string())
        .execute()
        .await
        .map_err(|err| Error::netlink("bridge add", err))?;
    let index = link_index(&handle, BRIDGE_NAME)
        .await?
        .ok_or_else(|| Error::netlink("bridge lookup", "bridge missing after add"))?;
    handle
        .address()
        .add(index, IpAddr::V4(BRIDGE_ADDR), NET_PREFIX)
        .execute()
        .await
        .map_err(|err| Error::netlink("bridge address add", err))?;
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|err| Error::netlink("bridge up", err))?;
    Ok(())
}

/// Create the container's veth pair on the host, attach the host end to the
/// bridge, and bring it up. The peer end stays put until `setup_veth` moves
/// it into the container's namespace.
pub async fn setup_host_veth(id: &str) -> Result<()> {
    let handle = connect().await?;
    let host = veth_host_name(id);
    let peer = veth_peer_name(id);

    handle
        .link()
        .add()
        .veth(host.clone(), peer.clone())
        .execute()
        .await
        .map_err(|err| Error::netlink("veth add", err))?;

    let host_index = link_index(&handle, &host)
        .await?
        .ok_or_else(|| Error::netlink("veth lookup", format!("'{host}' missing after add")))?;
    let bridge_index = link_index(&handle, BRIDGE_NAME)
        .await?
        .ok_or_else(|| Error::netlink("bridge lookup", format!("'{BRIDGE_NAME}' is missing")))?;

    handle
        .link()
        .set(host_index)
        .master(bridge_index)
        .execute()
        .await
        .map_err(|err| Error::netlink("veth set master", err))?;
    handle
        .link()
        .set(host_index)
        .up()
        .execute()
        .await
        .map_err(|err| Error::netlink("veth up", err))?;
    Ok(())
}

/// `setup-net-ns` helper body: create `<run>/net-ns/<id>`, unshare a fresh
/// network namespace, bind-mount it there so it outlives this helper, then
/// hop back into the original namespace.
pub fn setup_net_ns(run: &Path, id: &str) -> Result<()> {
    fs::create_dir_all(net_ns_dir(run))
        .map_err(|err| Error::io("unable to create net-ns directory", err))?;

    let ns_mount = net_ns_mount(run, id);
    // the bind target must exist before mounting over it; O_EXCL keeps a
    // stale file from a prior run from going unnoticed
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&ns_mount)
        .map_err(|err| {
            Error::io(
                format!("unable to create netns bind target '{}'", ns_mount.display()),
                err,
            )
        })?;

    let original = fs::File::open("/proc/self/ns/net")
        .map_err(|err| Error::io("unable to open /proc/self/ns/net", err))?;

    unshare(CloneFlags::CLONE_NEWNET).map_err(|err| Error::syscall("unshare", err))?;
    mount(
        Some("/proc/self/ns/net"),
        &ns_mount,
        Some("bind"),
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|err| Error::syscall("bind mount netns", err))?;
    setns(&original, CloneFlags::CLONE_NEWNET).map_err(|err| Error::syscall("setns", err))?;
    Ok(())
}

/// `setup-veth` helper body: move `veth1_<id>` into the bind-mounted
/// namespace, then enter that namespace and give the interface an address,
/// bring it up, and route everything through the bridge.
///
/// Must run on a single-thread runtime: `setns` switches the calling thread,
/// and the second netlink connection has to be opened from inside the
/// namespace.
pub async fn setup_veth(run: &Path, id: &str) -> Result<()> {
    let ns_mount = net_ns_mount(run, id);
    let ns_file = fs::File::open(&ns_mount).map_err(|err| {
        Error::io(
            format!("unable to open netns mount '{}'", ns_mount.display()),
            err,
        )
    })?;

    let peer = veth_peer_name(id);
    let handle = connect().await?;
    let index = link_index(&handle, &peer)
        .await?
        .ok_or_else(|| Error::netlink("veth lookup", format!("'{peer}' is missing")))?;
    handle
        .link()
        .set(index)
        .setns_by_fd(ns_file.as_raw_fd())
        .execute()
        .await
        .map_err(|err| Error::netlink("veth move to netns", err))?;

    setns(&ns_file, CloneFlags::CLONE_NEWNET).map_err(|err| Error::syscall("setns", err))?;

    let handle = connect().await?;
    let index = link_index(&handle, &peer)
        .await?
        .ok_or_else(|| Error::netlink("veth lookup", format!("'{peer}' missing inside netns")))?;
    handle
        .address()
        .add(index, IpAddr::V4(container_ip()), NET_PREFIX)
        .execute()
        .await
        .map_err(|err| Error::netlink("veth address add", err))?;
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|err| Error::netlink("veth up", err))?;
    handle
        .route()
        .add()
        .v4()
        .gateway(BRIDGE_ADDR)
        .execute()
        .await
        .map_err(|err| Error::netlink("default route add", err))?;
    Ok(())
}

fn container_ip() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    Ipv4Addr::new(172, 16, rng.gen_range(1..255), rng.gen_range(1..255))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_use_the_id_prefix() {
        let id = "c8kum2ppnl6ph3fkv02g";
        assert_eq!(veth_host_name(id), "veth0_c8kum2");
        assert_eq!(veth_peer_name(id), "veth1_c8kum2");
    }

    #[test]
    fn container_ips_stay_in_the_bridge_subnet() {
        for _ in 0..64 {
            let ip = container_ip();
            let [a, b, c, d] = ip.octets();
            assert_eq!((a, b), (172, 16));
            assert!((1..255).contains(&c));
            assert!((1..255).contains(&d));
        }
    }

    #[test]
    fn net_ns_paths() {
        let run = Path::new("/var/run/workernator");
        assert_eq!(
            net_ns_mount(run, "abc"),
            PathBuf::from("/var/run/workernator/net-ns/abc")
        );
    }
}
