//! Local interface enumeration for listener binding.

use std::net::{IpAddr, SocketAddrV4};

use anyhow::{Context, Result};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

/// IPv4 addresses of every interface that is up and not a loopback.
pub fn usable_addrs() -> Result<Vec<IpAddr>> {
    let mut addrs = Vec::new();
    for ifaddr in getifaddrs().context("getifaddrs()")? {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let ip = IpAddr::V4(*SocketAddrV4::from(*sin).ip());
        if !addrs.contains(&ip) {
            tracing::debug!(interface = %ifaddr.interface_name, %ip, "usable interface");
            addrs.push(ip);
        }
    }
    Ok(addrs)
}
