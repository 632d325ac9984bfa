//! Local network interface enumeration
//!
//! Thin wrapper over `if-addrs`. The transport cannot cache these results:
//! addresses come and go as links flap and DHCP reassigns, so callers
//! re-enumerate on every decision that depends on them.

use std::net::IpAddr;

use if_addrs::get_if_addrs;
use tracing::warn;

/// One address of one local interface.
#[derive(Debug, Clone)]
pub struct NetIf {
    pub name: String,
    pub addr: IpAddr,
    pub is_loopback: bool,
}

/// Enumerate the addresses currently assigned to local interfaces.
///
/// Enumeration failure is reported as an empty list; every caller treats
/// "no interfaces" as a valid (if unhelpful) answer.
pub fn local_interfaces() -> Vec<NetIf> {
    match get_if_addrs() {
        Ok(entries) => entries
            .into_iter()
            .map(|entry| NetIf {
                is_loopback: entry.is_loopback(),
                addr: entry.addr.ip(),
                name: entry.name,
            })
            .collect(),
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}

/// Match an interface against one entry of the configured interface list.
/// An entry is either an interface name or an IP literal; `*` matches all.
pub fn if_matches(entry: &str, nif: &NetIf) -> bool {
    if entry == "*" {
        return true;
    }
    if let Ok(addr) = entry.parse::<IpAddr>() {
        return addr == nif.addr;
    }
    entry == nif.name
}
