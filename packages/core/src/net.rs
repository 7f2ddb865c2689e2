//! Local network interfaces and name resolution.

use std::ffi::CStr;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use nix::ifaddrs::getifaddrs;
use nix::libc;
use nix::net::if_::{InterfaceFlags, if_nametoindex};
use nix::sys::socket::{SockaddrLike, SockaddrStorage};

use crate::error::{Error, Result};
use crate::settings::Settings;

const NI_MAXHOST: usize = 1025;

/// An active interface address usable for discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub index: u32,
    pub ip: IpAddr,
}

/// Lists interfaces that are up, running and multicast capable.
///
/// Each interface contributes at most one address per family, and IPv6 is
/// skipped on interfaces that also have IPv4.
pub fn list_active_interfaces() -> Result<Vec<NetInterface>> {
    let addrs = getifaddrs().map_err(|e| Error::Discovery {
        channel: "interfaces",
        message: e.to_string(),
    })?;
    let required = InterfaceFlags::IFF_UP | InterfaceFlags::IFF_RUNNING | InterfaceFlags::IFF_MULTICAST;

    let mut candidates = Vec::new();
    for ifaddr in addrs {
        if !ifaddr.flags.contains(required) {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        let ip = if let Some(v4) = address.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = address.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            continue;
        };
        let Ok(index) = if_nametoindex(ifaddr.interface_name.as_str()) else {
            continue;
        };
        candidates.push(NetInterface {
            name: ifaddr.interface_name,
            index,
            ip,
        });
    }
    Ok(select_interfaces(candidates))
}

fn select_interfaces(candidates: Vec<NetInterface>) -> Vec<NetInterface> {
    let mut selected: Vec<NetInterface> = Vec::new();
    for iface in &candidates {
        let has_ipv4 = candidates
            .iter()
            .any(|other| other.index == iface.index && other.ip.is_ipv4());
        if iface.ip.is_ipv6() && has_ipv4 {
            continue;
        }
        let duplicate = selected
            .iter()
            .any(|s| s.index == iface.index && s.ip.is_ipv4() == iface.ip.is_ipv4());
        if !duplicate {
            selected.push(iface.clone());
        }
    }
    selected
}

/// The configured hostname, or the system one when set to `auto`.
pub fn local_hostname(settings: &Settings) -> String {
    if !settings.hostname.is_empty() && settings.hostname != "auto" {
        return settings.hostname.clone();
    }
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// True for loopback addresses and addresses of a local interface.
pub fn is_local_address(ip: &str, interfaces: &[NetInterface]) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(addr) => addr.is_loopback() || interfaces.iter().any(|iface| iface.ip == addr),
        Err(_) => false,
    }
}

/// Host name lookups.
pub trait Resolver {
    /// Reverse lookup; `None` when the address has no name.
    fn reverse(&self, ip: IpAddr) -> Option<String>;
    /// Forward lookup of the first address.
    fn forward(&self, host: &str) -> Option<IpAddr>;
}

/// Resolver backed by the system resolver (`getnameinfo`, `getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn reverse(&self, ip: IpAddr) -> Option<String> {
        let addr = SockaddrStorage::from(SocketAddr::new(ip, 0));
        let mut host = [0 as libc::c_char; NI_MAXHOST];
        // SAFETY: `addr` is a valid socket address of `addr.len()` bytes and
        // `host` is a writable buffer of the advertised length.
        let rc = unsafe {
            libc::getnameinfo(
                addr.as_ptr(),
                addr.len(),
                host.as_mut_ptr(),
                NI_MAXHOST as libc::socklen_t,
                std::ptr::null_mut(),
                0,
                libc::NI_NAMEREQD,
            )
        };
        if rc != 0 {
            return None;
        }
        // SAFETY: getnameinfo wrote a NUL terminated string on success.
        let name = unsafe { CStr::from_ptr(host.as_ptr()) };
        Some(name.to_string_lossy().into_owned())
    }

    fn forward(&self, host: &str) -> Option<IpAddr> {
        (host, 0)
            .to_socket_addrs()
            .ok()?
            .next()
            .map(|addr| addr.ip())
    }
}

/// Resolves a server name into `(ip, host)`.
///
/// A numeric address is looked up in reverse; the host stays empty when it
/// has no name. A host name is looked up forward; the ip stays empty when it
/// does not resolve.
pub fn host_info(resolver: &dyn Resolver, server: &str) -> (String, String) {
    let server = server.trim_start_matches('[').trim_end_matches(']');
    match server.parse::<IpAddr>() {
        Ok(addr) => (
            addr.to_string(),
            resolver.reverse(addr).unwrap_or_default(),
        ),
        Err(_) => (
            resolver
                .forward(server)
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            server.to_string(),
        ),
    }
}
