//! Merging of network discovery results.
//!
//! Every discovery channel reports endpoints and shares independently, so
//! the same server shows up several times under different addresses, names
//! and protocol versions. This module folds those reports into one list and
//! lines the scan results up with shares that are already mounted or
//! configured.

use std::cmp::Ordering;

use crate::device::DeviceRecord;
use crate::net::{NetInterface, Resolver, host_info, is_local_address};

/// A host found by a discovery channel, with the services it offers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NmapEntry {
    pub ip: String,
    pub host: String,
    /// Port 445 is open.
    pub smb: bool,
    /// Port 111 (portmapper) is open.
    pub rpc: bool,
    /// Port 2049 is open.
    pub nfs: bool,
}

/// Share protocols. NFSv4 sorts before NFSv3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShareKind {
    Smb,
    Nfs4,
    Nfs,
}

impl ShareKind {
    /// Kinds in the same family are duplicates of each other.
    fn family(self) -> u8 {
        match self {
            ShareKind::Smb => 0,
            ShareKind::Nfs4 | ShareKind::Nfs => 1,
        }
    }

    pub fn fstype(self) -> &'static str {
        match self {
            ShareKind::Smb => "cifs",
            ShareKind::Nfs4 => "nfs4",
            ShareKind::Nfs => "nfs",
        }
    }
}

/// A share exported by a discovered host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetShare {
    pub ip: String,
    pub host: String,
    /// Display name of the server: the host name when known, else the address.
    pub srvr: String,
    pub share: String,
    pub comment: String,
    pub kind: ShareKind,
}

impl NetShare {
    pub fn new(ip: &str, host: &str, share: &str, comment: &str, kind: ShareKind) -> Self {
        Self {
            ip: ip.to_string(),
            host: host.to_string(),
            srvr: String::new(),
            share: share.to_string(),
            comment: comment.to_string(),
            kind,
        }
    }

    fn same_share(&self, other: &NetShare) -> bool {
        self.srvr == other.srvr
            && self.kind.family() == other.kind.family()
            && self.share == other.share
    }
}

/// Uses the local hostname for loopback and local interface addresses.
pub fn replace_local_hostname(ip: &str, host: &mut String, interfaces: &[NetInterface], hostname: &str) {
    if is_local_address(ip, interfaces) {
        *host = hostname.to_string();
    }
}

/// Keeps one entry per address.
///
/// Entries with a host name win over those without; service flags of all
/// entries for an address are combined.
pub fn collapse_nmap_list(list: &mut Vec<NmapEntry>) {
    list.sort_by(|l, r| {
        (l.ip.as_str(), l.host.is_empty(), l.host.as_str()).cmp(&(
            r.ip.as_str(),
            r.host.is_empty(),
            r.host.as_str(),
        ))
    });
    let mut collapsed: Vec<NmapEntry> = Vec::with_capacity(list.len());
    for entry in list.drain(..) {
        match collapsed.last_mut() {
            Some(first) if first.ip == entry.ip => {
                first.smb |= entry.smb;
                first.rpc |= entry.rpc;
                first.nfs |= entry.nfs;
            }
            _ => collapsed.push(entry),
        }
    }
    *list = collapsed;
}

fn share_order(l: &NetShare, r: &NetShare) -> Ordering {
    (l.host.is_empty(), &l.srvr, l.kind.family(), &l.share, l.kind).cmp(&(
        r.host.is_empty(),
        &r.srvr,
        r.kind.family(),
        &r.share,
        r.kind,
    ))
}

/// Normalizes host names, sorts and removes duplicate shares.
///
/// Named servers come before bare addresses. Of two duplicates the first one
/// is kept, with the longer comment.
pub fn collapse_share_list(list: &mut Vec<NetShare>, interfaces: &[NetInterface], hostname: &str) {
    for share in list.iter_mut() {
        replace_local_hostname(&share.ip, &mut share.host, interfaces, hostname);
    }

    let known: Vec<(String, String)> = list
        .iter()
        .filter(|s| !s.host.is_empty())
        .map(|s| (s.ip.clone(), s.host.clone()))
        .collect();
    for share in list.iter_mut().filter(|s| s.host.is_empty()) {
        if let Some((_, host)) = known.iter().find(|(ip, _)| *ip == share.ip) {
            share.host.clone_from(host);
        }
    }

    for share in list.iter_mut() {
        share.srvr = if share.host.is_empty() {
            share.ip.clone()
        } else {
            share.host.clone()
        };
    }

    list.sort_by(share_order);
    let mut collapsed: Vec<NetShare> = Vec::with_capacity(list.len());
    for share in list.drain(..) {
        match collapsed.last_mut() {
            Some(first) if first.same_share(&share) => {
                if first.comment.len() < share.comment.len() {
                    first.comment = share.comment;
                }
            }
            _ => collapsed.push(share),
        }
    }
    *list = collapsed;
}

/// Turns collapsed shares into device records.
pub fn shares_to_records(shares: Vec<NetShare>) -> Vec<DeviceRecord> {
    shares
        .into_iter()
        .map(|share| {
            let (path, name) = match share.kind {
                ShareKind::Smb => {
                    let name = prefixed(&share.share, '/');
                    (format!("//{}{name}", share.srvr), name)
                }
                ShareKind::Nfs4 | ShareKind::Nfs => {
                    let name = prefixed(&share.share, ':');
                    (format!("{}{name}", share.srvr), name)
                }
            };
            DeviceRecord {
                path,
                name,
                fstype: share.kind.fstype().to_string(),
                host: share.host,
                ip: share.ip,
                pkname: share.srvr,
                model: share.comment,
                netdev: true,
                ..DeviceRecord::default()
            }
        })
        .collect()
}

fn prefixed(share: &str, prefix: char) -> String {
    if share.starts_with(prefix) {
        share.to_string()
    } else {
        format!("{prefix}{share}")
    }
}

/// Equal filesystem types, counting NFS versions and SMB dialects as one.
pub fn netdev_type_eq(l: &str, r: &str) -> bool {
    let nfs = |t: &str| t == "nfs" || t == "nfs4";
    let smb = |t: &str| t == "cifs" || t == "smb3";
    l == r || (nfs(l) && nfs(r)) || (smb(l) && smb(r))
}

/// Resolves the servers of configured network shares and matches them with
/// scan results.
///
/// Each configured share gets its `IP` and `HOST` from its server name.
/// When a scan entry has the same address or host name, a missing host name
/// is taken from the scan, a differing one is pushed into the scan entry's
/// `PKNAME`, and the longer comment of the same share is kept. The server
/// name of the configured share ends up as its host name, or its address.
pub fn update_netdevs_values(
    configured: &mut [DeviceRecord],
    netscan: &mut [DeviceRecord],
    interfaces: &[NetInterface],
    hostname: &str,
    resolver: &dyn Resolver,
) {
    for dev in configured.iter_mut().filter(|d| d.netdev) {
        let (ip, mut host) = host_info(resolver, &dev.pkname);
        replace_local_hostname(&ip, &mut host, interfaces, hostname);
        let share = dev.name.to_uppercase();

        for found in netscan.iter_mut() {
            let same_ip = !ip.is_empty() && ip == found.ip;
            let same_host = !host.is_empty() && host == found.host;
            if !same_ip && !same_host {
                continue;
            }

            if host.is_empty() && !found.host.is_empty() {
                host.clone_from(&found.host);
            } else if !host.is_empty() && host != found.host {
                found.pkname.clone_from(&host);
            }

            if netdev_type_eq(&dev.fstype, &found.fstype)
                && share == found.name.to_uppercase()
                && dev.model.len() < found.model.len()
            {
                dev.model.clone_from(&found.model);
            }
        }

        dev.pkname = if host.is_empty() { ip.clone() } else { host.clone() };
        dev.ip = ip;
        dev.host = host;
    }
}
