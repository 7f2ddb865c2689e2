//! Network share discovery.
//!
//! Hosts are found with avahi (mDNS), WS-Discovery and nmap; their shares
//! are then listed with smbclient and showmount. Every channel is optional
//! and a failing one only costs its own results.

use std::net::IpAddr;
use std::path::Path;

use crate::device::DeviceRecord;
use crate::executor::ExecutionContext;
use crate::net::{NetInterface, Resolver, local_hostname};
use crate::reconcile::{
    NetShare, NmapEntry, ShareKind, collapse_nmap_list, collapse_share_list, shares_to_records,
};
use crate::settings::Settings;
use crate::wsd::{self, ProbeSchedule};

/// nmap must not load scripts from the user's home when run as root.
pub const NMAP_DATADIR: &str = "/usr/share/nmap";

const NMAP_PORTS: &str = "445,111,2049";

/// Which external discovery tools are installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTools {
    pub avahi: bool,
    pub smbclient: bool,
    pub showmount: bool,
    pub nmap: bool,
}

impl ScanTools {
    pub fn detect(settings: &Settings) -> Self {
        let have = |name: &str| Path::new(&settings.bin(name)).exists();
        Self {
            avahi: have("avahi-browse"),
            smbclient: have("smbclient"),
            showmount: have("showmount"),
            nmap: have("nmap"),
        }
    }
}

/// Decodes avahi's `\DDD` decimal escapes; malformed ones become a space.
pub fn unescape_dec(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| digits.parse::<u8>().ok());
            out.push(decoded.unwrap_or(b' '));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Value of a `"path=..."` TXT record.
fn txt_path(txt: &str) -> Option<&str> {
    let start = txt.find("\"path")? + "\"path".len();
    let rest = txt[start..].trim_start().strip_prefix('=')?.trim_start();
    let value = rest[..rest.find('"')?].trim_end();
    (!value.is_empty()).then_some(value)
}

/// Parses resolved `avahi-browse -artkp` records.
///
/// SMB services give hosts to probe for shares; NFS services are shares
/// already.
pub fn parse_avahi(output: &str) -> (Vec<NmapEntry>, Vec<NetShare>) {
    let mut hosts = Vec::new();
    let mut shares = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.splitn(10, ';').collect();
        if fields.len() < 10 || fields[0] != "=" || fields[1..9].iter().any(|f| f.is_empty()) {
            continue;
        }
        let (name, service, host, ip) = (fields[3], fields[4], fields[6], fields[7]);
        match service {
            "_smb._tcp" => hosts.push(NmapEntry {
                ip: ip.to_string(),
                host: host.to_string(),
                smb: true,
                ..NmapEntry::default()
            }),
            "_nfs._tcp" => {
                let (share, kind) = match txt_path(fields[9]) {
                    Some(path) => (unescape_dec(path), ShareKind::Nfs),
                    None => ("/".to_string(), ShareKind::Nfs4),
                };
                shares.push(NetShare::new(ip, host, &share, &unescape_dec(name), kind));
            }
            _ => {}
        }
    }
    (hosts, shares)
}

/// Expands `nmap_networks` into scan targets.
///
/// `auto` scans the /24 of every IPv4 interface. The token
/// `ipv6-link-local` requests an IPv6 multicast sweep, which is also used
/// when no other target is left.
pub fn nmap_targets(networks: &str, interfaces: &[NetInterface]) -> (Vec<String>, bool) {
    let mut targets = Vec::new();
    let mut ipv6 = false;
    if networks.is_empty() || networks == "auto" {
        for iface in interfaces {
            match iface.ip {
                IpAddr::V4(ip) => targets.push(format!("{ip}/24")),
                IpAddr::V6(_) => ipv6 = true,
            }
        }
    } else {
        for token in networks.split_whitespace() {
            if token == "ipv6-link-local" {
                ipv6 = true;
            } else {
                targets.push(token.to_string());
            }
        }
    }
    let ipv6 = ipv6 || targets.is_empty();
    (targets, ipv6)
}

/// nmap command lines for the targets, IPv4 first.
pub fn nmap_commands(settings: &Settings, targets: &[String], ipv6: bool) -> Vec<Vec<String>> {
    let base: Vec<String> = [
        settings.bin("nmap").as_str(),
        "--datadir",
        NMAP_DATADIR,
        "-p",
        NMAP_PORTS,
        "--open",
        "-oG",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let mut commands = Vec::new();
    if !targets.is_empty() {
        let mut argv = base.clone();
        argv.extend(targets.iter().cloned());
        commands.push(argv);
    }
    if ipv6 {
        let mut argv = base;
        argv.extend(
            [
                "-6",
                "--script-args",
                "newtargets",
                "--script",
                "targets-ipv6-multicast-mld,targets-ipv6-multicast-echo",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        commands.push(argv);
    }
    commands
}

/// Parses nmap grepable (`-oG`) host lines that list ports.
pub fn parse_nmap_grepable(output: &str) -> Vec<NmapEntry> {
    let mut hosts = Vec::new();
    for line in output.lines() {
        let Some(rest) = line.strip_prefix("Host:") else {
            continue;
        };
        let Some((head, ports)) = rest.split_once("Ports:") else {
            continue;
        };
        let head = head.trim();
        let Some((ip, name)) = head.split_once(char::is_whitespace) else {
            continue;
        };
        let host = name
            .trim()
            .strip_prefix('(')
            .and_then(|n| n.split_once(')'))
            .map_or("", |(n, _)| n);

        let mut entry = NmapEntry {
            ip: ip.to_string(),
            host: host.to_string(),
            ..NmapEntry::default()
        };
        for port in ports.split(',') {
            let mut parts = port.trim().split('/');
            let (Some(number), Some("open")) = (parts.next(), parts.next()) else {
                continue;
            };
            match number {
                "445" => entry.smb = true,
                "111" => entry.rpc = true,
                "2049" => entry.nfs = true,
                _ => {}
            }
        }
        hosts.push(entry);
    }
    hosts
}

/// Parses `smbclient -g` disk shares into `(name, comment)`.
pub fn parse_smbclient(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("Disk|"))
        .filter_map(|rest| rest.split_once('|'))
        .map(|(name, comment)| (name.trim().to_string(), comment.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

/// Parses `showmount -e --no-headers` into export paths.
pub fn parse_showmount(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim_end().rsplit_once(char::is_whitespace))
        .map(|(path, _)| path.trim_end().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

fn avahi_discover(
    ctx: &ExecutionContext,
    settings: &Settings,
    hosts: &mut Vec<NmapEntry>,
    shares: &mut Vec<NetShare>,
) {
    if !ctx.is_unprivileged() {
        let argv = vec![
            settings.bin("systemctl"),
            "start".to_string(),
            "avahi-daemon".to_string(),
        ];
        if let Err(e) = ctx.run(&argv) {
            tracing::debug!(error = %e, "could not start avahi-daemon");
        }
    }
    ctx.log.info("Avahi-Browse: ...");
    let argv = vec![settings.bin("avahi-browse"), "-artkp".to_string()];
    match ctx.run_checked(&argv) {
        Ok(output) => {
            let (found_hosts, found_shares) = parse_avahi(&output);
            hosts.extend(found_hosts);
            shares.extend(found_shares);
        }
        Err(_) => ctx.log.info("Make sure avahi daemon is running."),
    }
}

fn wsd_discover(
    ctx: &ExecutionContext,
    interfaces: &[NetInterface],
    resolver: &dyn Resolver,
    hosts: &mut Vec<NmapEntry>,
) {
    let Ok(devices) = wsd::probe(interfaces, &ProbeSchedule::default(), None, ctx.log) else {
        return;
    };
    for dev in devices {
        let host = dev
            .ip
            .parse()
            .ok()
            .and_then(|ip| resolver.reverse(ip))
            .unwrap_or_default();
        hosts.push(NmapEntry {
            ip: dev.ip,
            host,
            smb: true,
            ..NmapEntry::default()
        });
    }
}

fn nmap_discover(
    ctx: &ExecutionContext,
    settings: &Settings,
    interfaces: &[NetInterface],
    hosts: &mut Vec<NmapEntry>,
) {
    let (targets, ipv6) = nmap_targets(&settings.nmap_networks, interfaces);
    for argv in nmap_commands(settings, &targets, ipv6) {
        ctx.log.info(&format!("Executing: {}", argv.join(" ")));
        if let Ok(output) = ctx.run_checked(&argv) {
            hosts.extend(parse_nmap_grepable(&output));
        }
    }
}

fn scan_shares(
    ctx: &ExecutionContext,
    settings: &Settings,
    tools: ScanTools,
    target: &NmapEntry,
    shares: &mut Vec<NetShare>,
) {
    if tools.smbclient && target.smb {
        let argv = vec![settings.bin("smbclient"), "-NqgL".to_string(), target.ip.clone()];
        if let Ok(output) = ctx.run_checked(&argv) {
            for (name, comment) in parse_smbclient(&output) {
                shares.push(NetShare::new(&target.ip, &target.host, &name, &comment, ShareKind::Smb));
            }
        }
    }

    if target.nfs && !target.rpc {
        shares.push(NetShare::new(&target.ip, &target.host, "/", "", ShareKind::Nfs4));
        return;
    }
    if !tools.showmount || !target.nfs {
        return;
    }
    let argv = vec![
        settings.bin("showmount"),
        "-e".to_string(),
        "--no-headers".to_string(),
        target.ip.clone(),
    ];
    if let Ok(output) = ctx.run_checked(&argv) {
        for export in parse_showmount(&output) {
            shares.push(NetShare::new(&target.ip, &target.host, &export, "", ShareKind::Nfs));
        }
    }
}

/// Runs every enabled discovery channel and returns one record per share.
pub fn network_scan(
    ctx: &ExecutionContext,
    settings: &Settings,
    tools: ScanTools,
    interfaces: &[NetInterface],
    resolver: &dyn Resolver,
) -> Vec<DeviceRecord> {
    if !tools.smbclient {
        ctx.log
            .info("Smbclient was not found. Smbclient is required for finding SMB shares.");
    }
    if !tools.showmount && tools.nmap && settings.use_nmap {
        ctx.log.info(
            "Showmount was not found. Showmount (nfs-utils) is required for finding NFSv3 shares with nmap.",
        );
    }
    if interfaces.is_empty() {
        ctx.log.info("No network interfaces were detected.");
        if settings.use_wsd {
            ctx.log.info("Skipping WS-Discovery.");
        }
        if tools.nmap && settings.use_nmap {
            ctx.log
                .info("Switching to IPv6 link-local scanning as fallback for nmap.");
        }
    }

    let mut hosts = Vec::new();
    let mut shares = Vec::new();
    if tools.avahi && settings.use_avahi {
        avahi_discover(ctx, settings, &mut hosts, &mut shares);
    }
    if !interfaces.is_empty() && settings.use_wsd {
        wsd_discover(ctx, interfaces, resolver, &mut hosts);
    }
    if tools.nmap && settings.use_nmap {
        nmap_discover(ctx, settings, interfaces, &mut hosts);
    }

    collapse_nmap_list(&mut hosts);
    for target in &hosts {
        scan_shares(ctx, settings, tools, target, &mut shares);
    }
    collapse_share_list(&mut shares, interfaces, &local_hostname(settings));
    ctx.log.success("Network scan completed.");
    shares_to_records(shares)
}
