//! WS-Discovery probing.
//!
//! Windows hosts and Samba servers running `wsdd` answer a multicast
//! `Probe` with a unicast `ProbeMatch`. Each interface gets its own socket
//! and thread; responders are collected once per source address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::log::LogSink;
use crate::net::NetInterface;

pub const WSD_PORT: u16 = 3702;
pub const WSD_GROUP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const WSD_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// How often and how long to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSchedule {
    /// Listening time after each probe.
    pub wait: Duration,
    /// Total number of probes sent.
    pub probes: usize,
    /// Probes sent with the same message id.
    pub repeats: usize,
}

impl Default for ProbeSchedule {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(1000),
            probes: 4,
            repeats: 2,
        }
    }
}

/// A device that answered a probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsdDevice {
    pub ip: String,
    pub uuid: String,
    pub xaddr: String,
    pub types: String,
}

/// A random version 4 UUID.
pub fn new_message_id() -> String {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

pub fn probe_xml(message_id: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope""#,
            r#" xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing""#,
            r#" xmlns:wsd="http://schemas.xmlsoap.org/ws/2005/04/discovery""#,
            r#" xmlns:wsdp="http://schemas.xmlsoap.org/ws/2006/02/devprof">"#,
            "<soap:Header><wsa:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</wsa:To>",
            "<wsa:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</wsa:Action>",
            "<wsa:MessageID>urn:uuid:{}</wsa:MessageID></soap:Header>",
            "<soap:Body><wsd:Probe><wsd:Types>wsdp:Device</wsd:Types></wsd:Probe>",
            "</soap:Body></soap:Envelope>"
        ),
        message_id
    )
}

/// Text content of the first `<ns:name ...>` element.
fn element_text<'a>(data: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!(":{name}");
    let mut from = 0;
    while let Some(pos) = data[from..].find(&needle) {
        let start = from + pos;
        let end = start + needle.len();
        from = end;

        let Some(open) = data[..start].rfind('<') else {
            continue;
        };
        let prefix_ok = data[open + 1..start]
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_');
        let name_ends = data[end..].starts_with(|c: char| c == '>' || c.is_whitespace());
        if !prefix_ok || !name_ends {
            continue;
        }
        let body = &data[end..];
        let body = &body[body.find('>')? + 1..];
        return Some(&body[..body.find('<').unwrap_or(body.len())]);
    }
    None
}

/// Extracts endpoint id, transport address and device types from a `ProbeMatch`.
pub fn parse_response(ip: &str, data: &str) -> WsdDevice {
    let uuid = element_text(data, "Address")
        .and_then(|text| text.split_once("urn:uuid:"))
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .unwrap_or_default();
    let xaddr = element_text(data, "XAddrs")
        .and_then(|text| text.split_whitespace().next())
        .unwrap_or_default();
    let types: Vec<&str> = element_text(data, "Types")
        .unwrap_or_default()
        .split_whitespace()
        .filter_map(|token| token.split_once(':').map(|(_, t)| t))
        .filter(|t| !t.starts_with("Device"))
        .collect();

    WsdDevice {
        ip: ip.to_string(),
        uuid: uuid.to_string(),
        xaddr: xaddr.to_string(),
        types: if types.is_empty() {
            "Device".to_string()
        } else {
            types.join(" ")
        },
    }
}

fn wsd_error(iface: &NetInterface, e: std::io::Error) -> Error {
    Error::Discovery {
        channel: "wsd",
        message: format!("{}: {e}", iface.name),
    }
}

struct ProbeSocket {
    socket: UdpSocket,
    group: SocketAddr,
}

impl ProbeSocket {
    fn open(iface: &NetInterface) -> std::io::Result<Self> {
        let bind = |port| match iface.ip {
            IpAddr::V4(ip) => UdpSocket::bind((ip, port)),
            IpAddr::V6(ip) => UdpSocket::bind(SocketAddrV6::new(ip, port, 0, iface.index)),
        };
        let socket = bind(WSD_PORT).or_else(|_| bind(0))?;

        let group = match iface.ip {
            IpAddr::V4(ip) => {
                if let Err(e) = socket.join_multicast_v4(&WSD_GROUP_V4, &ip) {
                    tracing::debug!(iface = %iface.name, error = %e, "multicast join failed");
                }
                socket.set_multicast_ttl_v4(1)?;
                SocketAddr::from((WSD_GROUP_V4, WSD_PORT))
            }
            IpAddr::V6(_) => {
                if let Err(e) = socket.join_multicast_v6(&WSD_GROUP_V6, iface.index) {
                    tracing::debug!(iface = %iface.name, error = %e, "multicast join failed");
                }
                SocketAddr::V6(SocketAddrV6::new(WSD_GROUP_V6, WSD_PORT, 0, iface.index))
            }
        };
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(Self { socket, group })
    }
}

struct Collector {
    found: Mutex<Vec<WsdDevice>>,
    done: AtomicBool,
    expected: Option<usize>,
}

impl Collector {
    fn offer(&self, ip: String, data: &str) {
        if !data.contains(":ProbeMatch>") {
            return;
        }
        let Ok(mut found) = self.found.lock() else {
            return;
        };
        if found.iter().any(|d| d.ip == ip) {
            return;
        }
        found.push(parse_response(&ip, data));
        if self.expected.is_some_and(|n| found.len() >= n) {
            self.done.store(true, Ordering::Relaxed);
        }
    }
}

fn probe_interface(
    iface: &NetInterface,
    schedule: &ProbeSchedule,
    collector: &Collector,
) -> Result<()> {
    let probe = ProbeSocket::open(iface).map_err(|e| wsd_error(iface, e))?;
    let mut buf = vec![0u8; 8192];
    let mut message = String::new();

    for n in 0..schedule.probes {
        if collector.done.load(Ordering::Relaxed) {
            break;
        }
        if n % schedule.repeats.max(1) == 0 {
            message = probe_xml(&new_message_id());
        }
        probe
            .socket
            .send_to(message.as_bytes(), probe.group)
            .map_err(|e| wsd_error(iface, e))?;

        let started = Instant::now();
        while started.elapsed() < schedule.wait && !collector.done.load(Ordering::Relaxed) {
            match probe.socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    let data = String::from_utf8_lossy(&buf[..len]);
                    collector.offer(src.ip().to_string(), &data);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(wsd_error(iface, e)),
            }
        }
    }
    Ok(())
}

/// Probes every interface in parallel and returns the responders.
///
/// Returns early once `expected` responders are known. Failing interfaces
/// are logged; an error is returned only when all of them fail.
pub fn probe(
    interfaces: &[NetInterface],
    schedule: &ProbeSchedule,
    expected: Option<usize>,
    log: &dyn LogSink,
) -> Result<Vec<WsdDevice>> {
    let collector = Collector {
        found: Mutex::new(Vec::new()),
        done: AtomicBool::new(false),
        expected,
    };

    log.info("WS-Discovery: Sending probes...");
    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = interfaces
            .iter()
            .map(|iface| {
                let collector = &collector;
                scope.spawn(move || probe_interface(iface, schedule, collector))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(Error::Discovery {
                        channel: "wsd",
                        message: "probe thread panicked".to_string(),
                    })
                })
            })
            .collect()
    });

    let mut last_error = None;
    let mut succeeded = 0;
    for result in results {
        match result {
            Ok(()) => succeeded += 1,
            Err(e) => {
                log.error(&e.report());
                last_error = Some(e);
            }
        }
    }
    if succeeded == 0
        && let Some(e) = last_error
    {
        return Err(e);
    }

    let found = collector
        .found
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for dev in &found {
        log.info(&format!(
            "Received response from {} (Types: {}; XAddr: {})",
            dev.ip, dev.types, dev.xaddr
        ));
    }
    Ok(found)
}
