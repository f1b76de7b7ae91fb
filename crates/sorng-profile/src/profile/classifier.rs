//! Backend log classification.
//!
//! Each output line is matched against an ordered pattern table; the first
//! matching entry decides the signal. Address extraction never panics on
//! malformed lines, it reports a parse error instead.

use crate::profile::types::ProfileError;
use lazy_static::lazy_static;
use regex::Regex;

/// Bumped whenever entries are added, removed or reordered.
pub const PATTERN_TABLE_VERSION: u32 = 1;

lazy_static! {
    static ref IPV4: Option<Regex> = Regex::new(
        r"(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)(\.(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)){3}"
    )
    .ok();
}

/// What a backend log line means for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSignal {
    /// Tunnel is up.
    Connected,
    /// The backend gave up after `--inactive`; do not reconnect.
    InactiveStop,
    /// Transport lost; restart from a copy.
    Restart,
    /// The OS rejected the tunnel address; restart every profile.
    AddressUnavailable,
    /// `AUTH_FAILED` from the server.
    AuthFailed,
    /// `auth-failure` reported by a plugin or script.
    AuthFailure,
    ServerAddr(String),
    ClientAddr(String),
}

type Extract = fn(&str) -> Result<Option<LogSignal>, ProfileError>;

struct Pattern {
    matches: fn(&str) -> bool,
    extract: Extract,
}

const PATTERNS: &[Pattern] = &[
    Pattern {
        matches: |l| l.contains("Initialization Sequence Completed"),
        extract: |_| Ok(Some(LogSignal::Connected)),
    },
    Pattern {
        matches: |l| l.contains("Inactivity timeout (--inactive)"),
        extract: |_| Ok(Some(LogSignal::InactiveStop)),
    },
    Pattern {
        matches: |l| l.contains("Inactivity timeout") || l.contains("Connection reset"),
        extract: |_| Ok(Some(LogSignal::Restart)),
    },
    Pattern {
        matches: |l| l.contains("Can't assign requested address (code=49)"),
        extract: |_| Ok(Some(LogSignal::AddressUnavailable)),
    },
    Pattern {
        matches: |l| l.contains("AUTH_FAILED"),
        extract: |_| Ok(Some(LogSignal::AuthFailed)),
    },
    Pattern {
        matches: |l| l.contains("auth-failure"),
        extract: |_| Ok(Some(LogSignal::AuthFailure)),
    },
    Pattern {
        matches: |l| l.contains("link remote:"),
        extract: link_remote,
    },
    Pattern {
        matches: |l| l.contains("network/local/netmask"),
        extract: network_local_netmask,
    },
    Pattern {
        matches: |l| l.contains("ifconfig") && l.contains("netmask"),
        extract: ifconfig_netmask,
    },
    Pattern {
        matches: |l| l.contains("ip addr add dev"),
        extract: ip_addr_add,
    },
    Pattern {
        matches: |l| l.contains("net_addr_v4_add:"),
        extract: net_addr_v4_add,
    },
];

/// Classify one backend output line.
pub fn classify(line: &str) -> Result<Option<LogSignal>, ProfileError> {
    match PATTERNS.iter().find(|p| (p.matches)(line)) {
        Some(p) => (p.extract)(line),
        None => Ok(None),
    }
}

fn malformed(line: &str) -> ProfileError {
    ProfileError::parse("Malformed backend address line").with_detail(line.to_string())
}

fn first_ipv4(text: &str) -> Result<Option<String>, ProfileError> {
    let re = IPV4
        .as_ref()
        .ok_or_else(|| ProfileError::parse("Address pattern unavailable"))?;
    Ok(re.find(text).map(|m| m.as_str().to_string()))
}

fn client(addr: Option<String>) -> Option<LogSignal> {
    addr.filter(|a| !a.is_empty()).map(LogSignal::ClientAddr)
}

/// `UDP link remote: [AF_INET]203.0.113.7:1194`
fn link_remote(line: &str) -> Result<Option<LogSignal>, ProfileError> {
    let start = line.rfind(']').map(|i| i + 1).unwrap_or(0);
    let end = line.rfind(':').ok_or_else(|| malformed(line))?;
    let addr = line.get(start..end).ok_or_else(|| malformed(line))?;
    Ok(Some(LogSignal::ServerAddr(addr.to_string())))
}

/// `... network/local/netmask = 10.8.0.0/10.8.0.6/255.255.255.0 [SUCCEEDED]`
fn network_local_netmask(line: &str) -> Result<Option<LogSignal>, ProfileError> {
    let end = line.rfind('/').ok_or_else(|| malformed(line))?;
    let head = &line[..end];
    let start = head.rfind('/').map(|i| i + 1).ok_or_else(|| malformed(line))?;
    Ok(client(Some(head[start..].to_string())))
}

/// `/sbin/ifconfig utun1 10.8.0.6 10.8.0.5 netmask 255.255.255.255 ...`
fn ifconfig_netmask(line: &str) -> Result<Option<LogSignal>, ProfileError> {
    let start = line.find("ifconfig").map(|i| i + 9).ok_or_else(|| malformed(line))?;
    let end = line.find("netmask").ok_or_else(|| malformed(line))?;
    let span = line.get(start..end).ok_or_else(|| malformed(line))?;
    let fields: Vec<&str> = span.split(' ').collect();
    if fields.len() > 2 {
        Ok(client(Some(fields[1].to_string())))
    } else {
        Ok(None)
    }
}

/// `/sbin/ip addr add dev tun0 10.8.0.6/24 broadcast 10.8.0.255`
fn ip_addr_add(line: &str) -> Result<Option<LogSignal>, ProfileError> {
    let Some(end) = line.find("broadcast") else {
        return Ok(client(first_ipv4(line)?));
    };
    let start = line
        .find("ip addr add dev")
        .map(|i| i + 16)
        .ok_or_else(|| malformed(line))?;
    let span = line.get(start..end).ok_or_else(|| malformed(line))?;
    let fields: Vec<&str> = span.split(' ').collect();
    let addr = fields.get(1).and_then(|f| {
        let parts: Vec<&str> = f.split('/').collect();
        (parts.len() > 1).then(|| parts[0].to_string())
    });
    Ok(client(addr))
}

/// `net_addr_v4_add: 10.8.0.6/24 dev tun0`
fn net_addr_v4_add(line: &str) -> Result<Option<LogSignal>, ProfileError> {
    let start = line
        .find("net_addr_v4_add:")
        .map(|i| i + 16)
        .ok_or_else(|| malformed(line))?;
    Ok(client(first_ipv4(line[start..].trim())?))
}
