//! Shared types, enums, error types, and wire payloads for the profile engine.

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runtime status of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl Default for ProfileStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ProfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Which tunnel backend a profile drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileMode {
    /// External OpenVPN-style process supervised through its log stream.
    #[serde(rename = "ovpn")]
    ProcessBackend,
    /// WireGuard-style configuration applied directly to the OS.
    #[serde(rename = "wg")]
    ConfigBackend,
}

impl Default for ProfileMode {
    fn default() -> Self {
        Self::ProcessBackend
    }
}

impl ProfileMode {
    /// Path segment used by the gateway key API.
    pub fn key_path_segment(&self) -> &'static str {
        match self {
            Self::ProcessBackend => "ovpn",
            Self::ConfigBackend => "wg",
        }
    }
}

impl fmt::Display for ProfileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_path_segment())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Negotiated tunnel configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A route pushed by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub next_hop: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub metric: u32,
    /// Route uses the default gateway and must not be installed on the tunnel.
    #[serde(default)]
    pub net_gateway: bool,
}

/// Full tunnel configuration returned by a config-mode handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WgConf {
    pub address: String,
    pub address6: String,
    pub hostname: String,
    pub hostname6: String,
    pub gateway: String,
    pub gateway6: String,
    pub port: u16,
    pub web_port: u16,
    pub web_no_ssl: bool,
    pub public_key: String,
    pub routes: Vec<Route>,
    pub routes6: Vec<Route>,
    pub dns_servers: Vec<String>,
    pub search_domains: Vec<String>,
}

impl WgConf {
    /// Every v4 and v6 route network, in order.
    pub fn allowed_ips(&self) -> Vec<String> {
        self.routes
            .iter()
            .chain(self.routes6.iter())
            .map(|r| r.network.clone())
            .collect()
    }

    /// `host:port` of the peer endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Decrypted process-mode handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvpnData {
    pub allow: bool,
    pub reason: String,
    /// Firewall token to present instead of the password.
    pub token: String,
    pub remote: String,
    pub remote6: String,
}

/// Decrypted config-mode handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WgData {
    pub allow: bool,
    pub reason: String,
    pub configuration: Option<WgConf>,
}

/// Decrypted keepalive response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WgPingData {
    pub status: bool,
    pub timestamp: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Wire envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Request envelope posted to the gateway key API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyReq {
    pub data: String,
    pub nonce: String,
    pub public_key: String,
    pub signature: String,
}

/// Response envelope returned by the gateway key API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResp {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub signature: String,
}

/// Device descriptor sealed inside a [`KeyReq`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBox {
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    pub mac_addr: String,
    pub mac_addrs: Vec<String>,
    pub token: String,
    pub nonce: String,
    pub password: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wg_public_key: Option<String>,
    pub public_address: String,
    pub public_address6: String,
}

/// Payload encrypted with the gateway RSA key for the auth file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    pub token: String,
    pub password: String,
    pub nonce: String,
    pub timestamp: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Externally visible view of a profile, carried by events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub id: String,
    pub mode: ProfileMode,
    pub iface: String,
    pub tun_iface: String,
    pub routes: Vec<Route>,
    pub routes6: Vec<Route>,
    pub reconnect: bool,
    pub status: ProfileStatus,
    pub timestamp: i64,
    pub gateway_addr: String,
    pub gateway_addr6: String,
    pub server_addr: String,
    pub client_addr: String,
    pub mac_addr: String,
    pub mac_addrs: Vec<String>,
    pub web_port: u16,
    pub web_no_ssl: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Crate-level error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileErrorKind {
    /// Input, I/O, or resource acquisition failure.
    Read,
    /// Decode, deserialize, signature, or decrypt failure.
    Parse,
    /// Artifact persistence failure.
    Write,
    /// Transport or HTTP status failure.
    Request,
    /// Process spawn, pipe, or command failure.
    Exec,
    /// Invalid engine or profile configuration.
    Config,
}

/// Crate-level error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileError {
    pub kind: ProfileErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(d) = &self.detail {
            write!(f, " ({})", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProfileError {}

impl ProfileError {
    pub fn new(kind: ProfileErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn read(msg: impl Into<String>) -> Self {
        Self::new(ProfileErrorKind::Read, msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(ProfileErrorKind::Parse, msg)
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::new(ProfileErrorKind::Write, msg)
    }

    pub fn request(msg: impl Into<String>) -> Self {
        Self::new(ProfileErrorKind::Request, msg)
    }

    pub fn exec(msg: impl Into<String>) -> Self {
        Self::new(ProfileErrorKind::Exec, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ProfileErrorKind::Config, msg)
    }
}

impl From<ProfileError> for String {
    fn from(e: ProfileError) -> String {
        e.to_string()
    }
}

/// Unix timestamp in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Short platform tag reported to the gateway.
pub fn platform_tag() -> &'static str {
    if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "unknown"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
