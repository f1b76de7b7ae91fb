//! Device descriptor construction and random token helpers.

use crate::profile::types::*;
use rand::distributions::Alphanumeric;
use rand::Rng;

const COMPLEX_CHARS: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!#$%&()*+,-./:;<=>?@[]^_{|}~";

/// Random alphanumeric string.
pub fn rand_str(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random string drawn from alphanumerics and punctuation.
pub fn rand_str_complex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| COMPLEX_CHARS[rng.gen_range(0..COMPLEX_CHARS.len())] as char)
        .collect()
}

/// Host name reported to the gateway.
pub fn device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "unknown".into())
}

/// Stable per-host id derived from the machine id when one exists.
pub fn device_id() -> String {
    use sha2::{Digest, Sha256};

    let seed = ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(device_name);

    hex::encode(&Sha256::digest(seed.as_bytes())[..16])
}

/// Inputs for one descriptor.
pub struct DeviceInfo<'a> {
    /// Bundle-provided id, falling back to [`device_id`].
    pub device_id: Option<&'a str>,
    /// Bundle-provided name, falling back to [`device_name`].
    pub device_name: Option<&'a str>,
    pub token: &'a str,
    pub password: &'a str,
    pub mac_addr: &'a str,
    pub mac_addrs: &'a [String],
    pub wg_public_key: Option<&'a str>,
}

/// Build the descriptor sealed into a handshake request.
pub fn build_device_box(info: &DeviceInfo<'_>) -> DeviceBox {
    DeviceBox {
        device_id: info.device_id.map(str::to_string).unwrap_or_else(device_id),
        device_name: info.device_name.map(str::to_string).unwrap_or_else(device_name),
        platform: platform_tag().to_string(),
        mac_addr: info.mac_addr.to_string(),
        mac_addrs: info.mac_addrs.to_vec(),
        token: info.token.to_string(),
        nonce: rand_str(16),
        password: info.password.to_string(),
        timestamp: unix_now(),
        wg_public_key: info.wg_public_key.map(str::to_string),
        public_address: String::new(),
        public_address6: String::new(),
    }
}
