//! Collaborator seams consumed by the engine, with in-process defaults.
//!
//! | Trait | Default |
//! |-------|---------|
//! | [`TokenStore`] | [`MemoryTokenStore`] |
//! | [`InterfacePool`] | [`SequentialInterfacePool`] |
//! | [`PortPool`] | [`LocalPortPool`] |
//! | [`TapPool`] | [`StaticTapPool`] |
//! | [`BundleRenderer`] | [`PassthroughRenderer`] |
//! | [`SystemProfileStore`] | [`MemorySystemProfiles`] |
//! | [`Platform`] | [`HostPlatform`] |

use crate::profile::device::rand_str_complex;
use crate::profile::exec;
use crate::profile::types::*;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Auth tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct TokenState {
    token: String,
    valid: bool,
    issued: i64,
}

/// Cached auth token presented to the gateway on every handshake.
#[derive(Debug)]
pub struct AuthToken {
    ttl: u64,
    state: Mutex<TokenState>,
}

impl AuthToken {
    pub fn new(ttl: u64) -> Self {
        Self {
            ttl,
            state: Mutex::new(TokenState {
                token: rand_str_complex(16),
                valid: false,
                issued: unix_now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Token to present, regenerated when it expired or was never accepted.
    pub fn refresh(&self) -> String {
        let mut st = self.lock();
        let expired = self.ttl > 0 && unix_now() - st.issued > self.ttl as i64;
        if !st.valid || expired {
            st.token = rand_str_complex(16);
            st.issued = unix_now();
            st.valid = false;
        }
        st.token.clone()
    }

    pub fn current(&self) -> String {
        self.lock().token.clone()
    }

    /// Record that the gateway accepted the token.
    pub fn mark_valid(&self) {
        self.lock().valid = true;
    }

    /// Discard the token after an authentication failure.
    pub fn invalidate(&self) {
        let mut st = self.lock();
        st.token = rand_str_complex(16);
        st.issued = unix_now();
        st.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.lock().valid
    }
}

/// Token cache keyed by profile and gateway keys.
pub trait TokenStore: Send + Sync {
    fn get(
        &self,
        profile_id: &str,
        server_public_key: &str,
        server_box_public_key: &str,
        ttl: u64,
    ) -> Arc<AuthToken>;
}

/// Process-local token cache.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<(String, String, String), Arc<AuthToken>>>,
}

impl TokenStore for MemoryTokenStore {
    fn get(
        &self,
        profile_id: &str,
        server_public_key: &str,
        server_box_public_key: &str,
        ttl: u64,
    ) -> Arc<AuthToken> {
        let key = (
            profile_id.to_string(),
            server_public_key.to_string(),
            server_box_public_key.to_string(),
        );
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(key)
            .or_insert_with(|| Arc::new(AuthToken::new(ttl)))
            .clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Resource pools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tunnel interface names.
pub trait InterfacePool: Send + Sync {
    fn acquire(&self) -> Result<String, ProfileError>;
    fn release(&self, iface: &str);
}

/// Hands out `<prefix><n>` names.
pub struct SequentialInterfacePool {
    prefix: String,
    size: usize,
    used: Mutex<HashSet<usize>>,
}

impl SequentialInterfacePool {
    pub fn new(prefix: impl Into<String>, size: usize) -> Self {
        Self {
            prefix: prefix.into(),
            size,
            used: Mutex::new(HashSet::new()),
        }
    }
}

impl InterfacePool for SequentialInterfacePool {
    fn acquire(&self) -> Result<String, ProfileError> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let n = (0..self.size)
            .find(|n| !used.contains(n))
            .ok_or_else(|| ProfileError::read("No tunnel interface available"))?;
        used.insert(n);
        Ok(format!("{}{}", self.prefix, n))
    }

    fn release(&self, iface: &str) {
        if let Some(n) = iface
            .strip_prefix(self.prefix.as_str())
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.used.lock().unwrap_or_else(|e| e.into_inner()).remove(&n);
        }
    }
}

/// Local management ports.
pub trait PortPool: Send + Sync {
    fn acquire(&self) -> Result<u16, ProfileError>;
    fn release(&self, port: u16);
}

/// Lets the OS pick a free loopback port.
#[derive(Default)]
pub struct LocalPortPool {
    used: Mutex<HashSet<u16>>,
}

impl PortPool for LocalPortPool {
    fn acquire(&self) -> Result<u16, ProfileError> {
        for _ in 0..8 {
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
                .map_err(|e| ProfileError::read("Failed to reserve port").with_detail(e.to_string()))?;
            let port = listener
                .local_addr()
                .map_err(|e| ProfileError::read("Failed to reserve port").with_detail(e.to_string()))?
                .port();
            let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
            if used.insert(port) {
                return Ok(port);
            }
        }
        Err(ProfileError::read("No management port available"))
    }

    fn release(&self, port: u16) {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).remove(&port);
    }
}

/// Windows tap adapters.
pub trait TapPool: Send + Sync {
    fn acquire(&self) -> Result<String, ProfileError>;
    fn release(&self, tap: &str);
    /// Ensure at least `count` adapters exist.
    fn resize(&self, count: usize) -> Result<(), ProfileError>;
}

/// Fixed set of pre-installed adapters.
pub struct StaticTapPool {
    adapters: Vec<String>,
    used: Mutex<HashSet<String>>,
}

impl StaticTapPool {
    pub fn new(adapters: Vec<String>) -> Self {
        Self {
            adapters,
            used: Mutex::new(HashSet::new()),
        }
    }
}

impl TapPool for StaticTapPool {
    fn acquire(&self) -> Result<String, ProfileError> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let tap = self
            .adapters
            .iter()
            .find(|a| !used.contains(*a))
            .cloned()
            .ok_or_else(|| ProfileError::read("No tap adapter available"))?;
        used.insert(tap.clone());
        Ok(tap)
    }

    fn release(&self, tap: &str) {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).remove(tap);
    }

    fn resize(&self, count: usize) -> Result<(), ProfileError> {
        if count > self.adapters.len() {
            log::warn!(
                "{} tap adapters requested, {} installed",
                count,
                self.adapters.len()
            );
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Bundle rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turns a profile bundle into backend configuration text.
pub trait BundleRenderer: Send + Sync {
    fn render(&self, data: &str, fixed_remote: &str, fixed_remote6: &str) -> Result<String, ProfileError>;
}

/// Copies the bundle, pointing `remote` lines at the fixed remote when given.
#[derive(Default)]
pub struct PassthroughRenderer;

impl BundleRenderer for PassthroughRenderer {
    fn render(&self, data: &str, fixed_remote: &str, fixed_remote6: &str) -> Result<String, ProfileError> {
        if fixed_remote.is_empty() && fixed_remote6.is_empty() {
            return Ok(data.to_string());
        }

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for line in data.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.first() != Some(&"remote") || fields.len() < 2 {
                out.push(line.to_string());
                continue;
            }
            let tail = fields[2..].join(" ");
            for host in [fixed_remote, fixed_remote6] {
                if host.is_empty() {
                    continue;
                }
                let rendered = if tail.is_empty() {
                    format!("remote {}", host)
                } else {
                    format!("remote {} {}", host, tail)
                };
                if seen.insert(rendered.clone()) {
                    out.push(rendered);
                }
            }
        }

        let mut text = out.join("\n");
        if data.ends_with('\n') {
            text.push('\n');
        }
        Ok(text)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  System profiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistent profiles that outlive a single connection.
#[async_trait]
pub trait SystemProfileStore: Send + Sync {
    /// Pull the latest profile definition before connecting.
    async fn sync(&self, id: &str) -> Result<(), ProfileError>;
    fn auth_error_count(&self, id: &str) -> u32;
    fn set_auth_error_count(&self, id: &str, count: u32);
    /// Disable automatic connection of the profile.
    async fn deactivate(&self, id: &str) -> Result<(), ProfileError>;
    /// Append a backend output line to the profile log.
    fn push_output(&self, id: &str, line: &str);
}

/// Snapshot of an in-memory system profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemProfileRecord {
    pub auth_errors: u32,
    pub deactivated: bool,
    pub syncs: u32,
    pub log: VecDeque<String>,
}

const SYSTEM_LOG_LIMIT: usize = 10_000;

/// In-memory system profile store.
#[derive(Default)]
pub struct MemorySystemProfiles {
    records: Mutex<HashMap<String, SystemProfileRecord>>,
}

impl MemorySystemProfiles {
    pub fn record(&self, id: &str) -> Option<SystemProfileRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn with<R>(&self, id: &str, f: impl FnOnce(&mut SystemProfileRecord) -> R) -> R {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        f(records.entry(id.to_string()).or_default())
    }
}

#[async_trait]
impl SystemProfileStore for MemorySystemProfiles {
    async fn sync(&self, id: &str) -> Result<(), ProfileError> {
        self.with(id, |r| r.syncs += 1);
        Ok(())
    }

    fn auth_error_count(&self, id: &str) -> u32 {
        self.with(id, |r| r.auth_errors)
    }

    fn set_auth_error_count(&self, id: &str, count: u32) {
        self.with(id, |r| r.auth_errors = count);
    }

    async fn deactivate(&self, id: &str) -> Result<(), ProfileError> {
        log::warn!("[{}] Deactivating system profile", id);
        self.with(id, |r| r.deactivated = true);
        Ok(())
    }

    fn push_output(&self, id: &str, line: &str) {
        self.with(id, |r| {
            r.log.push_back(line.to_string());
            while r.log.len() > SYSTEM_LOG_LIMIT {
                r.log.pop_front();
            }
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Platform hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Host DNS and network-state hooks.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn clear_dns_cache(&self) -> Result<(), ProfileError>;
    /// Remove tunnel keys from the macOS dynamic store.
    async fn clear_scutil_keys(&self) -> Result<(), ProfileError>;
    /// Restore the macOS resolver after a backend exits.
    async fn restore_scutil_dns(&self) -> Result<(), ProfileError>;
    /// Primary and all hardware addresses.
    fn mac_addresses(&self) -> (String, Vec<String>);
    /// Whether `/etc/resolv.conf` is managed by systemd-resolved.
    fn uses_systemd_resolved(&self) -> bool;
}

const SCUTIL_KEY_ROOT: &str = "State:/Network/SorngProfile";

/// Platform hooks backed by the local OS tools.
#[derive(Default)]
pub struct HostPlatform;

#[async_trait]
impl Platform for HostPlatform {
    async fn clear_dns_cache(&self) -> Result<(), ProfileError> {
        #[cfg(target_os = "windows")]
        exec::run_logged(&[], "ipconfig", &["/flushdns"]).await?;

        #[cfg(target_os = "linux")]
        exec::run_logged(&[], "resolvectl", &["flush-caches"]).await?;

        #[cfg(target_os = "macos")]
        {
            exec::run_logged(&[], "dscacheutil", &["-flushcache"]).await?;
            exec::run_logged(&[], "killall", &["-HUP", "mDNSResponder"]).await?;
        }

        Ok(())
    }

    async fn clear_scutil_keys(&self) -> Result<(), ProfileError> {
        if !cfg!(target_os = "macos") {
            return Ok(());
        }
        let input = format!(
            "remove {root}/DNS\nremove {root}/Restore\nquit\n",
            root = SCUTIL_KEY_ROOT
        );
        exec::run_with_input("scutil", &[] as &[&str], &input).await?;
        Ok(())
    }

    async fn restore_scutil_dns(&self) -> Result<(), ProfileError> {
        if !cfg!(target_os = "macos") {
            return Ok(());
        }
        self.clear_scutil_keys().await?;
        self.clear_dns_cache().await
    }

    fn mac_addresses(&self) -> (String, Vec<String>) {
        let mut addrs = Vec::new();
        if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
            for entry in entries.flatten() {
                if entry.file_name() == "lo" {
                    continue;
                }
                if let Ok(addr) = std::fs::read_to_string(entry.path().join("address")) {
                    let addr = addr.trim().to_string();
                    if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                        addrs.push(addr);
                    }
                }
            }
        }
        addrs.sort();
        addrs.dedup();
        let primary = addrs.first().cloned().unwrap_or_default();
        (primary, addrs)
    }

    fn uses_systemd_resolved(&self) -> bool {
        std::fs::read_to_string("/etc/resolv.conf")
            .map(|s| resolv_conf_is_resolved(&s))
            .unwrap_or(false)
    }
}

/// Whether resolv.conf text points at systemd-resolved.
pub fn resolv_conf_is_resolved(text: &str) -> bool {
    text.contains("systemd-resolved") || text.contains("127.0.0.53")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    // ── Tokens ───────────────────────────────────────────────────

    #[test]
    fn token_store_returns_same_token_per_key() {
        let store = MemoryTokenStore::default();
        let a = store.get("p", "rsa", "box", 0);
        let b = store.get("p", "rsa", "box", 0);
        assert!(Arc::ptr_eq(&a, &b));
        let c = store.get("p", "rsa2", "box", 0);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn valid_token_survives_refresh() {
        let t = AuthToken::new(0);
        let first = t.refresh();
        t.mark_valid();
        assert_eq!(t.refresh(), first);
        t.invalidate();
        assert!(!t.is_valid());
        assert_ne!(t.current(), first);
    }

    // ── Pools ────────────────────────────────────────────────────

    #[test]
    fn interface_pool_reuses_released_names() {
        let pool = SequentialInterfacePool::new("tun", 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a, "tun0");
        assert_eq!(b, "tun1");
        assert!(pool.acquire().is_err());
        pool.release("tun0");
        assert_eq!(pool.acquire().unwrap(), "tun0");
    }

    #[test]
    fn port_pool_hands_out_distinct_ports() {
        let pool = LocalPortPool::default();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        pool.release(a);
    }

    #[test]
    fn tap_pool_exhaustion() {
        let pool = StaticTapPool::new(vec!["tap0".into()]);
        assert_eq!(pool.acquire().unwrap(), "tap0");
        assert!(pool.acquire().is_err());
        pool.release("tap0");
        assert!(pool.acquire().is_ok());
        assert!(pool.resize(4).is_ok());
    }

    // ── Renderer ─────────────────────────────────────────────────

    #[test]
    fn renderer_passthrough_without_fixed_remote() {
        let data = "client\nremote a.example.com 1194 udp\n";
        assert_eq!(PassthroughRenderer.render(data, "", "").unwrap(), data);
    }

    #[test]
    fn renderer_rewrites_remotes() {
        let data = "client\nremote a.example.com 1194 udp\nremote b.example.com 1194 udp\n";
        let out = PassthroughRenderer.render(data, "10.0.0.1", "").unwrap();
        assert_eq!(out, "client\nremote 10.0.0.1 1194 udp\n");
    }

    // ── System profiles ──────────────────────────────────────────

    #[tokio::test]
    async fn system_profile_counters() {
        let store = MemorySystemProfiles::default();
        store.sync("sp").await.unwrap();
        assert_eq!(store.auth_error_count("sp"), 0);
        store.set_auth_error_count("sp", 3);
        store.push_output("sp", "line");
        store.deactivate("sp").await.unwrap();
        let rec = store.record("sp").unwrap();
        assert_eq!(rec.auth_errors, 3);
        assert_eq!(rec.syncs, 1);
        assert!(rec.deactivated);
        assert_eq!(rec.log.back().map(String::as_str), Some("line"));
    }

    // ── Platform ─────────────────────────────────────────────────

    #[test]
    fn resolv_conf_detection() {
        assert!(resolv_conf_is_resolved("# This is /run/systemd/resolve/stub-resolv.conf managed by man:systemd-resolved(8)"));
        assert!(resolv_conf_is_resolved("nameserver 127.0.0.53\n"));
        assert!(!resolv_conf_is_resolved("nameserver 1.1.1.1\n"));
    }
}
