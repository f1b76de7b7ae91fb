//! Engine configuration, profile descriptions, and binary discovery.

use crate::profile::types::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Profile description
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identity and credentials of one configured tunnel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSpec {
    pub id: String,
    pub mode: ProfileMode,
    pub org_id: String,
    pub user_id: String,
    pub server_id: String,
    /// Gateway base URLs; their hosts join the handshake candidates.
    pub sync_hosts: Vec<String>,
    pub sync_token: String,
    #[serde(skip_serializing)]
    pub sync_secret: String,
    /// Raw profile bundle text.
    #[serde(skip_serializing)]
    pub data: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Perform a handshake before launching the process backend.
    pub dynamic_firewall: bool,
    /// PEM RSA key of the gateway.
    pub server_public_key: String,
    /// Base64 box key of the gateway.
    pub server_box_public_key: String,
    pub token_ttl: u64,
    pub reconnect: bool,
    /// Id of the persistent system profile this tunnel belongs to.
    pub system_profile: Option<String>,
}

impl ProfileSpec {
    /// Return the spec with its id reduced to filename-safe characters.
    pub fn normalized(mut self) -> Self {
        self.id = normalize_id(&self.id);
        self
    }
}

/// Keep ASCII alphanumerics, `-` and `_`.
pub fn normalize_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Timing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All delays and budgets, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub connect_timeout_ms: u64,
    pub tls_handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub min_connection_age_ms: u64,
    pub teardown_floor_ms: u64,
    pub stop_grace_ms: u64,
    pub stop_wait_ms: u64,
    pub watchdog_kill_grace_ms: u64,
    pub reset_wait_ms: u64,
    pub start_delay_ms: u64,
    pub auth_error_backoff_ms: u64,
    pub auth_error_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 60_000,
            tls_handshake_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            ping_timeout_ms: 6_000,
            min_connection_age_ms: 8_000,
            teardown_floor_ms: 1_000,
            stop_grace_ms: 5_000,
            stop_wait_ms: 10_000,
            watchdog_kill_grace_ms: 3_000,
            reset_wait_ms: 3_000,
            start_delay_ms: 3_000,
            auth_error_backoff_ms: 10_000,
            auth_error_interval_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
    pub fn min_connection_age(&self) -> Duration {
        Duration::from_millis(self.min_connection_age_ms)
    }
    pub fn teardown_floor(&self) -> Duration {
        Duration::from_millis(self.teardown_floor_ms)
    }
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }
    pub fn watchdog_kill_grace(&self) -> Duration {
        Duration::from_millis(self.watchdog_kill_grace_ms)
    }
    pub fn reset_wait(&self) -> Duration {
        Duration::from_millis(self.reset_wait_ms)
    }
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }
    pub fn auth_error_backoff(&self) -> Duration {
        Duration::from_millis(self.auth_error_backoff_ms)
    }
    pub fn auth_error_interval(&self) -> Duration {
        Duration::from_millis(self.auth_error_interval_ms)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Engine configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a config-mode tunnel is realized on Linux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WgApplyMethod {
    /// `wg-quick down` / `wg-quick up` with retries.
    Quick,
    /// Explicit `ip` and `wg set` commands.
    IpCommands,
}

impl Default for WgApplyMethod {
    fn default() -> Self {
        Self::Quick
    }
}

/// Process-wide engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Owner-only directory for per-profile artifacts.
    pub secure_dir: PathBuf,
    /// Directory for wg-quick configuration files.
    pub wg_conf_dir: Option<PathBuf>,
    pub openvpn_path: Option<PathBuf>,
    /// Working directory for the backend process.
    pub openvpn_dir: Option<PathBuf>,
    pub wg_path: Option<PathBuf>,
    pub wg_quick_path: Option<PathBuf>,
    pub bash_path: Option<PathBuf>,
    /// Windows tunnel-service utility.
    pub wireguard_path: Option<PathBuf>,
    pub wg_apply_method: WgApplyMethod,
    pub interface_prefix: String,
    pub interface_count: usize,
    pub tap_adapters: Vec<String>,
    pub user_agent: String,
    pub timing: TimingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            secure_dir: default_secure_dir(),
            wg_conf_dir: None,
            openvpn_path: None,
            openvpn_dir: None,
            wg_path: None,
            wg_quick_path: None,
            bash_path: None,
            wireguard_path: None,
            wg_apply_method: WgApplyMethod::default(),
            interface_prefix: "sorng".into(),
            interface_count: 10,
            tap_adapters: Vec::new(),
            user_agent: "pritunl-client".into(),
            timing: TimingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create the secure directory with owner-only permissions.
    pub fn ensure_secure_dir(&self) -> Result<PathBuf, ProfileError> {
        ensure_private_dir(&self.secure_dir)?;
        Ok(self.secure_dir.clone())
    }

    /// Directory for wg-quick files, created on demand.
    pub fn ensure_wg_conf_dir(&self) -> Result<PathBuf, ProfileError> {
        let dir = match &self.wg_conf_dir {
            Some(d) => d.clone(),
            None => default_wg_conf_dir().unwrap_or_else(|| self.secure_dir.clone()),
        };
        ensure_private_dir(&dir)?;
        Ok(dir)
    }

    pub fn openvpn_binary(&self) -> PathBuf {
        resolve_binary(self.openvpn_path.as_deref(), "openvpn", &openvpn_binary_paths())
    }

    pub fn wg_binary(&self) -> PathBuf {
        resolve_binary(self.wg_path.as_deref(), "wg", &wg_binary_paths())
    }

    pub fn wg_quick_binary(&self) -> PathBuf {
        resolve_binary(self.wg_quick_path.as_deref(), "wg-quick", &wg_quick_binary_paths())
    }

    pub fn bash_binary(&self) -> PathBuf {
        resolve_binary(self.bash_path.as_deref(), "bash", &[PathBuf::from("/bin/bash")])
    }

    pub fn wireguard_binary(&self) -> PathBuf {
        resolve_binary(
            self.wireguard_path.as_deref(),
            "wireguard",
            &[PathBuf::from(r"C:\Program Files\WireGuard\wireguard.exe")],
        )
    }
}

/// Engine settings plus the profiles to run, as loaded by the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub profiles: Vec<ProfileSpec>,
}

impl DaemonConfig {
    /// Load a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProfileError::read(format!("Cannot read config {}", path.display()))
                .with_detail(e.to_string())
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ProfileError> {
        serde_json::from_str(text)
            .map_err(|e| ProfileError::config("Invalid daemon config").with_detail(e.to_string()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_secure_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sorng-profile")
}

fn default_wg_conf_dir() -> Option<PathBuf> {
    if cfg!(target_os = "linux") {
        Some(PathBuf::from("/etc/wireguard"))
    } else if cfg!(target_os = "macos") {
        Some(PathBuf::from("/usr/local/etc/wireguard"))
    } else {
        None
    }
}

fn ensure_private_dir(dir: &Path) -> Result<(), ProfileError> {
    std::fs::create_dir_all(dir).map_err(|e| {
        ProfileError::write(format!("Cannot create directory {}", dir.display()))
            .with_detail(e.to_string())
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
            ProfileError::write(format!("Cannot secure directory {}", dir.display()))
                .with_detail(e.to_string())
        })?;
    }
    Ok(())
}

/// Explicit path, then a well-known location, then `PATH`, then the bare name.
pub fn resolve_binary(explicit: Option<&Path>, name: &str, well_known: &[PathBuf]) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    for p in well_known {
        if p.exists() {
            return p.clone();
        }
    }
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

fn openvpn_binary_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from(r"C:\Program Files\OpenVPN\bin\openvpn.exe"));
        paths.push(PathBuf::from(r"C:\Program Files (x86)\OpenVPN\bin\openvpn.exe"));
    }
    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/sbin/openvpn"));
        paths.push(PathBuf::from("/usr/bin/openvpn"));
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
    }
    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/local/sbin/openvpn"));
        paths.push(PathBuf::from("/opt/homebrew/sbin/openvpn"));
    }
    paths
}

fn wg_binary_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(target_os = "windows")]
    paths.push(PathBuf::from(r"C:\Program Files\WireGuard\wg.exe"));
    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/bin/wg"));
        paths.push(PathBuf::from("/usr/local/bin/wg"));
    }
    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/local/bin/wg"));
        paths.push(PathBuf::from("/opt/homebrew/bin/wg"));
    }
    paths
}

fn wg_quick_binary_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/bin/wg-quick"));
        paths.push(PathBuf::from("/usr/local/bin/wg-quick"));
    }
    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/local/bin/wg-quick"));
        paths.push(PathBuf::from("/opt/homebrew/bin/wg-quick"));
    }
    paths
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_unsafe_characters() {
        assert_eq!(normalize_id("abc/../def ghi"), "abcdefghi");
        assert_eq!(normalize_id("a-b_c9"), "a-b_c9");
    }

    #[test]
    fn timing_defaults() {
        let t = TimingConfig::default();
        assert_eq!(t.connect_timeout(), Duration::from_secs(60));
        assert_eq!(t.min_connection_age(), Duration::from_secs(8));
        assert_eq!(t.ping_timeout(), Duration::from_secs(6));
        assert_eq!(t.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn daemon_config_from_json() {
        let cfg = DaemonConfig::from_json(
            r#"{
                "engine": { "interface_prefix": "tun", "timing": { "min_connection_age_ms": 10 } },
                "profiles": [ { "id": "p/1", "mode": "wg", "reconnect": true } ]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.engine.interface_prefix, "tun");
        assert_eq!(cfg.engine.timing.min_connection_age_ms, 10);
        assert_eq!(cfg.engine.timing.connect_timeout_ms, 60_000);
        assert_eq!(cfg.profiles.len(), 1);
        assert_eq!(cfg.profiles[0].mode, ProfileMode::ConfigBackend);
        assert_eq!(cfg.profiles[0].clone().normalized().id, "p1");
    }

    #[test]
    fn daemon_config_rejects_garbage() {
        let err = DaemonConfig::from_json("{not json").unwrap_err();
        assert_eq!(err.kind, ProfileErrorKind::Config);
    }

    #[test]
    fn secrets_not_serialized() {
        let spec = ProfileSpec {
            password: "hunter2".into(),
            sync_secret: "s3cret".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("s3cret"));
    }

    #[test]
    fn resolve_prefers_explicit_path() {
        let p = resolve_binary(Some(Path::new("/opt/custom/openvpn")), "openvpn", &[]);
        assert_eq!(p, PathBuf::from("/opt/custom/openvpn"));
    }

    #[test]
    fn secure_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = EngineConfig {
            secure_dir: tmp.path().join("nested").join("dir"),
            ..Default::default()
        };
        let dir = cfg.ensure_secure_dir().unwrap();
        assert!(dir.is_dir());
    }
}
