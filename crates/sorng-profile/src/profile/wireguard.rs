//! Config-mode tunnel: key generation, wg-quick rendering, OS apply and
//! clear, handshake polling.

use crate::profile::auth::write_artifact;
use crate::profile::config::{EngineConfig, WgApplyMethod};
use crate::profile::exec;
use crate::profile::types::*;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

/// Bumped whenever the interface-name patterns change.
pub const IFACE_PATTERN_VERSION: u32 = 1;

const APPLY_ATTEMPTS: usize = 3;
const FIRST_WAIT: Duration = Duration::from_millis(100);
const RETRY_WAIT: Duration = Duration::from_millis(500);
const KEEPALIVE: u32 = 10;

lazy_static! {
    static ref MAC_IFACE: Option<Regex> = Regex::new(r"INFO:\s*\(([a-z0-9]+)\)").ok();
}

/// Ephemeral interface keypair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgKeys {
    pub private_key: String,
    pub public_key: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render a wg-quick configuration file.
pub fn render_conf(conf: &WgConf, private_key: &str) -> String {
    let mut address = conf.address.clone();
    if !conf.address6.is_empty() {
        address.push(',');
        address.push_str(&conf.address6);
    }

    let mut lines = Vec::new();
    lines.push("[Interface]".to_string());
    lines.push(format!("Address = {}", address));
    lines.push(format!("PrivateKey = {}", private_key));
    if !conf.dns_servers.is_empty() {
        lines.push(format!("DNS = {}", conf.dns_servers.join(",")));
    }

    lines.push(String::new());
    lines.push("[Peer]".to_string());
    lines.push(format!("PublicKey = {}", conf.public_key));
    lines.push(format!("AllowedIPs = {}", conf.allowed_ips().join(",")));
    lines.push(format!("Endpoint = {}", conf.endpoint()));
    lines.push(format!("PersistentKeepalive = {}", KEEPALIVE));
    lines.push(String::new());

    lines.join("\n")
}

/// Write `<iface>.conf` owner-only.
pub fn write_conf(dir: &Path, iface: &str, text: &str) -> Result<PathBuf, ProfileError> {
    write_artifact(&dir.join(format!("{}.conf", iface)), text, 0o600)
}

/// Write `<id>.key` for `wg set ... private-key`.
pub fn write_private_key(dir: &Path, id: &str, private_key: &str) -> Result<PathBuf, ProfileError> {
    write_artifact(&dir.join(format!("{}.key", id)), &format!("{}\n", private_key), 0o600)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One OS command with the failure markers it tolerates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub tolerate: &'static [&'static str],
}

impl OsCommand {
    fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            tolerate: &[],
        }
    }

    fn tolerating(mut self, tolerate: &'static [&'static str]) -> Self {
        self.tolerate = tolerate;
        self
    }

    pub async fn run(&self) -> Result<String, ProfileError> {
        exec::run_logged(self.tolerate, &self.program, &self.args).await
    }
}

fn route_commands(family: &[&str], routes: &[Route], iface: &str, out: &mut Vec<OsCommand>) {
    for route in routes.iter().filter(|r| !r.net_gateway) {
        let metric = route.metric.to_string();
        let mut args: Vec<&str> = family.to_vec();
        args.extend(["route", "add", route.network.as_str(), "via", route.next_hop.as_str()]);
        if route.metric != 0 {
            args.extend(["metric", metric.as_str()]);
        }
        args.extend(["dev", iface]);
        out.push(OsCommand::new("ip", &args).tolerating(&["File exists"]));
    }
}

/// Explicit Linux `ip`/`wg` sequence bringing `iface` up.
pub fn linux_ip_commands(wg: &Path, iface: &str, conf: &WgConf, key_path: &Path) -> Vec<OsCommand> {
    let key_path = key_path.to_string_lossy();
    let allowed = conf.allowed_ips().join(",");
    let endpoint = conf.endpoint();
    let keepalive = KEEPALIVE.to_string();

    let mut cmds = vec![
        OsCommand::new("ip", &["link", "del", iface]).tolerating(&["Cannot find device"]),
        OsCommand::new("ip", &["link", "add", "dev", iface, "type", "wireguard"]),
        OsCommand::new("ip", &["addr", "add", &conf.address, "dev", iface]),
    ];
    if !conf.address6.is_empty() {
        cmds.push(OsCommand::new("ip", &["-6", "addr", "add", &conf.address6, "dev", iface]));
    }
    cmds.push(OsCommand::new(
        wg,
        &[
            "set",
            iface,
            "private-key",
            &key_path,
            "peer",
            &conf.public_key,
            "persistent-keepalive",
            &keepalive,
            "allowed-ips",
            &allowed,
            "endpoint",
            &endpoint,
        ],
    ));
    cmds.push(OsCommand::new("ip", &["link", "set", iface, "up"]));

    route_commands(&[], &conf.routes, iface, &mut cmds);
    route_commands(&["-6"], &conf.routes6, iface, &mut cmds);
    cmds
}

/// Name of the macOS `utun` device from wg-quick output.
pub fn parse_mac_interface(output: &str) -> Result<String, ProfileError> {
    if let Some(re) = MAC_IFACE.as_ref() {
        let found = output
            .lines()
            .filter(|l| l.contains("INFO"))
            .filter_map(|l| re.captures(l).and_then(|c| c.get(1)))
            .map(|m| m.as_str().to_string())
            .last();
        if let Some(name) = found {
            return Ok(name);
        }
    }

    output
        .lines()
        .filter(|l| l.contains("Interface for"))
        .filter_map(|l| l.split_whitespace().last())
        .map(str::to_string)
        .last()
        .ok_or_else(|| ProfileError::parse("Failed to parse wg interface output"))
}

/// Handshake epoch of `server_key` in `wg show latest-handshakes` output,
/// or 0 when the peer has not completed one.
pub fn parse_latest_handshake(output: &str, server_key: &str) -> i64 {
    output
        .lines()
        .filter_map(|l| {
            let fields: Vec<&str> = l.split_whitespace().collect();
            (fields.len() >= 2 && fields[0] == server_key).then(|| fields[1].parse::<i64>().ok())?
        })
        .next()
        .unwrap_or(0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// OS-side operations on a config-mode tunnel.
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn method(&self) -> WgApplyMethod;

    /// Fresh ephemeral keypair.
    async fn generate_keypair(&self) -> Result<WgKeys, ProfileError>;

    /// Bring `iface` up from the file at `conf_path`.
    ///
    /// Returns the OS tunnel device name when it differs from `iface`.
    async fn apply(
        &self,
        iface: &str,
        conf: &WgConf,
        conf_path: &Path,
        key_path: Option<&Path>,
    ) -> Result<Option<String>, ProfileError>;

    /// Remove the tunnel, tolerating an interface that is already gone.
    async fn clear(&self, iface: &str, conf_path: Option<&Path>);

    /// Latest handshake epoch for `server_key` on `iface`.
    async fn latest_handshake(&self, iface: &str, server_key: &str) -> Result<i64, ProfileError>;
}

/// Resolved binaries plus the engine-wide lock around wg-quick.
pub struct WgTool {
    wg: PathBuf,
    wg_quick: PathBuf,
    bash: PathBuf,
    wireguard: PathBuf,
    method: WgApplyMethod,
    lock: Mutex<()>,
}

impl WgTool {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            wg: config.wg_binary(),
            wg_quick: config.wg_quick_binary(),
            bash: config.bash_binary(),
            wireguard: config.wireguard_binary(),
            method: config.wg_apply_method,
            lock: Mutex::new(()),
        }
    }

    /// wg-quick invocation, through bash on macOS. `target` is the
    /// configuration path so wg-quick never searches its own directory.
    fn quick(&self, action: &str, target: &str) -> OsCommand {
        if cfg!(target_os = "macos") {
            OsCommand::new(&self.bash, &[&*self.wg_quick.to_string_lossy(), action, target])
        } else {
            OsCommand::new(&self.wg_quick, &[action, target])
        }
    }

    /// Tear down then bring up, three attempts. Returns the last `up` output.
    async fn cycle(&self, down: &[OsCommand], up: &OsCommand) -> Result<String, ProfileError> {
        let mut last = ProfileError::exec("Tunnel apply not attempted");
        for attempt in 0..APPLY_ATTEMPTS {
            {
                let _guard = self.lock.lock().await;
                for (i, cmd) in down.iter().enumerate() {
                    if i > 0 {
                        tokio::time::sleep(FIRST_WAIT).await;
                    }
                    exec::run_unchecked(&cmd.program, &cmd.args).await;
                }
            }

            tokio::time::sleep(if attempt == 0 { FIRST_WAIT } else { RETRY_WAIT }).await;

            let _guard = self.lock.lock().await;
            match up.run().await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    log::warn!("Tunnel apply attempt {} failed: {}", attempt + 1, e);
                    last = e;
                }
            }
        }
        Err(last)
    }
}

#[async_trait]
impl Tunnel for WgTool {
    fn method(&self) -> WgApplyMethod {
        self.method
    }

    async fn generate_keypair(&self) -> Result<WgKeys, ProfileError> {
        let private_key = exec::run_with_input(&self.wg, &["genkey"], "")
            .await
            .map_err(|e| ProfileError::exec("Failed to generate private key").with_detail(e.to_string()))?;
        let public_key = exec::run_with_input(&self.wg, &["pubkey"], &private_key)
            .await
            .map_err(|e| ProfileError::exec("Failed to get public key").with_detail(e.to_string()))?;
        Ok(WgKeys {
            private_key: private_key.trim().to_string(),
            public_key: public_key.trim().to_string(),
        })
    }

    async fn apply(
        &self,
        iface: &str,
        conf: &WgConf,
        conf_path: &Path,
        key_path: Option<&Path>,
    ) -> Result<Option<String>, ProfileError> {
        let target = conf_path.to_string_lossy();
        if cfg!(target_os = "macos") {
            let down = [self.quick("down", &target)];
            let up = self.quick("up", &target);
            let output = self.cycle(&down, &up).await?;
            return parse_mac_interface(&output).map(Some);
        }

        if cfg!(target_os = "windows") {
            let service = format!("WireGuardTunnel${}", iface);
            let down = [
                OsCommand::new("sc.exe", &["stop", &service]),
                OsCommand::new("sc.exe", &["delete", &service]),
            ];
            let up = OsCommand::new(&self.wireguard, &["/installtunnelservice", &*target]);
            self.cycle(&down, &up).await?;
            return Ok(None);
        }

        match (self.method, key_path) {
            (WgApplyMethod::IpCommands, Some(key_path)) => {
                let _guard = self.lock.lock().await;
                for cmd in linux_ip_commands(&self.wg, iface, conf, key_path) {
                    cmd.run().await?;
                }
            }
            (WgApplyMethod::IpCommands, None) => {
                return Err(ProfileError::config("Private key file required for ip apply"));
            }
            (WgApplyMethod::Quick, _) => {
                let down = [self.quick("down", &target)];
                let up = self.quick("up", &target);
                self.cycle(&down, &up).await?;
            }
        }
        Ok(None)
    }

    async fn clear(&self, iface: &str, conf_path: Option<&Path>) {
        let _guard = self.lock.lock().await;
        if cfg!(target_os = "windows") {
            let service = format!("WireGuardTunnel${}", iface);
            exec::run_unchecked("sc.exe", &["stop", service.as_str()]).await;
            tokio::time::sleep(FIRST_WAIT).await;
            exec::run_unchecked("sc.exe", &["delete", service.as_str()]).await;
            return;
        }

        let result = if self.method == WgApplyMethod::IpCommands && cfg!(target_os = "linux") {
            exec::run_logged(&["Cannot find device"], "ip", &["link", "del", iface]).await
        } else {
            let target = conf_path.map_or_else(|| iface.to_string(), |p| p.to_string_lossy().into_owned());
            let down = self.quick("down", &target);
            exec::run_logged(&["does not exist", "is not a"], &down.program, &down.args).await
        };
        if let Err(e) = result {
            log::warn!("Failed to clear tunnel {}: {}", iface, e);
        }
    }

    async fn latest_handshake(&self, iface: &str, server_key: &str) -> Result<i64, ProfileError> {
        let output = exec::run_logged(
            &["No such device", "access interface"],
            &self.wg,
            &["show", iface, "latest-handshakes"],
        )
        .await?;
        Ok(parse_latest_handshake(&output, server_key))
    }
}
