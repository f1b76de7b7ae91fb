//! The profile state machine: admission, mode dispatch, stop, wait, and a
//! single asynchronous teardown per attempt.
//!
//! A [`Profile`] is one connection attempt. Reconnects never reuse an
//! instance; they start a [`Profile::copy`] once the old one has been
//! waited out.

use crate::profile::auth::{encode_credentials, write_artifact, write_auth_file, CredentialInputs};
use crate::profile::bundle::{candidates, parse_bundle, shuffled, Bundle};
use crate::profile::classifier::{classify, LogSignal};
use crate::profile::collaborators::AuthToken;
use crate::profile::config::{ProfileSpec, WgApplyMethod};
use crate::profile::device::{build_device_box, DeviceInfo};
use crate::profile::engine::Engine;
use crate::profile::events::{Event, EventKind};
use crate::profile::health::{detect, maintain, DetectOutcome, HealthTiming, LinkProbe, MaintainOutcome};
use crate::profile::keyexchange::{try_candidates, CandidateOutcome, ExchangeAuth, PingError};
use crate::profile::management::ManagementChannel;
use crate::profile::process::{build_args, spawn_backend, BackendProcess, LaunchArgs};
use crate::profile::registry::{Admission, Registered};
use crate::profile::scripts::{write_block, write_hooks, HookFlavor};
use crate::profile::types::*;
use crate::profile::wireguard::{render_conf, write_conf, write_private_key};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Process-mode auth errors tolerated before a system profile is deactivated.
const OVPN_AUTH_ERROR_LIMIT: u32 = 10;
/// Config-mode auth denials tolerated before a system profile is deactivated.
const WG_AUTH_ERROR_LIMIT: u32 = 2;
/// Connected timestamps are backdated by this many seconds.
const CONNECTED_SKEW: i64 = 5;

/// Remaining part of `min` since `since`, zero once it has passed.
pub(crate) fn remaining(since: Instant, min: Duration) -> Duration {
    min.saturating_sub(since.elapsed())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutable facts of one attempt, guarded by the status lock.
#[derive(Default)]
struct ProfileState {
    status: ProfileStatus,
    /// Set by the first `stop`; later calls return at once.
    stop_requested: bool,
    start_time: Option<Instant>,
    timestamp: i64,
    iface: String,
    tun_iface: String,
    /// wg-quick file of this attempt's interface.
    wg_conf: Option<PathBuf>,
    routes: Vec<Route>,
    routes6: Vec<Route>,
    gateway_addr: String,
    gateway_addr6: String,
    server_addr: String,
    client_addr: String,
    mac_addr: String,
    mac_addrs: Vec<String>,
    web_port: u16,
    web_no_ssl: bool,
    tap: Option<String>,
    management_port: Option<u16>,
    artifacts: Vec<PathBuf>,
    token: Option<Arc<AuthToken>>,
    /// Token string presented throughout this attempt.
    token_value: Option<String>,
    last_auth_error: Option<Instant>,
    device_id: Option<String>,
    device_name: Option<String>,
    private_key: String,
    wg_public_key: String,
    server_public_key: String,
    /// Latest handshake epoch, 0 while none has been observed.
    handshake: i64,
}

/// One connection attempt of a configured profile.
pub struct Profile {
    engine: Arc<Engine>,
    spec: ProfileSpec,
    /// Monotonic stop flag shared with every background task.
    stop: CancellationToken,
    connected: AtomicBool,
    auth_failed: AtomicBool,
    teardown_started: AtomicBool,
    active: watch::Sender<bool>,
    state: Mutex<ProfileState>,
    backend: RwLock<Option<Arc<BackendProcess>>>,
    management: RwLock<Option<ManagementChannel>>,
}

impl Registered for Profile {
    fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Profile {
    pub fn new(engine: Arc<Engine>, spec: ProfileSpec) -> Arc<Self> {
        let (active, _) = watch::channel(false);
        Arc::new(Self {
            engine,
            spec: spec.normalized(),
            stop: CancellationToken::new(),
            connected: AtomicBool::new(false),
            auth_failed: AtomicBool::new(false),
            teardown_started: AtomicBool::new(false),
            active,
            state: Mutex::new(ProfileState::default()),
            backend: RwLock::new(None),
            management: RwLock::new(None),
        })
    }

    /// Fresh instance for the next attempt with the same identity.
    pub fn copy(&self) -> Arc<Self> {
        let next = Self::new(self.engine.clone(), self.spec.clone());
        next.connected
            .store(self.connected.load(Ordering::SeqCst), Ordering::SeqCst);
        next
    }

    fn state(&self) -> MutexGuard<'_, ProfileState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn mode(&self) -> ProfileMode {
        self.spec.mode
    }

    pub fn spec(&self) -> &ProfileSpec {
        &self.spec
    }

    /// True from admission until teardown completes.
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ProfileStatus {
        self.state().status
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        let st = self.state();
        ProfileSnapshot {
            id: self.spec.id.clone(),
            mode: self.spec.mode,
            iface: st.iface.clone(),
            tun_iface: st.tun_iface.clone(),
            routes: st.routes.clone(),
            routes6: st.routes6.clone(),
            reconnect: self.spec.reconnect,
            status: st.status,
            timestamp: st.timestamp,
            gateway_addr: st.gateway_addr.clone(),
            gateway_addr6: st.gateway_addr6.clone(),
            server_addr: st.server_addr.clone(),
            client_addr: st.client_addr.clone(),
            mac_addr: st.mac_addr.clone(),
            mac_addrs: st.mac_addrs.clone(),
            web_port: st.web_port,
            web_no_ssl: st.web_no_ssl,
        }
    }

    fn emit(&self, kind: EventKind) {
        self.engine.emit(Event::profile(kind, self.snapshot()));
    }

    fn update(&self) {
        self.emit(EventKind::Update);
    }

    /// Forward a backend line to the system-profile log or as an event.
    fn push_output(&self, line: &str) {
        match &self.spec.system_profile {
            Some(sp) => self.engine.system_profiles.push_output(sp, line),
            None => self.engine.emit(Event::output(&self.spec.id, line)),
        }
    }

    fn record_artifact(&self, path: PathBuf) -> PathBuf {
        self.state().artifacts.push(path.clone());
        path
    }

    /// Token for this attempt, refreshed once and then reused.
    pub(crate) fn attempt_token(&self) -> String {
        let mut st = self.state();
        if let Some(value) = &st.token_value {
            return value.clone();
        }
        let token = self.engine.tokens.get(
            &self.spec.id,
            &self.spec.server_public_key,
            &self.spec.server_box_public_key,
            self.spec.token_ttl,
        );
        let value = token.refresh();
        st.token = Some(token);
        st.token_value = Some(value.clone());
        value
    }

    fn token(&self) -> Option<Arc<AuthToken>> {
        self.state().token.clone()
    }

    fn exchange_auth(&self, private_key: &str) -> ExchangeAuth {
        ExchangeAuth {
            mode: self.spec.mode,
            org_id: self.spec.org_id.clone(),
            user_id: self.spec.user_id.clone(),
            server_id: self.spec.server_id.clone(),
            sync_token: self.spec.sync_token.clone(),
            sync_secret: self.spec.sync_secret.clone(),
            server_box_public_key: self.spec.server_box_public_key.clone(),
            private_key: private_key.to_string(),
        }
    }

    /// Parse the bundle, record device facts and return the shuffled
    /// handshake candidates.
    fn prepare_handshake(&self) -> (Bundle, Vec<String>) {
        let bundle = parse_bundle(&self.spec.data);
        let (mac_addr, mac_addrs) = self.engine.platform.mac_addresses();
        {
            let mut st = self.state();
            st.mac_addr = mac_addr;
            st.mac_addrs = mac_addrs;
            st.device_id = bundle.device_id.clone();
            st.device_name = bundle.device_name.clone();
            st.private_key = bundle.private_key.clone();
        }
        let hosts = shuffled(candidates(&bundle, &self.spec.sync_hosts));
        (bundle, hosts)
    }

    fn device_info_box(&self, token: &str, password: &str, wg_public_key: Option<&str>) -> DeviceBox {
        let st = self.state();
        build_device_box(&DeviceInfo {
            device_id: st.device_id.as_deref(),
            device_name: st.device_name.as_deref(),
            token,
            password,
            mac_addr: &st.mac_addr,
            mac_addrs: &st.mac_addrs,
            wg_public_key,
        })
    }

    fn spawn_restart(self: &Arc<Self>, delay: bool) {
        let this = self.clone();
        self.engine.supervisor.spawn("restart", &self.spec.id, async move {
            this.restart(delay).await;
            Ok(())
        });
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Admit this instance into the registry and mark it active.
    ///
    /// Returns false under shutdown or when a live holder owns the id.
    pub(crate) fn register(self: &Arc<Self>) -> bool {
        let id = &self.spec.id;
        if self.engine.registry.is_shutdown() {
            log::info!("[{}] Engine shutting down, start ignored", id);
            return false;
        }

        match self.engine.registry.admit(id, self.clone()) {
            Admission::Duplicate => {
                log::info!("[{}] Profile already active", id);
                false
            }
            Admission::Admitted { evicted, first } => {
                if let Some(old) = evicted {
                    log::info!("[{}] Evicting stale instance", id);
                    self.engine.supervisor.spawn("evict", id, async move {
                        old.stop().await;
                        Ok(())
                    });
                }
                if first && cfg!(target_os = "macos") {
                    let platform = self.engine.platform.clone();
                    self.engine.supervisor.spawn("scutil_clear", id, async move {
                        if let Err(e) = platform.clear_scutil_keys().await {
                            log::warn!("Failed to clear network state: {}", e);
                        }
                        Ok(())
                    });
                }

                {
                    let mut st = self.state();
                    st.start_time = Some(Instant::now());
                    st.status = ProfileStatus::Connecting;
                }
                self.active.send_replace(true);
                true
            }
        }
    }

    /// Connect. With `timeout` a watchdog gives up on a backend that never
    /// connects; with `delay` the attempt waits out the start delay first.
    pub async fn start(self: &Arc<Self>, timeout: bool, delay: bool) -> Result<(), ProfileError> {
        if !self.register() {
            return Ok(());
        }
        let id = self.spec.id.clone();
        log::info!("[{}] Starting {} profile", id, self.spec.mode);

        if let Some(sp) = &self.spec.system_profile {
            if let Err(e) = self.engine.system_profiles.sync(sp).await {
                log::warn!("[{}] System profile sync failed: {}", id, e);
            }
        }

        if delay {
            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(self.engine.config.timing.start_delay()) => {}
            }
            if self.is_stopped() {
                self.clear_status();
                return Ok(());
            }
        }

        let result = match self.spec.mode {
            ProfileMode::ProcessBackend => self.start_process(timeout).await,
            ProfileMode::ConfigBackend => self.start_config().await,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.clear_status();
                if self.is_stopped() {
                    log::debug!("[{}] Start aborted by stop: {}", id, e);
                    return Ok(());
                }
                log::error!("[{}] Failed to start profile: {}", id, e);
                self.emit(EventKind::ConnectionError);
                Err(e)
            }
        }
    }

    /// Request disconnection. Idempotent.
    pub async fn stop(&self) {
        let id = &self.spec.id;
        let start_time = {
            let mut st = self.state();
            if st.stop_requested {
                return;
            }
            st.stop_requested = true;
            if self.is_active() {
                st.status = ProfileStatus::Disconnecting;
            }
            st.start_time
        };
        self.stop.cancel();
        if !self.is_active() {
            return;
        }
        log::info!("[{}] Stopping profile", id);
        self.update();

        if let Some(since) = start_time {
            let wait = remaining(since, self.engine.config.timing.min_connection_age());
            if !wait.is_zero() {
                log::debug!("[{}] Waiting {:?} before teardown", id, wait);
                tokio::time::sleep(wait).await;
            }
        }

        match self.spec.mode {
            ProfileMode::ProcessBackend => self.stop_process().await,
            // The health watcher observes the stop flag and tears down.
            ProfileMode::ConfigBackend => {}
        }
    }

    /// Block until teardown has completed; immediate when inactive.
    pub async fn wait(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|active| !*active).await;
    }

    /// Stop this attempt and, with reconnect set, start a copy.
    pub fn restart(self: &Arc<Self>, delay: bool) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let next = {
                let _guard = this.engine.restart_lock.lock().await;
                if this.is_stopped() {
                    return;
                }
                this.stop.cancel();
                this.copy()
            };

            log::info!("[{}] Restarting profile", this.spec.id);
            this.stop().await;
            this.wait().await;

            if !next.spec.reconnect {
                return;
            }
            if let Err(e) = next.start(false, delay).await {
                log::error!("[{}] Restart failed: {}", next.spec.id, e);
            }
        })
    }

    /// Begin teardown. Only the first call has an effect.
    pub(crate) fn clear_status(self: &Arc<Self>) {
        if self.teardown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tap, port) = {
            let mut st = self.state();
            (st.tap.take(), st.management_port.take())
        };
        if let Some(tap) = tap {
            self.engine.taps.release(&tap);
        }
        if let Some(port) = port {
            self.engine.ports.release(port);
        }

        let this = self.clone();
        self.engine.supervisor.spawn("teardown", &self.spec.id, async move {
            this.teardown().await;
            Ok(())
        });
    }

    async fn teardown(self: Arc<Self>) {
        let id = self.spec.id.clone();
        let timing = &self.engine.config.timing;

        let floor = self.state().start_time.map(|t| remaining(t, timing.teardown_floor()));
        if let Some(floor) = floor.filter(|f| !f.is_zero()) {
            tokio::time::sleep(floor).await;
        }

        let (iface, wg_conf) = {
            let st = self.state();
            (st.iface.clone(), st.wg_conf.clone())
        };
        if !iface.is_empty() {
            self.engine.wg.clear(&iface, wg_conf.as_deref()).await;
            self.engine.interfaces.release(&iface);
        }

        let backend = self.backend.write().await.take();
        if let Some(b) = backend {
            if !b.has_exited() {
                if let Err(e) = b.kill().await {
                    log::warn!("[{}] Failed to kill backend: {}", id, e);
                }
                b.wait_exit_timeout(timing.teardown_floor()).await;
            }
        }
        self.management.write().await.take();

        {
            let mut st = self.state();
            st.status = ProfileStatus::Disconnected;
            st.timestamp = 0;
            st.handshake = 0;
        }
        self.update();
        self.emit(EventKind::Disconnected);

        let artifacts = {
            let mut st = self.state();
            st.client_addr.clear();
            st.server_addr.clear();
            std::mem::take(&mut st.artifacts)
        };
        // Artifact names depend only on the id, so a superseded instance
        // leaves them to its successor.
        let released = self.engine.registry.release_if_current(&id, &self, || {
            for path in artifacts {
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("[{}] Failed to remove {}: {}", id, path.display(), e);
                    }
                }
            }
        });
        match released {
            None => log::debug!("[{}] Superseded, artifacts kept", id),
            Some(true) if cfg!(target_os = "macos") => {
                if let Err(e) = self.engine.platform.clear_scutil_keys().await {
                    log::warn!("[{}] Failed to clear network state: {}", id, e);
                }
            }
            Some(_) => {}
        }

        self.active.send_replace(false);
        log::info!("[{}] Profile disconnected", id);
    }

    /// Give up on a handshake that failed against every candidate.
    async fn handshake_failed(self: &Arc<Self>, err: ProfileError) {
        log::error!("[{}] Handshake failed: {}", self.spec.id, err);
        self.emit(EventKind::ConnectionError);
        tokio::time::sleep(self.engine.config.timing.reset_wait()).await;
        self.clear_status();
        if self.is_connected() && !self.is_stopped() {
            self.spawn_restart(false);
        }
    }

    /// Bump the system-profile auth counter, deactivating it at `limit`.
    ///
    /// Returns true when the counter was incremented.
    async fn count_auth_error(&self, limit: u32) -> bool {
        let Some(sp) = &self.spec.system_profile else {
            return false;
        };
        let store = &self.engine.system_profiles;
        let count = store.auth_error_count(sp);
        if count >= limit {
            log::error!("[{}] Too many auth errors, disabling system profile", self.spec.id);
            if let Err(e) = store.deactivate(sp).await {
                log::error!("[{}] Failed to deactivate system profile: {}", self.spec.id, e);
            }
            store.set_auth_error_count(sp, 0);
            false
        } else {
            store.set_auth_error_count(sp, count + 1);
            true
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Process backend
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn open_ovpn(self: &Arc<Self>) -> Option<OvpnData> {
        let (bundle, hosts) = self.prepare_handshake();
        let auth = self.exchange_auth(&bundle.private_key);
        let token = self.attempt_token();
        let exchange = &self.engine.exchange;
        let auth = &auth;

        let outcome = try_candidates(hosts, &self.stop, |host| {
            let device = self.device_info_box(&token, &self.spec.password, None);
            async move { exchange.request_ovpn(&host, auth, &device).await }
        })
        .await;

        match outcome {
            CandidateOutcome::Success(data) => Some(data),
            CandidateOutcome::Cancelled => {
                self.clear_status();
                None
            }
            CandidateOutcome::Failed(e) => {
                self.handshake_failed(e).await;
                None
            }
        }
    }

    async fn start_process(self: &Arc<Self>, timeout: bool) -> Result<(), ProfileError> {
        let id = self.spec.id.clone();
        let engine = &self.engine;
        let windows = cfg!(target_os = "windows");

        let data = if self.spec.dynamic_firewall {
            let Some(data) = self.open_ovpn().await else {
                return Ok(());
            };
            if !data.allow {
                log::error!("[{}] Gateway denied connection: {}", id, data.reason);
                self.emit(EventKind::AuthError);
                self.clear_status();
                return Ok(());
            }
            data
        } else {
            OvpnData::default()
        };

        if windows {
            engine.taps.resize(engine.registry.len())?;
        }

        let dir = engine.config.ensure_secure_dir()?;
        let mut conf = engine.renderer.render(&self.spec.data, &data.remote, &data.remote6)?;

        if windows {
            let port = engine.ports.acquire()?;
            self.state().management_port = Some(port);
            let channel = ManagementChannel::create(&dir, &id, port)?;
            self.record_artifact(channel.password_path.clone());
            if !conf.is_empty() && !conf.ends_with('\n') {
                conf.push('\n');
            }
            conf.push_str(&channel.directive().replace('\\', "\\\\"));
            conf.push('\n');
            *self.management.write().await = Some(channel);
        }

        let conf_path = self.record_artifact(write_artifact(&dir.join(&id), &conf, 0o600)?);

        let needs_auth = (!self.spec.username.is_empty() && !self.spec.password.is_empty())
            || !self.spec.server_box_public_key.is_empty()
            || !self.spec.server_public_key.is_empty();
        let auth_path = if needs_auth {
            let token = self.attempt_token();
            let creds = encode_credentials(&CredentialInputs {
                username: &self.spec.username,
                password: &self.spec.password,
                firewall_token: &data.token,
                server_box_public_key: &self.spec.server_box_public_key,
                server_public_key: &self.spec.server_public_key,
                auth_token: &token,
            })?;
            Some(self.record_artifact(write_auth_file(&dir, &id, &creds)?))
        } else {
            None
        };

        self.update();

        let tap = if windows {
            let tap = engine.taps.acquire()?;
            self.state().tap = Some(tap.clone());
            Some(tap)
        } else {
            None
        };

        let block = self.record_artifact(write_block(&dir, &id)?);
        let hooks = match HookFlavor::detect(engine.platform.uses_systemd_resolved()) {
            Some(flavor) if !windows => {
                let hooks = write_hooks(&dir, &id, flavor)?;
                self.record_artifact(hooks.up.clone());
                self.record_artifact(hooks.down.clone());
                Some(hooks)
            }
            _ => None,
        };

        let args = build_args(&LaunchArgs {
            config: Some(&conf_path),
            auth: auth_path.as_deref(),
            hooks: hooks.as_ref(),
            block: Some(&block),
            tap: tap.as_deref(),
        });

        if self.is_stopped() {
            self.clear_status();
            return Ok(());
        }

        let binary = engine.config.openvpn_binary();
        let (backend, output) = spawn_backend(&binary, &args, engine.config.openvpn_dir.as_deref()).await?;
        *self.backend.write().await = Some(backend.clone());

        if self.is_stopped() {
            // A stop that ran before the handle was stored saw no process.
            self.stop_process().await;
        }

        let (consumed_tx, consumed_rx) = oneshot::channel();
        let this = self.clone();
        engine.supervisor.spawn("output", &id, async move {
            this.consume(output).await;
            let _ = consumed_tx.send(());
            Ok(())
        });

        let this = self.clone();
        let waiting = backend.clone();
        engine.supervisor.spawn("exit", &id, async move {
            let code = waiting.wait_exit().await;
            let _ = consumed_rx.await;
            if this.is_stopped() {
                log::info!("[{}] Backend exited ({:?})", this.spec.id, code);
            } else {
                log::warn!("[{}] Backend exited unexpectedly ({:?})", this.spec.id, code);
            }
            if cfg!(target_os = "macos") {
                if let Err(e) = this.engine.platform.restore_scutil_dns().await {
                    log::warn!("[{}] Failed to restore DNS: {}", this.spec.id, e);
                }
            }
            this.clear_status();
            Ok(())
        });

        if timeout {
            let this = self.clone();
            engine.supervisor.spawn("watchdog", &id, async move {
                this.watchdog(backend).await;
                Ok(())
            });
        }

        Ok(())
    }

    async fn consume(self: &Arc<Self>, mut output: mpsc::Receiver<String>) {
        while let Some(line) = output.recv().await {
            self.handle_line(&line).await;
        }
    }

    async fn watchdog(self: &Arc<Self>, backend: Arc<BackendProcess>) {
        let timing = &self.engine.config.timing;
        tokio::select! {
            _ = self.stop.cancelled() => return,
            _ = tokio::time::sleep(timing.connect_timeout()) => {}
        }
        if self.is_connected() || backend.has_exited() {
            return;
        }

        log::error!("[{}] Connection timed out", self.spec.id);
        if let Err(e) = self.signal_backend(&backend).await {
            log::warn!("[{}] Failed to interrupt backend: {}", self.spec.id, e);
        }
        self.finish_backend(&backend, timing.watchdog_kill_grace(), timing.stop_wait())
            .await;
        self.emit(EventKind::TimeoutError);
    }

    /// Graceful shutdown request: management SIGTERM on Windows, SIGINT
    /// elsewhere.
    async fn signal_backend(&self, backend: &BackendProcess) -> Result<(), ProfileError> {
        if cfg!(target_os = "windows") {
            let channel = self.management.read().await.clone();
            match channel {
                Some(channel) => channel.signal_sigterm().await,
                None => backend.kill().await,
            }
        } else {
            backend.interrupt().await
        }
    }

    /// Wait `grace` for exit, then force a kill and wait out `total`.
    async fn finish_backend(&self, backend: &BackendProcess, grace: Duration, total: Duration) {
        if backend.wait_exit_timeout(grace).await {
            return;
        }
        log::warn!("[{}] Backend still running, killing", self.spec.id);
        if let Err(e) = backend.kill().await {
            log::error!("[{}] Failed to kill backend: {}", self.spec.id, e);
        }
        if !backend.wait_exit_timeout(total.saturating_sub(grace)).await {
            log::error!("[{}] Backend did not exit", self.spec.id);
        }
    }

    async fn stop_process(&self) {
        let backend = self.backend.read().await.clone();
        let Some(backend) = backend else {
            return;
        };
        if backend.has_exited() {
            return;
        }
        if let Err(e) = self.signal_backend(&backend).await {
            log::warn!("[{}] Graceful stop failed, killing: {}", self.spec.id, e);
            if let Err(e) = backend.kill().await {
                log::error!("[{}] Failed to kill backend: {}", self.spec.id, e);
            }
        }
        let timing = &self.engine.config.timing;
        self.finish_backend(&backend, timing.stop_grace(), timing.stop_wait())
            .await;
    }

    /// Apply one backend output line.
    pub(crate) async fn handle_line(self: &Arc<Self>, line: &str) {
        self.push_output(line);

        let signal = match classify(line) {
            Ok(Some(signal)) => signal,
            Ok(None) => return,
            Err(e) => {
                log::warn!("[{}] {}", self.spec.id, e);
                return;
            }
        };

        match signal {
            LogSignal::Connected => {
                self.connected.store(true, Ordering::SeqCst);
                {
                    let mut st = self.state();
                    st.status = ProfileStatus::Connected;
                    st.timestamp = unix_now() - CONNECTED_SKEW;
                }
                log::info!("[{}] Profile connected", self.spec.id);
                self.update();
                self.emit(EventKind::Connected);
                if let Some(token) = self.token() {
                    token.mark_valid();
                }
                let platform = self.engine.platform.clone();
                let id = self.spec.id.clone();
                self.engine.supervisor.spawn("dns_flush", &self.spec.id, async move {
                    if let Err(e) = platform.clear_dns_cache().await {
                        log::warn!("[{}] Failed to clear DNS cache: {}", id, e);
                    }
                    Ok(())
                });
            }
            LogSignal::InactiveStop => {
                log::warn!("[{}] Disconnected by inactivity", self.spec.id);
                self.emit(EventKind::Inactive);
                self.stop.cancel();
            }
            LogSignal::Restart => {
                log::warn!("[{}] Connection lost, restarting", self.spec.id);
                self.spawn_restart(true);
            }
            LogSignal::AddressUnavailable => {
                let this = self.clone();
                self.engine.supervisor.spawn("reset_all", &self.spec.id, async move {
                    tokio::time::sleep(this.engine.config.timing.reset_wait()).await;
                    if !this.is_stopped() {
                        log::warn!("[{}] Address unavailable, restarting all profiles", this.spec.id);
                        this.engine.restart_all();
                    }
                    Ok(())
                });
            }
            LogSignal::AuthFailed => self.auth_failure().await,
            LogSignal::AuthFailure => {
                if !self.auth_failed.load(Ordering::SeqCst) {
                    self.auth_failure().await;
                }
            }
            LogSignal::ServerAddr(addr) => {
                self.state().server_addr = addr;
                self.update();
            }
            LogSignal::ClientAddr(addr) => {
                self.state().client_addr = addr;
                self.update();
            }
        }
    }

    async fn auth_failure(self: &Arc<Self>) {
        let timing = &self.engine.config.timing;
        self.stop.cancel();
        self.auth_failed.store(true, Ordering::SeqCst);
        if let Some(token) = self.token() {
            token.invalidate();
        }

        let report = {
            let mut st = self.state();
            let due = st
                .last_auth_error
                .map_or(true, |t| t.elapsed() > timing.auth_error_interval());
            if due {
                st.last_auth_error = Some(Instant::now());
            }
            due
        };
        // Repeats of one rejection inside the interval are neither
        // reported nor counted.
        if !report {
            return;
        }
        log::error!("[{}] Authentication failed", self.spec.id);
        self.emit(EventKind::AuthError);

        if self.spec.system_profile.is_some() {
            if self.count_auth_error(OVPN_AUTH_ERROR_LIMIT).await {
                tokio::time::sleep(timing.auth_error_backoff()).await;
            }
        } else {
            tokio::time::sleep(timing.reset_wait()).await;
        }
        // Lines queued behind the backoff still belong to this rejection.
        self.state().last_auth_error = Some(Instant::now());
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Config backend
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn start_config(self: &Arc<Self>) -> Result<(), ProfileError> {
        let id = self.spec.id.clone();
        let engine = &self.engine;

        let keys = engine.wg.generate_keypair().await?;
        self.state().wg_public_key = keys.public_key.clone();
        self.update();

        let (bundle, hosts) = self.prepare_handshake();
        let auth = self.exchange_auth(&bundle.private_key);
        let token = self.attempt_token();
        let exchange = &engine.exchange;
        let auth_ref = &auth;

        let outcome = try_candidates(hosts, &self.stop, |host| {
            let device = self.device_info_box(&token, &self.spec.password, Some(keys.public_key.as_str()));
            async move { exchange.request_wg(&host, auth_ref, &device).await }
        })
        .await;

        let data = match outcome {
            CandidateOutcome::Success(data) => data,
            CandidateOutcome::Cancelled => {
                self.clear_status();
                return Ok(());
            }
            CandidateOutcome::Failed(e) => {
                self.handshake_failed(e).await;
                return Ok(());
            }
        };
        if self.is_stopped() {
            self.clear_status();
            return Ok(());
        }

        if !data.allow {
            log::error!("[{}] Gateway denied connection: {}", id, data.reason);
            self.emit(EventKind::AuthError);
            self.count_auth_error(WG_AUTH_ERROR_LIMIT).await;
            tokio::time::sleep(engine.config.timing.reset_wait()).await;
            self.clear_status();
            return Ok(());
        }

        let conf = data
            .configuration
            .ok_or_else(|| ProfileError::parse("Gateway returned no tunnel configuration"))?;

        let iface = engine.interfaces.acquire()?;
        self.state().iface = iface.clone();

        let conf_dir = engine.config.ensure_wg_conf_dir()?;
        let conf_path = self.record_artifact(write_conf(
            &conf_dir,
            &iface,
            &render_conf(&conf, &keys.private_key),
        )?);
        let key_path = if cfg!(target_os = "linux") && engine.wg.method() == WgApplyMethod::IpCommands {
            let dir = engine.config.ensure_secure_dir()?;
            Some(self.record_artifact(write_private_key(&dir, &id, &keys.private_key)?))
        } else {
            None
        };

        {
            let mut st = self.state();
            st.client_addr = conf.address.clone();
            st.server_addr = conf.hostname.clone();
            st.gateway_addr = conf.gateway.clone();
            st.gateway_addr6 = conf.gateway6.clone();
            st.web_port = conf.web_port;
            st.web_no_ssl = conf.web_no_ssl;
            st.routes = conf.routes.clone();
            st.routes6 = conf.routes6.clone();
            st.server_public_key = conf.public_key.clone();
            st.wg_conf = Some(conf_path.clone());
        }

        match engine.wg.apply(&iface, &conf, &conf_path, key_path.as_deref()).await {
            Ok(tun) => {
                self.state().tun_iface = tun.unwrap_or_default();
            }
            Err(e) => {
                log::error!("[{}] Failed to configure tunnel: {}", id, e);
                self.emit(EventKind::ConfigurationError);
                self.clear_status();
                return Ok(());
            }
        }
        self.update();

        let this = self.clone();
        engine.supervisor.spawn("health", &id, async move {
            this.watch_link().await;
            Ok(())
        });
        Ok(())
    }

    /// Health watcher of a config-mode tunnel. Always ends in teardown.
    async fn watch_link(self: Arc<Self>) {
        let probe = Arc::new(TunnelProbe {
            profile: self.clone(),
        });
        let timing = HealthTiming::default();

        match detect(&probe, &self.stop, &timing).await {
            DetectOutcome::Established(epoch) => {
                self.connected.store(true, Ordering::SeqCst);
                {
                    let mut st = self.state();
                    st.status = ProfileStatus::Connected;
                    st.timestamp = unix_now() - CONNECTED_SKEW;
                    st.handshake = epoch;
                }
                log::info!("[{}] Profile connected", self.spec.id);
                self.update();
                self.emit(EventKind::Connected);
                if let Some(token) = self.token() {
                    token.mark_valid();
                }
            }
            DetectOutcome::TimedOut => {
                log::error!("[{}] Handshake timeout", self.spec.id);
                self.emit(EventKind::HandshakeTimeout);
                self.spawn_restart(false);
                self.clear_status();
                return;
            }
            DetectOutcome::Stopped => {
                self.clear_status();
                return;
            }
            DetectOutcome::Failed(e) => {
                log::error!("[{}] Failed to read handshake: {}", self.spec.id, e);
                self.stop().await;
                self.clear_status();
                return;
            }
        }

        match maintain(probe.as_ref(), &self.stop, &timing).await {
            MaintainOutcome::Stopped => {}
            MaintainOutcome::KeepaliveFailed(e) => {
                log::error!("[{}] Keepalive failed: {}", self.spec.id, e);
                self.state().handshake = 0;
                self.spawn_restart(false);
            }
            MaintainOutcome::BadStatus => {
                log::error!("[{}] Gateway reported bad tunnel status", self.spec.id);
                self.state().handshake = 0;
                self.spawn_restart(false);
            }
        }
        self.clear_status();
    }

    /// Keepalive over the tunnel, carrying only the device identity.
    async fn ping(&self) -> Result<WgPingData, PingError> {
        let (gateway, web_port, web_no_ssl, auth, device) = {
            let st = self.state();
            let gateway = if st.gateway_addr.is_empty() {
                st.gateway_addr6.clone()
            } else {
                st.gateway_addr.clone()
            };
            let mut device = build_device_box(&DeviceInfo {
                device_id: st.device_id.as_deref(),
                device_name: st.device_name.as_deref(),
                token: "",
                password: "",
                mac_addr: &st.mac_addr,
                mac_addrs: &st.mac_addrs,
                wg_public_key: Some(&st.wg_public_key),
            });
            device.nonce.clear();
            (
                gateway,
                st.web_port,
                st.web_no_ssl,
                self.exchange_auth(&st.private_key),
                device,
            )
        };
        self.engine
            .exchange
            .ping(&gateway, web_port, web_no_ssl, &auth, &device)
            .await
    }
}

/// [`LinkProbe`] over the engine's wg tool and keepalive endpoint.
struct TunnelProbe {
    profile: Arc<Profile>,
}

#[async_trait]
impl LinkProbe for TunnelProbe {
    async fn handshake(&self) -> Result<i64, ProfileError> {
        let (iface, server_key) = {
            let st = self.profile.state();
            let iface = if st.tun_iface.is_empty() {
                st.iface.clone()
            } else {
                st.tun_iface.clone()
            };
            (iface, st.server_public_key.clone())
        };
        let epoch = self
            .profile
            .engine
            .wg
            .latest_handshake(&iface, &server_key)
            .await?;
        self.profile.state().handshake = epoch;
        Ok(epoch)
    }

    async fn ping(&self) -> Result<WgPingData, PingError> {
        self.profile.ping().await
    }
}
