//! Engine: shared collaborators, the registry, and engine-wide operations.

use crate::profile::collaborators::*;
use crate::profile::config::{EngineConfig, ProfileSpec};
use crate::profile::connection::Profile;
use crate::profile::events::{Event, EventSink};
use crate::profile::keyexchange::{Gateway, KeyExchange};
use crate::profile::registry::Registry;
use crate::profile::supervisor::{Supervisor, TaskFault};
use crate::profile::types::*;
use crate::profile::wireguard::{Tunnel, WgTool};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Process-wide state shared by every profile.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<Registry<Profile>>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) supervisor: Supervisor,
    /// Serializes restart decisions across profiles.
    pub(crate) restart_lock: Mutex<()>,
    pub(crate) exchange: Arc<dyn Gateway>,
    pub(crate) wg: Arc<dyn Tunnel>,
    pub(crate) tokens: Arc<dyn TokenStore>,
    pub(crate) interfaces: Arc<dyn InterfacePool>,
    pub(crate) ports: Arc<dyn PortPool>,
    pub(crate) taps: Arc<dyn TapPool>,
    pub(crate) renderer: Arc<dyn BundleRenderer>,
    pub(crate) system_profiles: Arc<dyn SystemProfileStore>,
    pub(crate) platform: Arc<dyn Platform>,
}

impl Engine {
    /// Build an engine with the in-process default collaborators.
    ///
    /// The receiver yields every background-task failure.
    pub fn new(
        config: EngineConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TaskFault>), ProfileError> {
        config.ensure_secure_dir()?;
        let exchange = KeyExchange::new(&config)?;
        let (supervisor, faults) = Supervisor::new();

        let engine = Self {
            registry: Arc::new(Registry::new()),
            events,
            supervisor,
            restart_lock: Mutex::new(()),
            exchange: Arc::new(exchange),
            wg: Arc::new(WgTool::new(&config)),
            tokens: Arc::new(MemoryTokenStore::default()),
            interfaces: Arc::new(SequentialInterfacePool::new(
                config.interface_prefix.clone(),
                config.interface_count,
            )),
            ports: Arc::new(LocalPortPool::default()),
            taps: Arc::new(StaticTapPool::new(config.tap_adapters.clone())),
            renderer: Arc::new(PassthroughRenderer),
            system_profiles: Arc::new(MemorySystemProfiles::default()),
            platform: Arc::new(HostPlatform),
            config,
        };
        Ok((engine, faults))
    }

    pub fn with_registry(mut self, registry: Arc<Registry<Profile>>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.exchange = gateway;
        self
    }

    pub fn with_tunnel(mut self, tunnel: Arc<dyn Tunnel>) -> Self {
        self.wg = tunnel;
        self
    }

    pub fn with_token_store(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_interface_pool(mut self, pool: Arc<dyn InterfacePool>) -> Self {
        self.interfaces = pool;
        self
    }

    pub fn with_port_pool(mut self, pool: Arc<dyn PortPool>) -> Self {
        self.ports = pool;
        self
    }

    pub fn with_tap_pool(mut self, pool: Arc<dyn TapPool>) -> Self {
        self.taps = pool;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn BundleRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_system_profiles(mut self, store: Arc<dyn SystemProfileStore>) -> Self {
        self.system_profiles = store;
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry<Profile>> {
        &self.registry
    }

    /// Create a profile bound to this engine. It is not started.
    pub fn profile(self: &Arc<Self>, spec: ProfileSpec) -> Arc<Profile> {
        Profile::new(self.clone(), spec)
    }

    pub(crate) fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    /// Restart every registered profile, each from a fresh copy with the
    /// start delay applied.
    pub fn restart_all(self: &Arc<Self>) {
        for prfl in self.registry.list() {
            let id = prfl.id().to_string();
            self.supervisor.spawn("restart_all", &id, async move {
                prfl.restart(true).await;
                Ok(())
            });
        }
    }

    /// Refuse new starts, then stop and wait every active profile.
    pub async fn shutdown(&self) {
        let active = self.registry.shutdown();
        log::info!("Shutting down {} profile(s)", active.len());
        futures::future::join_all(active.iter().map(|p| async move {
            p.stop().await;
            p.wait().await;
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::events::ChannelSink;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            secure_dir: dir.join("secure"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_creates_secure_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = ChannelSink::new();
        let (engine, _faults) = Engine::new(test_config(dir.path()), Arc::new(sink)).unwrap();
        assert!(dir.path().join("secure").is_dir());
        assert!(engine.registry().is_empty());
    }

    #[tokio::test]
    async fn shared_registry_is_injected() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = ChannelSink::new();
        let registry = Arc::new(Registry::new());
        let (engine, _faults) = Engine::new(test_config(dir.path()), Arc::new(sink)).unwrap();
        let engine = engine.with_registry(registry.clone());
        assert!(Arc::ptr_eq(engine.registry(), &registry));
    }

    #[tokio::test]
    async fn shutdown_blocks_new_starts() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = ChannelSink::new();
        let (engine, _faults) = Engine::new(test_config(dir.path()), Arc::new(sink)).unwrap();
        let engine = Arc::new(engine);
        engine.shutdown().await;

        let prfl = engine.profile(ProfileSpec {
            id: "p1".into(),
            ..Default::default()
        });
        prfl.start(false, false).await.unwrap();
        assert!(engine.registry().is_empty());
        assert!(!prfl.is_active());
    }
}
