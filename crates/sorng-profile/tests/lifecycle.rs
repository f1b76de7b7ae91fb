//! End-to-end lifecycle of process-mode profiles against `sh` stand-ins
//! for the backend binary.
#![cfg(unix)]

use async_trait::async_trait;
use serial_test::serial;
use sorng_profile::profile::collaborators::Platform;
use sorng_profile::profile::*;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

struct QuietPlatform;

#[async_trait]
impl Platform for QuietPlatform {
    async fn clear_dns_cache(&self) -> Result<(), ProfileError> {
        Ok(())
    }
    async fn clear_scutil_keys(&self) -> Result<(), ProfileError> {
        Ok(())
    }
    async fn restore_scutil_dns(&self) -> Result<(), ProfileError> {
        Ok(())
    }
    fn mac_addresses(&self) -> (String, Vec<String>) {
        (String::new(), Vec::new())
    }
    fn uses_systemd_resolved(&self) -> bool {
        false
    }
}

const CONNECTS_AND_WAITS: &str = r#"#!/bin/sh
trap 'echo "SIGINT received, process exiting"; exit 0' INT
echo "UDPv4 link remote: [AF_INET]203.0.113.7:1194"
echo "net_addr_v4_add: 10.8.0.22/24 dev tun0"
echo "Initialization Sequence Completed"
while true; do sleep 0.1; done
"#;

const NEVER_CONNECTS: &str = r#"#!/bin/sh
trap 'exit 0' INT
echo "UDPv4 link remote: [AF_INET]203.0.113.7:1194"
while true; do sleep 0.1; done
"#;

const REJECTED: &str = r#"#!/bin/sh
echo "AUTH: Received control message: AUTH_FAILED"
exit 1
"#;

struct Fixture {
    engine: Arc<Engine>,
    events: mpsc::UnboundedReceiver<Event>,
    secure: PathBuf,
    dir: tempfile::TempDir,
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn fixture(script: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let backend = write_script(dir.path(), "backend.sh", script);
    let secure = dir.path().join("secure");

    let config = EngineConfig {
        secure_dir: secure.clone(),
        openvpn_path: Some(backend),
        timing: TimingConfig {
            connect_timeout_ms: 2_000,
            min_connection_age_ms: 1_500,
            teardown_floor_ms: 100,
            stop_grace_ms: 1_000,
            stop_wait_ms: 2_000,
            reset_wait_ms: 100,
            start_delay_ms: 100,
            watchdog_kill_grace_ms: 500,
            ..Default::default()
        },
        ..Default::default()
    };

    let (sink, events) = ChannelSink::new();
    let (engine, _faults) = Engine::new(config, Arc::new(sink)).unwrap();
    let engine = Arc::new(engine.with_platform(Arc::new(QuietPlatform)));
    Fixture {
        engine,
        events,
        secure,
        dir,
    }
}

fn spec(id: &str) -> ProfileSpec {
    ProfileSpec {
        id: id.into(),
        data: "client\nremote 198.51.100.1 1194 udp\n".into(),
        username: "alice".into(),
        password: "secret".into(),
        ..Default::default()
    }
}

/// Next event of `kind`, skipping everything else.
async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>, kind: EventKind) -> Event {
    timeout(Duration::from_secs(10), async {
        loop {
            let ev = rx.recv().await.expect("event channel closed");
            if ev.kind == kind {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

// ── Connect / stop ───────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn connects_then_stops_cleanly() {
    let mut fx = fixture(CONNECTS_AND_WAITS);
    let prfl = fx.engine.profile(spec("p1"));
    prfl.start(false, false).await.unwrap();
    assert!(prfl.is_active());

    let ev = next_event(&mut fx.events, EventKind::Connected).await;
    let snap = ev.snapshot().unwrap();
    assert_eq!(snap.status, ProfileStatus::Connected);
    assert_eq!(snap.server_addr, "203.0.113.7");
    assert_eq!(snap.client_addr, "10.8.0.22");

    // Artifacts exist while connected.
    assert!(fx.secure.join("p1").exists());
    assert!(fx.secure.join("p1.auth").exists());

    prfl.stop().await;
    prfl.wait().await;

    let rest = drain(&mut fx.events);
    let disconnects = rest
        .iter()
        .filter(|e| e.kind == EventKind::Disconnected)
        .count();
    assert_eq!(disconnects, 1);
    assert!(!prfl.is_active());
    assert!(fx.engine.registry().is_empty());
    assert!(!fx.secure.join("p1").exists());
    assert!(!fx.secure.join("p1.auth").exists());
}

#[tokio::test]
#[serial]
async fn stop_waits_for_minimum_age() {
    let fx = fixture(CONNECTS_AND_WAITS);
    let prfl = fx.engine.profile(spec("p2"));
    let started = Instant::now();
    prfl.start(false, false).await.unwrap();

    prfl.stop().await;
    assert!(started.elapsed() >= Duration::from_millis(1_500));
    prfl.wait().await;
    assert!(!prfl.is_active());
}

#[tokio::test]
#[serial]
async fn duplicate_start_is_ignored() {
    let fx = fixture(CONNECTS_AND_WAITS);
    let first = fx.engine.profile(spec("p3"));
    let second = fx.engine.profile(spec("p3"));

    first.start(false, false).await.unwrap();
    second.start(false, false).await.unwrap();

    assert!(first.is_active());
    assert!(!second.is_active());
    assert_eq!(fx.engine.registry().len(), 1);

    fx.engine.shutdown().await;
    assert!(!first.is_active());
    assert!(fx.engine.registry().is_empty());
}

// ── Backend failures ─────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn watchdog_gives_up_on_silent_backend() {
    let mut fx = fixture(NEVER_CONNECTS);
    let prfl = fx.engine.profile(spec("p6"));
    let started = Instant::now();
    prfl.start(true, false).await.unwrap();

    next_event(&mut fx.events, EventKind::TimeoutError).await;
    assert!(started.elapsed() >= Duration::from_millis(2_000));
    timeout(Duration::from_secs(10), prfl.wait()).await.unwrap();

    assert!(!prfl.is_connected());
    assert!(fx.engine.registry().is_empty());
    let rest = drain(&mut fx.events);
    assert!(!rest.iter().any(|e| e.kind == EventKind::Connected));
}

#[tokio::test]
#[serial]
async fn auth_failure_tears_down_without_restart() {
    let mut fx = fixture(REJECTED);
    let prfl = fx.engine.profile(ProfileSpec {
        reconnect: true,
        ..spec("p4")
    });
    prfl.start(false, false).await.unwrap();

    next_event(&mut fx.events, EventKind::AuthError).await;
    timeout(Duration::from_secs(10), prfl.wait()).await.unwrap();

    assert!(prfl.is_stopped());
    assert!(fx.engine.registry().is_empty());
    let rest = drain(&mut fx.events);
    assert!(!rest.iter().any(|e| e.kind == EventKind::Connected));
}

#[tokio::test]
#[serial]
async fn connection_reset_restarts_from_copy() {
    let marker = tempfile::tempdir().unwrap();
    let flag = marker.path().join("ran-once");
    let script = format!(
        r#"#!/bin/sh
trap 'exit 0' INT
if [ ! -f "{flag}" ]; then
  touch "{flag}"
  echo "Initialization Sequence Completed"
  echo "Connection reset, restarting [0]"
else
  echo "Initialization Sequence Completed"
fi
while true; do sleep 0.1; done
"#,
        flag = flag.display()
    );
    let mut fx = fixture(&script);
    let prfl = fx.engine.profile(ProfileSpec {
        reconnect: true,
        ..spec("p5")
    });
    prfl.start(false, false).await.unwrap();

    next_event(&mut fx.events, EventKind::Connected).await;
    next_event(&mut fx.events, EventKind::Disconnected).await;
    next_event(&mut fx.events, EventKind::Connected).await;

    let current = fx.engine.registry().get("p5").unwrap();
    assert!(!Arc::ptr_eq(&current, &prfl));
    assert!(prfl.is_stopped());
    assert!(current.is_connected());

    fx.engine.shutdown().await;
    assert!(fx.engine.registry().is_empty());
    drop(fx.dir);
}
