//! Config-mode link health: handshake detection, then keepalive pings.

use crate::profile::keyexchange::PingError;
use crate::profile::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Observations the health loop needs from a running tunnel.
#[async_trait]
pub trait LinkProbe: Send + Sync {
    /// Latest handshake epoch with the gateway, 0 when none.
    async fn handshake(&self) -> Result<i64, ProfileError>;
    /// One keepalive round trip.
    async fn ping(&self) -> Result<WgPingData, PingError>;
}

/// Budgets of the health loop.
#[derive(Debug, Clone)]
pub struct HealthTiming {
    pub settle: Duration,
    pub poll_interval: Duration,
    pub polls: usize,
    /// A best-effort ping is fired on every n-th poll.
    pub ping_every: usize,
    pub keepalive_interval: Duration,
    pub ping_attempts: usize,
    pub ping_retry_wait: Duration,
}

impl Default for HealthTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            polls: 30,
            ping_every: 10,
            keepalive_interval: Duration::from_secs(10),
            ping_attempts: 4,
            ping_retry_wait: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub enum DetectOutcome {
    /// Handshake observed at this epoch.
    Established(i64),
    TimedOut,
    Stopped,
    Failed(ProfileError),
}

#[derive(Debug)]
pub enum MaintainOutcome {
    Stopped,
    KeepaliveFailed(PingError),
    BadStatus,
}

/// Sleep unless `stop` fires first; false when stopped.
async fn pause(stop: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

/// Poll for the first handshake.
pub async fn detect<P: LinkProbe + 'static>(
    probe: &Arc<P>,
    stop: &CancellationToken,
    timing: &HealthTiming,
) -> DetectOutcome {
    if !pause(stop, timing.settle).await {
        return DetectOutcome::Stopped;
    }

    for i in 0..timing.polls {
        if stop.is_cancelled() {
            return DetectOutcome::Stopped;
        }

        if timing.ping_every > 0 && i % timing.ping_every == 0 {
            let probe = probe.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    res = probe.ping() => {
                        if let Err(e) = res {
                            log::debug!("Early keepalive failed: {}", e);
                        }
                    }
                }
            });
        }

        let epoch = match probe.handshake().await {
            Ok(h) => h,
            Err(e) => return DetectOutcome::Failed(e),
        };
        if stop.is_cancelled() {
            return DetectOutcome::Stopped;
        }
        if epoch != 0 {
            return DetectOutcome::Established(epoch);
        }

        if !pause(stop, timing.poll_interval).await {
            return DetectOutcome::Stopped;
        }
    }

    DetectOutcome::TimedOut
}

/// Keep pinging until stopped or the link is judged dead.
pub async fn maintain<P: LinkProbe>(probe: &P, stop: &CancellationToken, timing: &HealthTiming) -> MaintainOutcome {
    loop {
        if !pause(stop, timing.keepalive_interval).await {
            return MaintainOutcome::Stopped;
        }

        let mut result = Err(PingError {
            retry: true,
            error: ProfileError::request("Keepalive not attempted"),
        });
        for attempt in 0..timing.ping_attempts {
            result = probe.ping().await;
            match &result {
                Err(e) if e.retry && attempt + 1 < timing.ping_attempts => {
                    if !pause(stop, timing.ping_retry_wait).await {
                        return MaintainOutcome::Stopped;
                    }
                }
                _ => break,
            }
        }

        let data = match result {
            Ok(data) => data,
            Err(e) => return MaintainOutcome::KeepaliveFailed(e),
        };
        if stop.is_cancelled() {
            return MaintainOutcome::Stopped;
        }
        if !data.status {
            return MaintainOutcome::BadStatus;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProbe {
        handshakes: Mutex<Vec<i64>>,
        pings: Mutex<Vec<Result<WgPingData, PingError>>>,
        handshake_calls: AtomicUsize,
        ping_calls: AtomicUsize,
    }

    impl FakeProbe {
        fn with_handshakes(h: Vec<i64>) -> Self {
            Self {
                handshakes: Mutex::new(h),
                ..Default::default()
            }
        }

        fn with_pings(p: Vec<Result<WgPingData, PingError>>) -> Self {
            Self {
                pings: Mutex::new(p),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl LinkProbe for FakeProbe {
        async fn handshake(&self) -> Result<i64, ProfileError> {
            self.handshake_calls.fetch_add(1, Ordering::SeqCst);
            let mut h = self.handshakes.lock().unwrap();
            Ok(if h.is_empty() { 0 } else { h.remove(0) })
        }

        async fn ping(&self) -> Result<WgPingData, PingError> {
            self.ping_calls.fetch_add(1, Ordering::SeqCst);
            let mut p = self.pings.lock().unwrap();
            if p.is_empty() {
                Ok(WgPingData { status: true, timestamp: 1 })
            } else {
                p.remove(0)
            }
        }
    }

    fn retryable() -> Result<WgPingData, PingError> {
        Err(PingError {
            retry: true,
            error: ProfileError::request("Bad status 502 code from server"),
        })
    }

    // ── Detect ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn handshake_on_third_poll() {
        let probe = Arc::new(FakeProbe::with_handshakes(vec![0, 0, 1_700_000_000]));
        let stop = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let out = detect(&probe, &stop, &HealthTiming::default()).await;

        assert!(matches!(out, DetectOutcome::Established(1_700_000_000)));
        assert_eq!(probe.handshake_calls.load(Ordering::SeqCst), 3);
        // settle + two poll intervals
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(2000) && elapsed < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_times_out() {
        let probe = Arc::new(FakeProbe::default());
        let stop = CancellationToken::new();

        let out = detect(&probe, &stop, &HealthTiming::default()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(out, DetectOutcome::TimedOut));
        assert_eq!(probe.handshake_calls.load(Ordering::SeqCst), 30);
        assert_eq!(probe.ping_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_detection() {
        let probe = Arc::new(FakeProbe::default());
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2200)).await;
            trigger.cancel();
        });

        let out = detect(&probe, &stop, &HealthTiming::default()).await;
        assert!(matches!(out, DetectOutcome::Stopped));
        assert!(probe.handshake_calls.load(Ordering::SeqCst) < 30);
    }

    // ── Maintain ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn bad_status_ends_loop() {
        let probe = FakeProbe::with_pings(vec![
            Ok(WgPingData { status: true, timestamp: 1 }),
            Ok(WgPingData { status: false, timestamp: 2 }),
        ]);
        let stop = CancellationToken::new();
        let out = maintain(&probe, &stop, &HealthTiming::default()).await;
        assert!(matches!(out, MaintainOutcome::BadStatus));
        assert_eq!(probe.ping_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_exhaust_attempts() {
        let probe = FakeProbe::with_pings(vec![retryable(), retryable(), retryable(), retryable()]);
        let stop = CancellationToken::new();
        let out = maintain(&probe, &stop, &HealthTiming::default()).await;
        assert!(matches!(out, MaintainOutcome::KeepaliveFailed(ref e) if e.retry));
        assert_eq!(probe.ping_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_then_recover() {
        let probe = FakeProbe::with_pings(vec![
            retryable(),
            Ok(WgPingData { status: true, timestamp: 1 }),
            Ok(WgPingData { status: false, timestamp: 2 }),
        ]);
        let stop = CancellationToken::new();
        let out = maintain(&probe, &stop, &HealthTiming::default()).await;
        assert!(matches!(out, MaintainOutcome::BadStatus));
        assert_eq!(probe.ping_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_failure_is_not_retried() {
        let probe = FakeProbe::with_pings(vec![Err(PingError {
            retry: false,
            error: ProfileError::request("Bad status 403 code from server"),
        })]);
        let stop = CancellationToken::new();
        let out = maintain(&probe, &stop, &HealthTiming::default()).await;
        assert!(matches!(out, MaintainOutcome::KeepaliveFailed(ref e) if !e.retry));
        assert_eq!(probe.ping_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_silently() {
        let probe = FakeProbe::default();
        let stop = CancellationToken::new();
        stop.cancel();
        let out = maintain(&probe, &stop, &HealthTiming::default()).await;
        assert!(matches!(out, MaintainOutcome::Stopped));
        assert_eq!(probe.ping_calls.load(Ordering::SeqCst), 0);
    }
}
