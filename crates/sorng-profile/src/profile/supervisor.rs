//! Spawns background tasks and reports their failures to one handler.

use crate::profile::types::ProfileError;
use std::future::Future;
use tokio::sync::mpsc;

/// A failed or panicked background task.
#[derive(Debug, Clone)]
pub struct TaskFault {
    pub task: &'static str,
    pub profile_id: String,
    pub message: String,
    pub panicked: bool,
}

impl std::fmt::Display for TaskFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = if self.panicked { "panicked" } else { "failed" };
        write!(f, "[{}] task {} {}: {}", self.profile_id, self.task, what, self.message)
    }
}

/// Owns the fault channel for every supervised task.
#[derive(Clone)]
pub struct Supervisor {
    faults: mpsc::UnboundedSender<TaskFault>,
}

impl Supervisor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskFault>) {
        let (faults, rx) = mpsc::unbounded_channel();
        (Self { faults }, rx)
    }

    /// Run `fut` on the runtime; an error or panic becomes a [`TaskFault`].
    pub fn spawn<F>(&self, task: &'static str, profile_id: &str, fut: F)
    where
        F: Future<Output = Result<(), ProfileError>> + Send + 'static,
    {
        let faults = self.faults.clone();
        let profile_id = profile_id.to_string();
        let inner = tokio::spawn(fut);

        tokio::spawn(async move {
            let fault = match inner.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => TaskFault {
                    task,
                    profile_id,
                    message: e.to_string(),
                    panicked: false,
                },
                Err(join) if join.is_panic() => {
                    let payload = join.into_panic();
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    TaskFault {
                        task,
                        profile_id,
                        message,
                        panicked: true,
                    }
                }
                Err(_) => return,
            };

            log::error!("{}", fault);
            let _ = faults.send(fault);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_becomes_fault() {
        let (sup, mut rx) = Supervisor::new();
        sup.spawn("probe", "p1", async { Err(ProfileError::exec("boom")) });
        let fault = rx.recv().await.unwrap();
        assert_eq!(fault.task, "probe");
        assert_eq!(fault.profile_id, "p1");
        assert!(fault.message.contains("boom"));
        assert!(!fault.panicked);
    }

    #[tokio::test]
    async fn panic_becomes_fault() {
        let (sup, mut rx) = Supervisor::new();
        let explode = true;
        sup.spawn("watch", "p2", async move {
            if explode {
                panic!("exploded");
            }
            Ok(())
        });
        let fault = rx.recv().await.unwrap();
        assert!(fault.panicked);
        assert_eq!(fault.message, "exploded");
    }

    #[tokio::test]
    async fn success_is_silent() {
        let (sup, mut rx) = Supervisor::new();
        sup.spawn("ok", "p3", async { Ok(()) });
        sup.spawn("bad", "p3", async { Err(ProfileError::read("x")) });
        let fault = rx.recv().await.unwrap();
        assert_eq!(fault.task, "bad");
    }
}
