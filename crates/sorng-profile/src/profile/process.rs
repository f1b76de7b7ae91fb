//! Backend process lifecycle: arguments, spawn, output pump, signals.

use crate::profile::exec;
use crate::profile::scripts::HookPaths;
use crate::profile::types::*;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};

/// Capacity of the output queue shared by both reader tasks.
pub const OUTPUT_QUEUE: usize = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Argument builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Artifacts a launch refers to.
#[derive(Debug, Clone, Default)]
pub struct LaunchArgs<'a> {
    pub config: Option<&'a Path>,
    pub auth: Option<&'a Path>,
    pub hooks: Option<&'a HookPaths>,
    pub block: Option<&'a Path>,
    /// Windows tap adapter.
    pub tap: Option<&'a str>,
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Build the backend command line for the current platform.
pub fn build_args(l: &LaunchArgs<'_>) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if let Some(cfg) = l.config {
        args.push("--config".into());
        args.push(path_arg(cfg));
    }
    args.push("--verb".into());
    args.push("2".into());

    if cfg!(target_os = "windows") {
        args.push("--script-security".into());
        args.push("1".into());
        if let Some(tap) = l.tap {
            args.push("--dev-node".into());
            args.push(tap.to_string());
        }
    } else {
        args.push("--script-security".into());
        args.push("2".into());
        if let Some(h) = l.hooks {
            args.push("--up".into());
            args.push(path_arg(&h.up));
            args.push("--down".into());
            args.push(path_arg(&h.down));
        }
        if let Some(block) = l.block {
            let block = path_arg(block);
            for flag in ["--route-pre-down", "--tls-verify", "--ipchange", "--route-up"] {
                args.push(flag.into());
                args.push(block.clone());
            }
        }
    }

    if let Some(auth) = l.auth {
        args.push("--auth-user-pass".into());
        args.push(path_arg(auth));
    }

    args
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Process handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A spawned backend process.
pub struct BackendProcess {
    pid: u32,
    exit: watch::Receiver<Option<Option<i32>>>,
}

impl BackendProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for exit and return the exit code, if the OS reported one.
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.exit.clone();
        let code = match rx.wait_for(|v| v.is_some()).await {
            Ok(v) => (*v).flatten(),
            Err(_) => None,
        };
        code
    }

    /// Wait at most `limit` for exit; true when the process is gone.
    pub async fn wait_exit_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_exit()).await.is_ok()
    }

    /// Ask the process to shut down. Unsupported on Windows, where the
    /// management channel is used instead.
    pub async fn interrupt(&self) -> Result<(), ProfileError> {
        if cfg!(target_os = "windows") {
            return Err(ProfileError::exec("Interrupt not supported on this platform"));
        }
        if self.has_exited() {
            return Ok(());
        }
        exec::run_logged(&["No such process"], "kill", &["-INT", &self.pid.to_string()]).await?;
        Ok(())
    }

    /// Force the process down.
    pub async fn kill(&self) -> Result<(), ProfileError> {
        if self.has_exited() {
            return Ok(());
        }
        let pid = self.pid.to_string();
        if cfg!(target_os = "windows") {
            exec::run_logged(&["not found"], "taskkill", &["/F", "/PID", &pid]).await?;
        } else {
            exec::run_logged(&["No such process"], "kill", &["-KILL", &pid]).await?;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Spawn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn pump<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forward = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if !forward {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if line.is_empty() {
                    continue;
                }
                // Keep draining after the consumer is gone so the pipe never fills.
                if tx.send(line).await.is_err() {
                    forward = false;
                }
            }
        }
    }
}

/// Spawn the backend with piped output.
///
/// Returns the handle and the output queue. The queue closes once both
/// output streams have reached end of file.
pub async fn spawn_backend(
    binary: &Path,
    args: &[String],
    work_dir: Option<&Path>,
) -> Result<(Arc<BackendProcess>, mpsc::Receiver<String>), ProfileError> {
    let mut cmd = tokio::process::Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = work_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        ProfileError::exec(format!("Failed to start {}", binary.display())).with_detail(e.to_string())
    })?;
    let pid = child.id().unwrap_or(0);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProfileError::exec("Failed to get stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProfileError::exec("Failed to get stderr"))?;

    let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
    tokio::spawn(pump(stdout, tx.clone()));
    tokio::spawn(pump(stderr, tx));

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                log::error!("Failed to wait for backend {}: {}", pid, e);
                None
            }
        };
        let _ = exit_tx.send(Some(code));
    });

    log::info!("Backend started (pid {})", pid);
    Ok((Arc::new(BackendProcess { pid, exit: exit_rx }), rx))
}
