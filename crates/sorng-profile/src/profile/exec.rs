//! OS command execution with logging and tolerated failures.

use crate::profile::types::ProfileError;
use std::ffi::{OsStr, OsString};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

fn render<S: AsRef<OsStr>>(program: &OsStr, args: &[S]) -> String {
    let mut line = program.to_string_lossy().into_owned();
    for a in args {
        line.push(' ');
        line.push_str(&a.as_ref().to_string_lossy());
    }
    line
}

fn combined(out: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&out.stderr));
    text
}

/// Run a command and return its combined output.
///
/// A non-zero exit is an error unless the output contains one of the
/// `tolerate` markers.
pub async fn run_logged<P, S>(tolerate: &[&str], program: P, args: &[S]) -> Result<String, ProfileError>
where
    P: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let line = render(program, args);

    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ProfileError::exec(format!("Failed to run {}", line)).with_detail(e.to_string()))?;

    let text = combined(&out);
    if out.status.success() {
        return Ok(text);
    }
    if tolerate.iter().any(|t| text.contains(t)) {
        log::debug!("Tolerated failure from '{}': {}", line, text.trim());
        return Ok(text);
    }

    log::error!("Command '{}' failed ({}): {}", line, out.status, text.trim());
    Err(ProfileError::exec(format!("Command failed: {}", line))
        .with_detail(format!("{}: {}", out.status, text.trim())))
}

/// Run a command for its side effect; the exit status is ignored.
pub async fn run_unchecked<P, S>(program: P, args: &[S])
where
    P: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    match Command::new(program).args(args).stdin(Stdio::null()).output().await {
        Ok(out) if !out.status.success() => {
            log::debug!("'{}' exited with {}", render(program, args), out.status)
        }
        Ok(_) => {}
        Err(e) => log::debug!("Failed to run '{}': {}", render(program, args), e),
    }
}

/// Run a command with `input` on stdin and return trimmed stdout.
pub async fn run_with_input<P, S>(program: P, args: &[S], input: &str) -> Result<String, ProfileError>
where
    P: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let program: OsString = program.as_ref().to_os_string();
    let line = render(&program, args);

    let mut child = Command::new(&program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProfileError::exec(format!("Failed to run {}", line)).with_detail(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| ProfileError::exec("Failed to write stdin").with_detail(e.to_string()))?;
    }

    let out = child
        .wait_with_output()
        .await
        .map_err(|e| ProfileError::exec(format!("Failed to wait {}", line)).with_detail(e.to_string()))?;

    if !out.status.success() {
        return Err(ProfileError::exec(format!("Command failed: {}", line))
            .with_detail(combined(&out).trim().to_string()));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::profile::types::ProfileErrorKind;

    #[tokio::test]
    async fn captures_output() {
        let out = run_logged(&[], "sh", &["-c", "echo hi; echo err >&2"]).await.unwrap();
        assert!(out.contains("hi"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn failure_is_exec_error() {
        let err = run_logged(&[], "sh", &["-c", "echo boom; exit 3"]).await.unwrap_err();
        assert_eq!(err.kind, ProfileErrorKind::Exec);
        assert!(err.detail.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn tolerated_failure_is_ok() {
        let out = run_logged(&["does not exist"], "sh", &["-c", "echo 'wg0 does not exist'; exit 1"])
            .await
            .unwrap();
        assert!(out.contains("does not exist"));
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let out = run_with_input("cat", &[] as &[&str], "secret-key\n").await.unwrap();
        assert_eq!(out, "secret-key");
    }
}
