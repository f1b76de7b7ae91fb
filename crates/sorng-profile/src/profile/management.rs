//! Backend management interface: password file, config directive, and
//! one-shot password-authenticated commands.

use crate::profile::auth::write_artifact;
use crate::profile::device::rand_str;
use crate::profile::types::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(3);
const PASSWORD_PAUSE: Duration = Duration::from_millis(500);

/// Management endpoint of one running backend.
#[derive(Debug, Clone)]
pub struct ManagementChannel {
    pub port: u16,
    password: String,
    pub password_path: PathBuf,
}

impl ManagementChannel {
    /// Generate a 32-char password and persist it owner-only.
    pub fn create(dir: &Path, id: &str, port: u16) -> Result<Self, ProfileError> {
        let password = rand_str(32);
        let name = if cfg!(target_os = "windows") {
            format!("{}-management.txt", id)
        } else {
            format!("{}-management", id)
        };
        let password_path = write_artifact(&dir.join(name), &password, 0o600)?;
        Ok(Self {
            port,
            password,
            password_path,
        })
    }

    /// Config line that enables the interface on loopback.
    pub fn directive(&self) -> String {
        format!(
            "management 127.0.0.1 {} {}",
            self.port,
            self.password_path.display()
        )
    }

    /// Send `cmd` after authenticating with the password.
    pub async fn send_command(&self, cmd: &str) -> Result<(), ProfileError> {
        let addr = format!("127.0.0.1:{}", self.port);
        let stream = tokio::time::timeout(SOCKET_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProfileError::read("Failed to open socket").with_detail("connect timed out"))?
            .map_err(|e| ProfileError::read("Failed to open socket").with_detail(e.to_string()))?;

        let (mut reader, mut writer) = stream.into_split();

        // Drain whatever the backend prints so its writes never block.
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 10_000];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let result = async {
            write_line(&mut writer, &self.password)
                .await
                .map_err(|e| ProfileError::read("Failed to write socket password").with_detail(e))?;
            tokio::time::sleep(PASSWORD_PAUSE).await;
            write_line(&mut writer, cmd)
                .await
                .map_err(|e| ProfileError::read("Failed to write socket command").with_detail(e))
        }
        .await;

        drain.abort();
        result
    }

    /// Ask the backend to shut down gracefully.
    pub async fn signal_sigterm(&self) -> Result<(), ProfileError> {
        self.send_command("signal SIGTERM").await
    }
}

async fn write_line(writer: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) -> Result<(), String> {
    tokio::time::timeout(SOCKET_TIMEOUT, writer.write_all(format!("{}\n", line).as_bytes()))
        .await
        .map_err(|_| "write timed out".to_string())?
        .map_err(|e| e.to_string())
}
