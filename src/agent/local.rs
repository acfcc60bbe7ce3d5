use crate::error::{PghaError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Network reachability of a host
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn reachable(&self, host: &str) -> bool;
}

/// Fencing of a shared-storage node before another node takes over
#[async_trait]
pub trait Fencer: Send + Sync {
    /// Run the fencing command and return its exit code
    async fn fence(&self, command: &str) -> Result<i32>;
}

/// Uses the system `ping` binary
pub struct CommandPinger {
    count: u32,
    timeout: Duration,
}

impl CommandPinger {
    pub fn new(count: u32, timeout: Duration) -> Self {
        Self {
            count: count.max(1),
            timeout,
        }
    }
}

#[async_trait]
impl Pinger for CommandPinger {
    async fn reachable(&self, host: &str) -> bool {
        let wait = self.timeout.as_secs().max(1).to_string();
        let status = Command::new("ping")
            .arg("-c")
            .arg(self.count.to_string())
            .arg("-W")
            .arg(&wait)
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        let budget = self.timeout * (self.count + 1);
        match tokio::time::timeout(budget, status).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!("ping {} could not run: {}", host, e);
                false
            }
            Err(_) => {
                debug!("ping {} timed out", host);
                false
            }
        }
    }
}

/// Runs fencing commands through `sh -c`
pub struct ShellFencer {
    timeout: Duration,
}

impl ShellFencer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Fencer for ShellFencer {
    async fn fence(&self, command: &str) -> Result<i32> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| {
                PghaError::Internal(format!(
                    "fencing command timed out after {:?}: {}",
                    self.timeout, command
                ))
            })??;
        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            warn!(
                "fencing command exited with {}: {}",
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(code)
    }
}
