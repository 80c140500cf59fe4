//! SSH command channel to the pivot host
//!
//! Every call opens, authenticates and closes its own SSH connection. Runs
//! issue only a handful of remote operations, and a fresh connection per call
//! means nothing is left holding the remote shell once the agent is detached.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;

use ap_core::{CommandKind, Credential, RemoteError, RunJournal, Target};

/// Executes commands and uploads files on the remote host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command remotely and return its stdout lines
    ///
    /// With `fail_on_stderr`, any non-empty stderr output fails the call with
    /// [`RemoteError::Execution`].
    async fn execute(&self, command: &str, fail_on_stderr: bool)
        -> Result<Vec<String>, RemoteError>;

    /// Upload `local` into `remote_dir`, keeping its file name
    ///
    /// Returns the remote path written.
    async fn transfer(&self, local: &Path, remote_dir: &str) -> Result<String, RemoteError>;

    /// Host this executor talks to, for log lines
    fn host(&self) -> &str;
}

/// Deadlines applied to each remote operation
#[derive(Debug, Clone, Copy)]
pub struct ChannelTimeouts {
    /// Connect + authenticate
    pub connect: Duration,
    /// Reading a command's output to completion
    pub command: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            command: Duration::from_secs(120),
        }
    }
}

/// Output of one remote command
#[derive(Debug, Default)]
struct CommandOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
}

/// [`RemoteExecutor`] over russh
pub struct SshChannel {
    target: Target,
    timeouts: ChannelTimeouts,
    journal: RunJournal,
}

impl SshChannel {
    /// Create a channel descriptor; no connection is made until first use
    pub fn new(target: Target, timeouts: ChannelTimeouts, journal: RunJournal) -> Self {
        Self {
            target,
            timeouts,
            journal,
        }
    }

    /// Connect and authenticate once, then disconnect
    ///
    /// Surfaces bad credentials before any local state is created.
    pub async fn check_login(&self) -> Result<(), RemoteError> {
        let handle = self.connect().await?;
        close(handle).await;
        tracing::info!(
            host = %self.target.host,
            user = %self.target.user,
            method = self.target.credential.method(),
            "SSH authentication succeeded"
        );
        Ok(())
    }

    async fn connect(&self) -> Result<Handle<ClientHandler>, RemoteError> {
        let seconds = self.timeouts.connect.as_secs();
        tokio::time::timeout(self.timeouts.connect, self.connect_inner())
            .await
            .map_err(|_| RemoteError::Timeout {
                what: format!("SSH connection to {}", self.target.address()),
                seconds,
            })?
    }

    async fn connect_inner(&self) -> Result<Handle<ClientHandler>, RemoteError> {
        let config = Arc::new(Config::default());
        let address = self.target.address();

        tracing::debug!("Connecting to {}", address);
        let mut handle = client::connect(config, address.as_str(), ClientHandler)
            .await
            .map_err(|e| RemoteError::Connection {
                host: address.clone(),
                reason: e.to_string(),
            })?;

        let user = self.target.user.as_str();
        let authenticated = match &self.target.credential {
            Credential::Password(password) => handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| self.auth_error(e.to_string()))?,
            Credential::PrivateKey(path) => {
                let key = russh_keys::load_secret_key(path, None).map_err(|e| {
                    RemoteError::KeyNotFound {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                handle
                    .authenticate_publickey(user, Arc::new(key))
                    .await
                    .map_err(|e| self.auth_error(e.to_string()))?
            }
        };

        if !authenticated {
            return Err(self.auth_error(format!(
                "{} authentication rejected",
                self.target.credential.method()
            )));
        }

        Ok(handle)
    }

    fn auth_error(&self, reason: String) -> RemoteError {
        RemoteError::Authentication {
            user: self.target.user.clone(),
            host: self.target.host.clone(),
            reason,
        }
    }

    async fn run(
        &self,
        handle: &Handle<ClientHandler>,
        command: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let exec_error = |reason: String| RemoteError::Execution {
            command: command.to_string(),
            stderr: reason,
        };

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| exec_error(format!("failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| exec_error(format!("failed to execute: {}", e)))?;

        let read = async {
            let mut output = CommandOutput::default();
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        output.stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        output.exit_status = Some(exit_status)
                    }
                    // ExitStatus may arrive after Eof, keep reading until close
                    _ => {}
                }
            }
            output
        };

        tokio::time::timeout(self.timeouts.command, read)
            .await
            .map_err(|_| RemoteError::Timeout {
                what: format!("remote command `{}`", command),
                seconds: self.timeouts.command.as_secs(),
            })
    }
}

#[async_trait]
impl RemoteExecutor for SshChannel {
    async fn execute(
        &self,
        command: &str,
        fail_on_stderr: bool,
    ) -> Result<Vec<String>, RemoteError> {
        self.journal.record(CommandKind::Remote, command);
        tracing::debug!("Executing {} on host {}", command, self.target.host);

        let handle = self.connect().await?;
        let result = self.run(&handle, command).await;
        close(handle).await;
        let output = result?;

        check_stderr(command, &output.stderr, fail_on_stderr)?;

        let lines = split_lines(&output.stdout);
        tracing::debug!(
            "{} exited with {:?}, {} line(s)",
            command,
            output.exit_status,
            lines.len()
        );
        Ok(lines)
    }

    async fn transfer(&self, local: &Path, remote_dir: &str) -> Result<String, RemoteError> {
        let remote_path = remote_file_path(local, remote_dir)?;
        tracing::info!(
            "Copying file: {} -> {}:{}",
            local.display(),
            self.target.host,
            remote_path
        );

        let transfer_error = |reason: String| RemoteError::Transfer {
            path: remote_path.clone(),
            reason,
        };

        let contents = tokio::fs::read(local)
            .await
            .map_err(|e| transfer_error(format!("failed to read {}: {}", local.display(), e)))?;

        let handle = self.connect().await?;
        let upload = async {
            let channel = handle
                .channel_open_session()
                .await
                .map_err(|e| transfer_error(format!("failed to open channel: {}", e)))?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| transfer_error(format!("failed to request sftp: {}", e)))?;
            let sftp = SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| transfer_error(format!("failed to start sftp: {}", e)))?;

            let mut file = sftp
                .create(remote_path.as_str())
                .await
                .map_err(|e| transfer_error(e.to_string()))?;
            file.write_all(&contents)
                .await
                .map_err(|e| transfer_error(e.to_string()))?;
            file.shutdown()
                .await
                .map_err(|e| transfer_error(e.to_string()))?;
            let _ = sftp.close().await;
            Ok::<(), RemoteError>(())
        };
        let result = upload.await;
        close(handle).await;
        result?;

        tracing::debug!("Uploaded {} bytes to {}", contents.len(), remote_path);
        Ok(remote_path)
    }

    fn host(&self) -> &str {
        &self.target.host
    }
}

/// Fail when `fail_on_stderr` is set and the command wrote anything but
/// whitespace to stderr
fn check_stderr(command: &str, stderr: &[u8], fail_on_stderr: bool) -> Result<(), RemoteError> {
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    if stderr.is_empty() {
        return Ok(());
    }
    if fail_on_stderr {
        tracing::error!("Error in command {}:\n{}", command, stderr);
        return Err(RemoteError::Execution {
            command: command.to_string(),
            stderr,
        });
    }
    tracing::debug!("{} wrote to stderr: {}", command, stderr);
    Ok(())
}

/// Remote destination for an upload: `<dir>/<file name>`
fn remote_file_path(local: &Path, remote_dir: &str) -> Result<String, RemoteError> {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| RemoteError::Transfer {
            path: local.display().to_string(),
            reason: "not a file path".to_string(),
        })?;
    let dir = remote_dir.trim_end_matches('/');
    if dir.is_empty() {
        Ok(format!("/{}", name))
    } else {
        Ok(format!("{}/{}", dir, name))
    }
}

fn split_lines(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

async fn close(handle: Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        tracing::debug!("SSH disconnect failed: {}", e);
    }
}

/// SSH client handler
///
/// The pivot host is already under the operator's control; its host key is
/// accepted and logged.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Server host key: {}", server_public_key.fingerprint());
        Ok(true)
    }
}
