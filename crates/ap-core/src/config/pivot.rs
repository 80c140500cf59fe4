//! Pivot run configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{deadline_secs, duration_secs};

/// Tunable settings for a pivot run
///
/// Everything here is operator policy rather than per-target input; target
/// host, user and credential always come from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PivotConfig {
    /// Tunnel agent binary copied to the remote host
    pub agent_binary: PathBuf,

    /// Local tunnel console binary
    pub console_binary: PathBuf,

    /// Directory holding one journal file per session id
    pub state_dir: PathBuf,

    /// Remote routes whose line contains any of these substrings are skipped
    pub route_exclude: Vec<String>,

    /// Skip host (`/32`) routes
    pub skip_host_routes: bool,

    /// Console listen port is `base_port + session id`; listener ports are
    /// `base_port + 1 ..= base_port + n`
    pub base_port: u16,

    /// Interface name is this prefix followed by the session id
    pub interface_prefix: String,

    /// Delay before the remote agent dials back
    #[serde(with = "duration_secs")]
    pub agent_start_delay: Duration,

    /// Keep installing routes after one fails
    pub tolerate_route_errors: bool,

    /// SSH connect + authenticate deadline
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Deadline for a single remote or local command
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// How long console automation waits for each marker; `0` waits forever
    #[serde(with = "deadline_secs")]
    pub agent_join_timeout: Option<Duration>,
}

impl Default for PivotConfig {
    fn default() -> Self {
        Self {
            agent_binary: PathBuf::from("/opt/ligolo-ng/agentlin64"),
            console_binary: PathBuf::from("/opt/ligolo-ng/proxyin64"),
            state_dir: PathBuf::from("/tmp/autopivot"),
            route_exclude: vec!["tun".to_string(), "docker".to_string()],
            skip_host_routes: true,
            base_port: 11600,
            interface_prefix: "ligolo".to_string(),
            agent_start_delay: Duration::from_secs(30),
            tolerate_route_errors: false,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(120),
            agent_join_timeout: None,
        }
    }
}

impl PivotConfig {
    /// Reject settings that would produce nonsensical names or ports
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        if self.interface_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "interface_prefix must not be empty".to_string(),
            ));
        }
        if self.interface_prefix.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(ConfigError::Invalid(format!(
                "interface_prefix contains invalid characters: {:?}",
                self.interface_prefix
            )));
        }
        if self.base_port == 0 {
            return Err(ConfigError::Invalid("base_port must be non-zero".to_string()));
        }
        Ok(())
    }
}
