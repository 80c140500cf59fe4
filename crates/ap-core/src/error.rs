//! Core error types for autopivot

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for a pivot run
#[derive(Error, Debug)]
pub enum PivotError {
    /// Remote channel error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Local command error
    #[error("Local error: {0}")]
    Local(#[from] LocalError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Journal persistence error
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// Not running with the elevation needed to change interfaces and routes
    #[error("Insufficient privileges: {0}")]
    Privilege(String),

    /// The console driver did not see the marker it was waiting for
    #[error("Console automation stalled in {state} waiting for {expected:?}")]
    AutomationMismatch { state: String, expected: String },

    /// The run was cancelled by the operator
    #[error("Run cancelled")]
    Cancelled,
}

/// Errors raised by the remote command channel
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Opening or authenticating the SSH session failed
    #[error("Authentication failed for {user}@{host}: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },

    /// TCP/SSH transport could not be established
    #[error("Failed to connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    /// The command wrote to stderr under a fail-on-stderr policy
    #[error("Error in command {command}:\n{stderr}")]
    Execution { command: String, stderr: String },

    /// SFTP upload failed
    #[error("Failed to transfer {path}: {reason}")]
    Transfer { path: String, reason: String },

    /// A blocking remote operation exceeded its deadline
    #[error("{what} timed out after {seconds}s")]
    Timeout { what: String, seconds: u64 },

    /// Private key could not be loaded
    #[error("Private key not found at {path}: {reason}")]
    KeyNotFound { path: String, reason: String },
}

impl RemoteError {
    /// Whether this error means the credentials themselves were refused
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            RemoteError::Authentication { .. } | RemoteError::KeyNotFound { .. }
        )
    }
}

/// Errors raised by the local command runner
#[derive(Error, Debug)]
pub enum LocalError {
    /// The command exited non-zero and failure was not tolerated
    #[error("Command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The program could not be started at all
    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// The command did not finish in time
    #[error("Command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
}

impl LocalError {
    /// Captured stderr, when the command ran far enough to produce one
    pub fn stderr(&self) -> Option<&str> {
        match self {
            LocalError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors reading or writing the run journal
#[derive(Error, Debug)]
pub enum JournalError {
    /// I/O error on the journal file
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed journal contents
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_mentions_command_and_stderr() {
        let err = RemoteError::Execution {
            command: "ip route".to_string(),
            stderr: "permission denied".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("ip route"));
        assert!(text.contains("permission denied"));
        assert!(!err.is_auth());
    }

    #[test]
    fn test_local_error_wraps_into_pivot_error() {
        let err: PivotError = LocalError::CommandFailed {
            command: "ip link set ligolo1 up".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "Cannot find device".to_string(),
        }
        .into();
        assert!(matches!(err, PivotError::Local(_)));
        assert!(err.to_string().contains("ligolo1"));
    }
}
