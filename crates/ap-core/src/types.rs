//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::PivotConfig;

/// Identifier of a tunnel session
///
/// Determines the interface name, the console listen port and the journal
/// file name, so two runs with the same id target the same local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u16);

impl SessionId {
    /// Get the raw id
    pub fn get(self) -> u16 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for SessionId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

/// Immutable per-run session parameters derived from the id and configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// Local virtual interface name
    pub interface: String,
    /// Port the local console listens on for the agent
    pub console_port: u16,
    /// Base port listeners are numbered from
    pub base_port: u16,
    /// Journal file for this session
    pub journal_path: PathBuf,
}

impl Session {
    /// Derive a session from its id and the run configuration
    pub fn new(id: SessionId, config: &PivotConfig) -> Self {
        Self {
            id,
            interface: format!("{}{}", config.interface_prefix, id),
            console_port: config.base_port.saturating_add(id.get()),
            base_port: config.base_port,
            journal_path: journal_path(&config.state_dir, id),
        }
    }

    /// Listeners `base+1 ..= base+count`, same port on both sides
    pub fn listeners(&self, count: u16) -> Vec<Listener> {
        (1..=count)
            .map(|i| {
                let port = self.base_port.saturating_add(i);
                Listener {
                    local_port: port,
                    remote_port: port,
                }
            })
            .collect()
    }
}

/// Path of the journal file for a session
pub fn journal_path(state_dir: &Path, id: SessionId) -> PathBuf {
    state_dir.join(format!("{}.json", id))
}

/// A port forward registered in the tunnel console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listener {
    /// Port bound on the agent side (`0.0.0.0:<port>`)
    pub local_port: u16,
    /// Port the traffic is delivered to on the console side (`127.0.0.1:<port>`)
    pub remote_port: u16,
}

/// Remote authentication material
///
/// Held in memory for the run only and never written to the journal.
#[derive(Clone)]
pub enum Credential {
    /// Password authentication
    Password(String),
    /// Private key file (unencrypted or agent-less)
    PrivateKey(PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => write!(f, "Password(<redacted>)"),
            Credential::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
        }
    }
}

impl Credential {
    /// Short label for log lines
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PrivateKey(_) => "key",
        }
    }
}

/// Remote host reached over SSH
#[derive(Debug, Clone)]
pub struct Target {
    /// Hostname or IP
    pub host: String,
    /// SSH port
    pub port: u16,
    /// Login user
    pub user: String,
    /// Credential used for every remote operation
    pub credential: Credential,
}

impl Target {
    /// Home directory of the login user on a typical Linux host
    pub fn remote_home(&self) -> String {
        if self.user == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", self.user)
        }
    }

    /// `host:port` for socket connection
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_derivation() {
        let config = PivotConfig::default();
        let session = Session::new(SessionId(3), &config);
        assert_eq!(session.interface, "ligolo3");
        assert_eq!(session.console_port, 11603);
        assert_eq!(session.journal_path, PathBuf::from("/tmp/autopivot/3.json"));
    }

    #[test]
    fn test_listeners_are_sequential_from_base() {
        let session = Session::new(SessionId(1), &PivotConfig::default());
        let ports: Vec<u16> = session.listeners(5).iter().map(|l| l.local_port).collect();
        assert_eq!(ports, vec![11601, 11602, 11603, 11604, 11605]);
        assert!(session.listeners(0).is_empty());
        assert!(session
            .listeners(3)
            .iter()
            .all(|l| l.local_port == l.remote_port));
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let cred = Credential::Password("hunter2".to_string());
        assert!(!format!("{:?}", cred).contains("hunter2"));
        assert_eq!(cred.method(), "password");
    }

    #[test]
    fn test_remote_home() {
        let mut target = Target {
            host: "10.0.0.5".to_string(),
            port: 22,
            user: "root".to_string(),
            credential: Credential::Password(String::new()),
        };
        assert_eq!(target.remote_home(), "/root");
        target.user = "www".to_string();
        assert_eq!(target.remote_home(), "/home/www");
        assert_eq!(target.address(), "10.0.0.5:22");
    }
}
