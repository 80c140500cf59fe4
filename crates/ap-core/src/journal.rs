//! Append-only record of everything a run did
//!
//! Every local command, remote command and console command issued during a
//! run is appended here, together with the discovered route set. The journal
//! is written to `<state_dir>/<session>.json` so a crashed run can still be
//! inspected and cleaned up by hand (or with `--clean`).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::JournalError;

/// Category of a journaled command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Privileged local shell command
    Local,
    /// Command executed on the remote host
    Remote,
    /// Line sent to the interactive tunnel console
    Console,
}

/// Serialized journal contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalData {
    pub local_commands: Vec<String>,
    pub remote_commands: Vec<String>,
    pub console_commands: Vec<String>,
    pub routes: Vec<String>,
}

/// Shared handle to the run journal
///
/// Cloning the handle shares the underlying record. The lock is only held
/// for the duration of a push or a snapshot, never across an await.
#[derive(Debug, Clone, Default)]
pub struct RunJournal {
    inner: Arc<Mutex<JournalData>>,
}

impl RunJournal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JournalData> {
        // A panic while holding the lock cannot leave a Vec half-pushed
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a command to its category
    pub fn record(&self, kind: CommandKind, command: impl Into<String>) {
        let command = command.into();
        let mut data = self.lock();
        match kind {
            CommandKind::Local => data.local_commands.push(command),
            CommandKind::Remote => data.remote_commands.push(command),
            CommandKind::Console => data.console_commands.push(command),
        }
    }

    /// Replace the discovered route set
    pub fn set_routes(&self, routes: &[String]) {
        self.lock().routes = routes.to_vec();
    }

    /// Routes recorded so far
    pub fn routes(&self) -> Vec<String> {
        self.lock().routes.clone()
    }

    /// Commands recorded for one category
    pub fn commands(&self, kind: CommandKind) -> Vec<String> {
        let data = self.lock();
        match kind {
            CommandKind::Local => data.local_commands.clone(),
            CommandKind::Remote => data.remote_commands.clone(),
            CommandKind::Console => data.console_commands.clone(),
        }
    }

    /// Copy of the whole record
    pub fn snapshot(&self) -> JournalData {
        self.lock().clone()
    }

    /// Write the journal, replacing any previous file for the session
    pub fn persist(&self, path: &Path) -> Result<(), JournalError> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| JournalError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        std::fs::write(path, json).map_err(|source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!("Journal written to {}", path.display());
        Ok(())
    }

    /// Read a previously persisted journal
    ///
    /// Returns `Ok(None)` when no journal exists for the session.
    pub fn load(path: &Path) -> Result<Option<JournalData>, JournalError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(JournalError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_by_category() {
        let journal = RunJournal::new();
        journal.record(CommandKind::Local, "ip link set ligolo1 up");
        journal.record(CommandKind::Remote, "ip route");
        journal.record(CommandKind::Console, "session");
        journal.record(CommandKind::Console, "1");

        let data = journal.snapshot();
        assert_eq!(data.local_commands, vec!["ip link set ligolo1 up"]);
        assert_eq!(data.remote_commands, vec!["ip route"]);
        assert_eq!(data.console_commands, vec!["session", "1"]);
    }

    #[test]
    fn test_clones_share_the_record() {
        let journal = RunJournal::new();
        let handle = journal.clone();
        handle.set_routes(&["10.0.0.0/24".to_string()]);
        assert_eq!(journal.routes(), vec!["10.0.0.0/24"]);
    }

    #[test]
    fn test_persist_overwrites_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("1.json");

        let first = RunJournal::new();
        first.record(CommandKind::Remote, "old");
        first.persist(&path).unwrap();

        let second = RunJournal::new();
        second.set_routes(&["10.0.0.0/24".to_string(), "172.16.0.0/16".to_string()]);
        second.persist(&path).unwrap();

        let loaded = RunJournal::load(&path).unwrap().unwrap();
        assert!(loaded.remote_commands.is_empty());
        assert_eq!(loaded.routes, vec!["10.0.0.0/24", "172.16.0.0/16"]);
    }

    #[test]
    fn test_persisted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2.json");
        RunJournal::new().persist(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for key in ["local_commands", "remote_commands", "console_commands", "routes"] {
            assert!(value.get(key).is_some(), "missing key {}", key);
        }
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RunJournal::load(&dir.path().join("9.json")).unwrap().is_none());
    }
}
