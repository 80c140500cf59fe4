//! In-memory stand-ins for the local and remote executors
//!
//! `FakeRunner` models just enough of iproute2 (tun devices, link state and a
//! routing table) for provisioning and teardown to be exercised without root.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use ap_core::{CommandKind, LocalError, RemoteError, RunJournal};
use ap_remote::RemoteExecutor;

use crate::runner::{CommandRunner, LocalCommand};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Default)]
struct Kernel {
    routes: Vec<String>,
    links: BTreeMap<String, bool>,
}

/// Simulated local machine
#[derive(Debug, Default)]
pub struct FakeRunner {
    kernel: Mutex<Kernel>,
    fail_on: Vec<String>,
    attempted: Mutex<Vec<String>>,
    journal: Option<RunJournal>,
}

impl FakeRunner {
    /// Machine whose routing table holds `routes` (as `ip route` lines)
    pub fn with_routes(routes: &[&str]) -> Self {
        Self {
            kernel: Mutex::new(Kernel {
                routes: routes.iter().map(|s| s.to_string()).collect(),
                links: BTreeMap::new(),
            }),
            ..Default::default()
        }
    }

    /// Machine where every command containing `fragment` fails
    pub fn failing_on(fragment: &str) -> Self {
        Self::default().fail_on(fragment)
    }

    /// Also fail commands containing `fragment`
    pub fn fail_on(mut self, fragment: &str) -> Self {
        self.fail_on.push(fragment.to_string());
        self
    }

    /// Journal successful commands like the real runner does
    pub fn with_journal(mut self, journal: RunJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Current routing table
    pub fn route_table(&self) -> Vec<String> {
        lock(&self.kernel).routes.clone()
    }

    /// Whether a tun device with this name exists
    pub fn has_interface(&self, name: &str) -> bool {
        lock(&self.kernel).links.contains_key(name)
    }

    /// Every command attempted, successful or not
    pub fn attempted(&self) -> Vec<String> {
        lock(&self.attempted).clone()
    }

    fn apply(&self, args: &[&str]) -> Result<Vec<String>, String> {
        let mut kernel = lock(&self.kernel);
        let missing = |dev: &str| format!("Cannot find device \"{}\"", dev);

        match args {
            ["route", "show"] | ["route"] => Ok(kernel.routes.clone()),
            ["tuntap", "add", "user", _, "mode", "tun", dev] => {
                if kernel.links.contains_key(*dev) {
                    return Err("ioctl(TUNSETIFF): Device or resource busy".to_string());
                }
                kernel.links.insert(dev.to_string(), false);
                Ok(vec![])
            }
            ["tuntap", "del", "mode", "tun", dev] => {
                if kernel.links.remove(*dev).is_none() {
                    return Err("ioctl(TUNSETIFF): No such device".to_string());
                }
                let suffix = format!(" dev {}", dev);
                kernel.routes.retain(|r| !r.ends_with(&suffix));
                Ok(vec![])
            }
            ["link", "set", dev, state @ ("up" | "down")] => match kernel.links.get_mut(*dev) {
                Some(up) => {
                    *up = *state == "up";
                    Ok(vec![])
                }
                None => Err(missing(*dev)),
            },
            ["route", "add", dest, "dev", dev] => {
                if !kernel.links.contains_key(*dev) {
                    return Err(missing(*dev));
                }
                let line = format!("{} dev {}", dest, dev);
                if kernel.routes.contains(&line) {
                    return Err("RTNETLINK answers: File exists".to_string());
                }
                kernel.routes.push(line);
                Ok(vec![])
            }
            ["route", "del", dest, "dev", dev] => {
                if !kernel.links.contains_key(*dev) {
                    return Err(missing(*dev));
                }
                let line = format!("{} dev {}", dest, dev);
                let before = kernel.routes.len();
                kernel.routes.retain(|r| *r != line);
                if kernel.routes.len() == before {
                    return Err("RTNETLINK answers: No such process".to_string());
                }
                Ok(vec![])
            }
            _ => Err(format!("unsupported command: ip {}", args.join(" "))),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        command: &LocalCommand,
        tolerate_failure: bool,
    ) -> Result<Vec<String>, LocalError> {
        let line = command.to_string();
        lock(&self.attempted).push(line.clone());

        let result = if self.fail_on.iter().any(|f| line.contains(f.as_str())) {
            Err("RTNETLINK answers: Operation not permitted".to_string())
        } else if command.program() == "ip" {
            let args: Vec<&str> = command.arguments().iter().map(String::as_str).collect();
            self.apply(&args)
        } else {
            Err(format!("unsupported program {}", command.program()))
        };

        match result {
            Ok(lines) => {
                if let Some(journal) = &self.journal {
                    journal.record(CommandKind::Local, line);
                }
                Ok(lines)
            }
            Err(_) if tolerate_failure => Ok(vec![]),
            Err(stderr) => Err(LocalError::CommandFailed {
                command: line,
                status: "exit status: 2".to_string(),
                stderr,
            }),
        }
    }
}

/// Simulated pivot host
#[derive(Debug, Default)]
pub struct FakeRemote {
    routes: Vec<String>,
    failing: bool,
    executed: Mutex<Vec<(String, bool)>>,
    uploads: Mutex<Vec<String>>,
    journal: Option<RunJournal>,
}

impl FakeRemote {
    /// Host whose `ip route` prints `routes`
    pub fn with_routes(routes: &[&str]) -> Self {
        Self {
            routes: routes.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Host where every command writes to stderr
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    /// Journal executed commands like the real channel does
    pub fn with_journal(mut self, journal: RunJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Commands executed, with their fail-on-stderr flag
    pub fn executed(&self) -> Vec<(String, bool)> {
        lock(&self.executed).clone()
    }

    /// Remote paths written by transfers
    pub fn uploads(&self) -> Vec<String> {
        lock(&self.uploads).clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn execute(
        &self,
        command: &str,
        fail_on_stderr: bool,
    ) -> Result<Vec<String>, RemoteError> {
        if let Some(journal) = &self.journal {
            journal.record(CommandKind::Remote, command);
        }
        lock(&self.executed).push((command.to_string(), fail_on_stderr));

        if self.failing && fail_on_stderr {
            return Err(RemoteError::Execution {
                command: command.to_string(),
                stderr: "sh: 1: ip: not found".to_string(),
            });
        }
        if command == "ip route" {
            return Ok(self.routes.clone());
        }
        Ok(vec![])
    }

    async fn transfer(&self, local: &Path, remote_dir: &str) -> Result<String, RemoteError> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
        lock(&self.uploads).push(path.clone());
        Ok(path)
    }

    fn host(&self) -> &str {
        "pivot.test"
    }
}
