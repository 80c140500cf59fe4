//! Tun interface and route provisioning
//!
//! Creates the session's tun device, binds the discovered routes to it and
//! removes all of it again. Teardown never fails: every step is attempted
//! and its outcome recorded in a [`TeardownReport`].

use std::fmt;

use ap_core::{LocalError, RouteSet};

use crate::runner::{CommandRunner, LocalCommand};

/// stderr fragments meaning the thing being removed is already gone
const ALREADY_ABSENT: &[&str] = &[
    "Cannot find device",
    "No such process",
    "No such device",
    "does not exist",
];

/// Outcome of a single teardown step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// The step removed something
    Done,
    /// Nothing to remove
    AlreadyAbsent,
    /// The step failed
    Failed(String),
}

/// One attempted teardown step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Command that was attempted
    pub step: String,
    pub result: StepResult,
}

/// Aggregated result of a teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub steps: Vec<StepOutcome>,
}

impl TeardownReport {
    /// Whether every step succeeded or found nothing to do
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Steps that failed
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps
            .iter()
            .filter(|s| matches!(s.result, StepResult::Failed(_)))
    }

    fn push(&mut self, step: &LocalCommand, result: StepResult) {
        self.steps.push(StepOutcome {
            step: step.to_string(),
            result,
        });
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.steps {
            match &outcome.result {
                StepResult::Done => writeln!(f, "  ok      {}", outcome.step)?,
                StepResult::AlreadyAbsent => writeln!(f, "  absent  {}", outcome.step)?,
                StepResult::Failed(reason) => {
                    writeln!(f, "  FAILED  {}: {}", outcome.step, reason)?
                }
            }
        }
        Ok(())
    }
}

/// Manages the session's tun interface and its routes
pub struct InterfaceProvisioner<'a, L: CommandRunner + ?Sized> {
    runner: &'a L,
    interface: String,
    owner: String,
    tolerate_route_errors: bool,
}

impl<'a, L: CommandRunner + ?Sized> InterfaceProvisioner<'a, L> {
    /// Provisioner for `interface`, owned by `owner`
    pub fn new(runner: &'a L, interface: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            runner,
            interface: interface.into(),
            owner: owner.into(),
            tolerate_route_errors: false,
        }
    }

    /// Keep installing routes after one fails
    pub fn tolerate_route_errors(mut self, tolerate: bool) -> Self {
        self.tolerate_route_errors = tolerate;
        self
    }

    /// Create the tun device and bring it up
    pub async fn create(&self) -> Result<(), LocalError> {
        tracing::info!(interface = %self.interface, owner = %self.owner, "Creating tun interface");
        self.runner
            .run(
                &LocalCommand::ip([
                    "tuntap",
                    "add",
                    "user",
                    self.owner.as_str(),
                    "mode",
                    "tun",
                    self.interface.as_str(),
                ]),
                false,
            )
            .await?;
        self.runner
            .run(
                &LocalCommand::ip(["link", "set", self.interface.as_str(), "up"]),
                false,
            )
            .await?;
        Ok(())
    }

    /// Bind every route to the interface, in order
    ///
    /// Returns the routes actually installed.
    pub async fn install_routes(&self, routes: &RouteSet) -> Result<Vec<String>, LocalError> {
        let mut installed = Vec::with_capacity(routes.len());
        for route in routes {
            let command = self.route_command("add", route);
            match self.runner.run(&command, false).await {
                Ok(_) => installed.push(route.clone()),
                Err(e) if self.tolerate_route_errors => {
                    tracing::warn!("Skipping route {}: {}", route, e);
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            "Installed {}/{} route(s) via {}",
            installed.len(),
            routes.len(),
            self.interface
        );
        Ok(installed)
    }

    /// Remove the routes, bring the interface down and delete it
    ///
    /// Safe to call repeatedly and after a partial [`create`](Self::create).
    pub async fn teardown(&self, routes: &RouteSet) -> TeardownReport {
        tracing::info!("Cleaning up {} ...", self.interface);
        let mut report = TeardownReport::default();

        for route in routes {
            let command = self.route_command("del", route);
            let result = self.attempt(&command).await;
            report.push(&command, result);
        }

        let down = LocalCommand::ip(["link", "set", self.interface.as_str(), "down"]);
        let result = self.attempt(&down).await;
        report.push(&down, result);

        let delete = LocalCommand::ip(["tuntap", "del", "mode", "tun", self.interface.as_str()]);
        let result = self.attempt(&delete).await;
        report.push(&delete, result);

        for failure in report.failures() {
            tracing::warn!("Teardown step failed: {}", failure.step);
        }
        report
    }

    fn route_command(&self, verb: &str, route: &str) -> LocalCommand {
        LocalCommand::ip(["route", verb, route, "dev", self.interface.as_str()])
    }

    async fn attempt(&self, command: &LocalCommand) -> StepResult {
        match self.runner.run(command, false).await {
            Ok(_) => StepResult::Done,
            Err(e) => classify_failure(&e),
        }
    }
}

fn classify_failure(error: &LocalError) -> StepResult {
    match error.stderr() {
        Some(stderr) if ALREADY_ABSENT.iter().any(|m| stderr.contains(m)) => {
            StepResult::AlreadyAbsent
        }
        _ => StepResult::Failed(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;

    fn routes(list: &[&str]) -> RouteSet {
        RouteSet::from_vec(list.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_create_install_teardown_restores_table() {
        let runner = FakeRunner::with_routes(&["192.168.0.0/24 dev wlan0"]);
        let before = runner.route_table();
        let provisioner = InterfaceProvisioner::new(&runner, "ligolo1", "kali");

        provisioner.create().await.unwrap();
        assert!(runner.has_interface("ligolo1"));

        let set = routes(&["10.0.0.0/24", "172.16.0.0/16"]);
        let installed = provisioner.install_routes(&set).await.unwrap();
        assert_eq!(installed, vec!["10.0.0.0/24", "172.16.0.0/16"]);
        assert!(runner
            .route_table()
            .contains(&"10.0.0.0/24 dev ligolo1".to_string()));

        let report = provisioner.teardown(&set).await;
        assert!(report.is_clean(), "{}", report);
        assert_eq!(runner.route_table(), before);
        assert!(!runner.has_interface("ligolo1"));
    }

    #[tokio::test]
    async fn test_teardown_twice_is_clean() {
        let runner = FakeRunner::with_routes(&[]);
        let provisioner = InterfaceProvisioner::new(&runner, "ligolo2", "kali");
        let set = routes(&["10.0.0.0/24"]);

        provisioner.create().await.unwrap();
        provisioner.install_routes(&set).await.unwrap();

        assert!(provisioner.teardown(&set).await.is_clean());
        let second = provisioner.teardown(&set).await;
        assert!(second.is_clean(), "{}", second);
        assert!(second
            .steps
            .iter()
            .all(|s| s.result == StepResult::AlreadyAbsent));
        assert!(!runner.has_interface("ligolo2"));
    }

    #[tokio::test]
    async fn test_teardown_after_partial_create_attempts_every_step() {
        let runner = FakeRunner::with_routes(&[]).fail_on("link set ligolo3 up");
        let provisioner = InterfaceProvisioner::new(&runner, "ligolo3", "kali");
        assert!(provisioner.create().await.is_err());
        assert!(runner.has_interface("ligolo3"));

        let report = provisioner.teardown(&routes(&["10.0.0.0/24"])).await;
        assert_eq!(report.steps.len(), 3);
        assert!(!runner.has_interface("ligolo3"));
    }

    #[tokio::test]
    async fn test_one_failed_step_does_not_stop_the_rest() {
        let runner = FakeRunner::with_routes(&[]).fail_on("route del 10.0.0.0/24");
        let provisioner = InterfaceProvisioner::new(&runner, "ligolo4", "kali");
        let set = routes(&["10.0.0.0/24", "10.1.0.0/24"]);
        provisioner.create().await.unwrap();
        provisioner.install_routes(&set).await.unwrap();

        let report = provisioner.teardown(&set).await;
        assert!(!report.is_clean());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.steps.len(), 4);
        assert!(!runner.has_interface("ligolo4"));
    }

    #[tokio::test]
    async fn test_route_error_fails_unless_tolerated() {
        let set = routes(&["10.0.0.0/24", "10.1.0.0/24", "10.2.0.0/24"]);

        let runner = FakeRunner::with_routes(&[]).fail_on("route add 10.1.0.0/24");
        let strict = InterfaceProvisioner::new(&runner, "ligolo5", "kali");
        strict.create().await.unwrap();
        assert!(strict.install_routes(&set).await.is_err());
        assert!(!runner
            .route_table()
            .contains(&"10.2.0.0/24 dev ligolo5".to_string()));

        let runner = FakeRunner::with_routes(&[]).fail_on("route add 10.1.0.0/24");
        let lenient =
            InterfaceProvisioner::new(&runner, "ligolo5", "kali").tolerate_route_errors(true);
        lenient.create().await.unwrap();
        let installed = lenient.install_routes(&set).await.unwrap();
        assert_eq!(installed, vec!["10.0.0.0/24", "10.2.0.0/24"]);
    }

    #[test]
    fn test_classify_failure() {
        let absent = LocalError::CommandFailed {
            command: "ip link set ligolo1 down".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "Cannot find device \"ligolo1\"".to_string(),
        };
        assert_eq!(classify_failure(&absent), StepResult::AlreadyAbsent);

        let denied = LocalError::CommandFailed {
            command: "ip route del 10.0.0.0/24 dev ligolo1".to_string(),
            status: "exit status: 2".to_string(),
            stderr: "RTNETLINK answers: Operation not permitted".to_string(),
        };
        assert!(matches!(classify_failure(&denied), StepResult::Failed(_)));
    }
}
