//! Run controller
//!
//! Sequences route discovery, interface provisioning, agent deployment and
//! the console session. Whatever happens in those phases, the interface and
//! its routes are torn down afterwards and the journal is written out.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ap_console::{
    AutomationOutcome, ConsoleCommand, ConsoleDriver, ConsoleExit, ConsoleSession, TunnelPlan,
};
use ap_core::{PivotConfig, PivotError, RouteFilter, RouteSet, RunJournal, Session};
use ap_local::{discover_routes, CommandRunner, InterfaceProvisioner, TeardownReport};
use ap_remote::{AgentDeployer, RemoteExecutor};

use crate::output::format_command_summary;

/// Hosts the console for the interactive phase
#[async_trait]
pub trait ConsoleRunner: Send + Sync {
    /// Run the console to completion, letting `driver` automate its setup
    ///
    /// Must stop the console and return once `cancel` fires.
    async fn run(&self, driver: ConsoleDriver, cancel: CancellationToken) -> Result<ConsoleExit>;
}

/// The real console, spawned in a PTY
pub struct PtyConsole {
    command: ConsoleCommand,
    journal: RunJournal,
    join_timeout: Option<Duration>,
}

impl PtyConsole {
    pub fn new(command: ConsoleCommand, journal: RunJournal, join_timeout: Option<Duration>) -> Self {
        Self {
            command,
            journal,
            join_timeout,
        }
    }
}

#[async_trait]
impl ConsoleRunner for PtyConsole {
    async fn run(&self, driver: ConsoleDriver, cancel: CancellationToken) -> Result<ConsoleExit> {
        ConsoleSession::new(self.command.clone(), self.journal.clone())
            .with_join_timeout(self.join_timeout)
            .run(driver, cancel)
            .await
    }
}

/// State shared by every phase of one run
pub struct RunContext {
    pub session: Session,
    pub config: PivotConfig,
    pub journal: RunJournal,
    /// Owner of the tun device
    pub owner: String,
}

impl RunContext {
    /// Write the journal; failures are logged, never fatal
    pub fn persist(&self) {
        match self.journal.persist(&self.session.journal_path) {
            Ok(()) => tracing::debug!("Journal written to {:?}", self.session.journal_path),
            Err(e) => tracing::warn!("Failed to write journal: {}", e),
        }
    }

    fn provisioner<'a, L: CommandRunner + ?Sized>(&'a self, local: &'a L) -> InterfaceProvisioner<'a, L> {
        InterfaceProvisioner::new(local, self.session.interface.as_str(), self.owner.as_str())
            .tolerate_route_errors(self.config.tolerate_route_errors)
    }
}

/// Per-invocation inputs that do not come from the config file
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Address the agent dials back to
    pub callback_ip: String,
    /// Number of port forwards to register
    pub listener_count: u16,
    /// Remote directory the agent is copied into
    pub remote_dir: String,
    /// Kill the agent and delete its binary during teardown
    pub remote_cleanup: bool,
}

/// Result of a full run
#[derive(Debug)]
pub struct RunReport {
    /// First error raised by a phase, if any
    pub error: Option<anyhow::Error>,
    pub teardown: TeardownReport,
    /// How far console automation got, if the console was reached
    pub automation: Option<AutomationOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives one pivot run against a remote host
pub struct Orchestrator<'a, R: ?Sized, L: ?Sized, C: ?Sized> {
    ctx: &'a RunContext,
    remote: &'a R,
    local: &'a L,
    console: &'a C,
}

impl<'a, R, L, C> Orchestrator<'a, R, L, C>
where
    R: RemoteExecutor + ?Sized,
    L: CommandRunner + ?Sized,
    C: ConsoleRunner + ?Sized,
{
    pub fn new(ctx: &'a RunContext, remote: &'a R, local: &'a L, console: &'a C) -> Self {
        Self {
            ctx,
            remote,
            local,
            console,
        }
    }

    /// Run every phase, then tear down
    ///
    /// Cancelling `cancel` aborts whichever phase is running, including the
    /// console, and goes straight to teardown.
    pub async fn run(&self, options: &RunOptions, cancel: CancellationToken) -> RunReport {
        let provisioner = self.ctx.provisioner(self.local);
        let mut deployer = AgentDeployer::new(self.remote, self.ctx.config.agent_start_delay);

        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::Error::new(PivotError::Cancelled)),
            result = self.prepare(&provisioner, &mut deployer, options) => result,
        };

        let mut automation = None;
        let error = match prepared {
            Ok(()) => match self.console_phase(options, cancel).await {
                Ok(outcome) => {
                    automation = outcome;
                    None
                }
                Err(e) => Some(e),
            },
            Err(e) => Some(e),
        };
        if let Some(e) = &error {
            tracing::error!("Run failed: {:#}", e);
        }

        let routes = RouteSet::from_vec(self.ctx.journal.routes());
        let teardown = provisioner.teardown(&routes).await;
        if options.remote_cleanup {
            deployer.stop().await;
        }
        self.ctx.persist();

        RunReport {
            error,
            teardown,
            automation,
        }
    }

    async fn prepare(
        &self,
        provisioner: &InterfaceProvisioner<'_, L>,
        deployer: &mut AgentDeployer<'_, R>,
        options: &RunOptions,
    ) -> Result<()> {
        let config = &self.ctx.config;
        let session = &self.ctx.session;
        let filter = RouteFilter {
            exclude: config.route_exclude.clone(),
            skip_host_routes: config.skip_host_routes,
        };

        let routes = discover_routes(self.remote, self.local, &filter)
            .await
            .with_context(|| format!("Route discovery on {} failed", self.remote.host()))?;
        self.ctx.journal.set_routes(routes.as_slice());
        self.ctx.persist();
        if routes.is_empty() {
            tracing::warn!("No remote routes to mirror; only listener traffic will be tunnelled");
        }

        provisioner
            .create()
            .await
            .with_context(|| format!("Failed to create {}", session.interface))?;
        provisioner
            .install_routes(&routes)
            .await
            .with_context(|| format!("Failed to install routes on {}", session.interface))?;

        deployer
            .deploy(&config.agent_binary, &options.remote_dir)
            .await
            .with_context(|| format!("Failed to deploy {:?}", config.agent_binary))?;
        deployer
            .launch(&options.callback_ip, session.console_port)
            .await
            .context("Failed to launch remote agent")?;

        tracing::info!(
            "Commands executed so far:\n{}",
            format_command_summary(&self.ctx.journal.snapshot())
        );
        self.ctx.persist();
        Ok(())
    }

    async fn console_phase(
        &self,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<Option<AutomationOutcome>> {
        let session = &self.ctx.session;
        let plan = TunnelPlan::new(
            session.listeners(options.listener_count),
            session.interface.as_str(),
        );
        let driver = ConsoleDriver::new(plan, self.ctx.journal.clone());

        let exit = self
            .console
            .run(driver, cancel.clone())
            .await
            .context("Console session failed")?;
        tracing::debug!(exit_code = ?exit.exit_code, "Console exited");
        if cancel.is_cancelled() {
            return Err(PivotError::Cancelled.into());
        }

        match &exit.outcome {
            Some(AutomationOutcome::Abandoned { state, expected }) => {
                let mismatch = PivotError::AutomationMismatch {
                    state: state.to_string(),
                    expected: expected.clone(),
                };
                tracing::warn!("{}", mismatch);
            }
            Some(AutomationOutcome::Interrupted { state }) => {
                tracing::warn!("Console exited before setup finished (in {})", state);
            }
            Some(AutomationOutcome::Completed) | None => {}
        }
        Ok(exit.outcome)
    }
}

/// Remove a previous run's interface and routes
///
/// Routes come from the session's journal; without one only the interface
/// itself is removed.
pub async fn clean_session<L: CommandRunner + ?Sized>(
    ctx: &RunContext,
    local: &L,
) -> Result<TeardownReport> {
    let routes = match RunJournal::load(&ctx.session.journal_path)? {
        Some(data) => data.routes,
        None => {
            tracing::info!(
                "No journal at {:?}; removing {} only",
                ctx.session.journal_path,
                ctx.session.interface
            );
            Vec::new()
        }
    };
    let report = ctx
        .provisioner(local)
        .teardown(&RouteSet::from_vec(routes))
        .await;
    Ok(report)
}
