//! autopivot CLI
//!
//! Mirrors a pivot host's networks onto a local tun interface, deploys the
//! tunnel agent over SSH and drives the tunnel console through its setup
//! before handing it to the operator. Local state is always cleaned up
//! when the console exits.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ap_console::ConsoleCommand;
use ap_core::config::{self, PivotConfig};
use ap_core::privilege::{check_privileges, invoking_user};
use ap_core::{Credential, RunJournal, Session, SessionId, Target};
use ap_local::ProcessRunner;
use ap_remote::{ChannelTimeouts, SshChannel};
use autopivot::orchestrator::{clean_session, Orchestrator, PtyConsole, RunContext, RunOptions};
use autopivot::output::{format_teardown, print_error, print_info, print_success, print_warning};

#[derive(Parser)]
#[command(name = "autopivot")]
#[command(author, version, about = "Automated routed pivoting through a remote host")]
struct Cli {
    /// Pivot host (hostname or IP)
    #[arg(short = 'H', long, required_unless_present = "clean")]
    host: Option<String>,

    /// SSH port
    #[arg(short, long, default_value_t = 22)]
    port: u16,

    /// SSH user
    #[arg(short, long, required_unless_present = "clean")]
    user: Option<String>,

    /// SSH password (prompted when neither password nor key is given)
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// SSH private key file
    #[arg(short, long, conflicts_with = "password")]
    key: Option<PathBuf>,

    /// Session id; selects interface, console port and journal file
    #[arg(short, long, alias = "ligolo-id", default_value_t = 1)]
    session: u16,

    /// Local IP the agent connects back to
    #[arg(short = 'i', long, required_unless_present = "clean")]
    local_ip: Option<String>,

    /// Number of port forwards to register
    #[arg(short = 'l', long, default_value_t = 5)]
    listeners: u16,

    /// Only remove the interface and routes left by a previous run
    #[arg(short, long)]
    clean: bool,

    /// Pivot through an existing session (not implemented)
    #[arg(short, long, value_name = "SESSION")]
    thru: Option<u16>,

    /// Remote directory for the agent (defaults to the user's home)
    #[arg(long)]
    remote_dir: Option<String>,

    /// Kill the agent and delete its binary when the run ends
    #[arg(long)]
    remote_cleanup: bool,

    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent binary to deploy (overrides config)
    #[arg(long)]
    agent: Option<PathBuf>,

    /// Console binary to run (overrides config)
    #[arg(long)]
    console: Option<PathBuf>,

    /// Journal directory (overrides config)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Also skip remote routes containing this text (repeatable)
    #[arg(long, value_name = "TEXT")]
    exclude: Vec<String>,

    /// Mirror host (/32) routes too
    #[arg(long)]
    keep_host_routes: bool,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut PivotConfig) {
        if let Some(agent) = &self.agent {
            config.agent_binary = agent.clone();
        }
        if let Some(console) = &self.console {
            config.console_binary = console.clone();
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        config.route_exclude.extend(self.exclude.iter().cloned());
        if self.keep_host_routes {
            config.skip_host_routes = false;
        }
    }

    fn credential(&self, user: &str, host: &str) -> Result<Credential> {
        if let Some(key) = &self.key {
            return Ok(Credential::PrivateKey(key.clone()));
        }
        if let Some(password) = &self.password {
            return Ok(Credential::Password(password.clone()));
        }
        let password = rpassword::prompt_password(format!("{}@{}'s password: ", user, host))
            .context("Failed to read password")?;
        Ok(Credential::Password(password))
    }
}

fn required<'a>(value: &'a Option<String>, flag: &str) -> Result<&'a str> {
    value
        .as_deref()
        .with_context(|| format!("{} is required", flag))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

/// Cancel the run on Ctrl-C or SIGTERM so teardown still happens
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!("Received Ctrl+C, cleaning up..."),
        _ = terminate => tracing::warn!("Received SIGTERM, cleaning up..."),
    }
    cancel.cancel();
}

/// Returns whether the run finished without error
async fn run(cli: Cli) -> Result<bool> {
    let mut config = config::load_or_default(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    check_privileges()?;

    let session = Session::new(SessionId(cli.session), &config);
    let journal = RunJournal::new();
    let ctx = RunContext {
        session,
        journal: journal.clone(),
        owner: invoking_user(),
        config,
    };
    let local = ProcessRunner::new(journal.clone()).with_timeout(ctx.config.command_timeout);

    if cli.clean {
        let report = clean_session(&ctx, &local).await?;
        println!("{}", format_teardown(&report));
        if report.is_clean() {
            print_success(&format!("Cleaned up {}", ctx.session.interface));
        } else {
            print_warning("Some cleanup steps failed; see above");
        }
        return Ok(report.is_clean());
    }

    if let Some(thru) = cli.thru {
        print_warning(&format!(
            "Pivoting through session {} is not implemented; connecting directly",
            thru
        ));
    }

    let host = required(&cli.host, "--host")?;
    let user = required(&cli.user, "--user")?;
    let callback_ip = required(&cli.local_ip, "--local-ip")?;
    let target = Target {
        host: host.to_string(),
        port: cli.port,
        user: user.to_string(),
        credential: cli.credential(user, host)?,
    };
    let options = RunOptions {
        callback_ip: callback_ip.to_string(),
        listener_count: cli.listeners,
        remote_dir: cli.remote_dir.clone().unwrap_or_else(|| target.remote_home()),
        remote_cleanup: cli.remote_cleanup,
    };

    tracing::info!(
        session = %ctx.session.id,
        interface = %ctx.session.interface,
        host = %target.host,
        "Starting pivot run"
    );

    let timeouts = ChannelTimeouts {
        connect: ctx.config.connect_timeout,
        command: ctx.config.command_timeout,
    };
    let remote = SshChannel::new(target, timeouts, journal.clone());
    if let Err(e) = remote.check_login().await {
        if e.is_auth() {
            print_warning("Check the user, password or key and try again");
        }
        return Err(e.into());
    }

    let console = PtyConsole::new(
        ConsoleCommand::listening_on(ctx.config.console_binary.clone(), ctx.session.console_port),
        journal.clone(),
        ctx.config.agent_join_timeout,
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let report = Orchestrator::new(&ctx, &remote, &local, &console)
        .run(&options, cancel)
        .await;

    println!("{}", format_teardown(&report.teardown));
    print_info(&format!("Journal: {}", ctx.session.journal_path.display()));
    match &report.error {
        None => print_success("Pivot session finished and cleaned up"),
        Some(e) => print_error(&format!("{:#}", e)),
    }
    if !report.teardown.is_clean() {
        print_warning("Some cleanup steps failed; remove them by hand or rerun with --clean");
    }
    Ok(report.succeeded())
}
