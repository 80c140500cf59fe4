//! PTY-hosted tunnel console
//!
//! Spawns the console in a pseudo-terminal, mirrors its output to the
//! operator's terminal, forwards the operator's keystrokes, and lets a
//! [`ConsoleDriver`] answer the setup prompts in between.

use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ap_core::{CommandKind, RunJournal};

use crate::driver::{AutomationOutcome, ConsoleDriver};

/// Buffered output chunks between the PTY reader thread and the event loop
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Keystroke chunks from the operator's terminal
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Line terminator sent after each automated command
const ENTER: &[u8] = b"\r";

/// The console program and its listen address
#[derive(Debug, Clone)]
pub struct ConsoleCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ConsoleCommand {
    /// `<program> -selfcert -laddr 0.0.0.0:<port>`
    pub fn listening_on(program: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            program: program.into(),
            args: vec![
                "-selfcert".to_string(),
                "-laddr".to_string(),
                format!("0.0.0.0:{}", port),
            ],
        }
    }

    /// Command line as journaled
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How the console session ended
#[derive(Debug)]
pub struct ConsoleExit {
    /// Exit code of the console process, if it could be collected
    pub exit_code: Option<u32>,
    /// How far automation got
    pub outcome: Option<AutomationOutcome>,
}

/// Puts the operator's terminal in raw mode for as long as it lives
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn enable() -> Self {
        if !std::io::stdin().is_terminal() {
            return Self { enabled: false };
        }
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Self { enabled: true },
            Err(e) => {
                tracing::warn!("Failed to enable raw mode: {}", e);
                Self { enabled: false }
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

/// Terminal size to give the console, falling back to 80x24
fn terminal_size() -> PtySize {
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A console process hosted in a PTY
pub struct ConsoleSession {
    command: ConsoleCommand,
    journal: RunJournal,
    join_timeout: Option<Duration>,
}

impl ConsoleSession {
    /// Prepare a session; nothing is spawned until [`run`](Self::run)
    pub fn new(command: ConsoleCommand, journal: RunJournal) -> Self {
        Self {
            command,
            journal,
            join_timeout: None,
        }
    }

    /// Abandon automation if a marker takes longer than `timeout` to appear
    pub fn with_join_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Run the console until it exits or `cancel` fires
    ///
    /// Output always reaches the operator unmodified and keystrokes are
    /// forwarded from the start, so a stalled or failed automation never
    /// takes the console away from the operator. Cancelling kills the
    /// console.
    pub async fn run(
        self,
        mut driver: ConsoleDriver,
        cancel: CancellationToken,
    ) -> Result<ConsoleExit> {
        let shown = self.command.display();
        tracing::info!("Starting local console: {}", shown);
        self.journal.record(CommandKind::Console, shown.as_str());

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(terminal_size())
            .with_context(|| "Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&self.command.program);
        cmd.args(&self.command.args);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn console: {}", shown))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .with_context(|| "Failed to clone PTY reader")?;
        let mut writer = pair
            .master
            .take_writer()
            .with_context(|| "Failed to take PTY writer")?;

        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL_CAPACITY);
        std::thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if input_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let _raw = RawModeGuard::enable();
        let mut stdout = std::io::stdout();
        let mut input_open = true;
        let mut deadline = self.next_deadline();

        loop {
            let stall = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                chunk = output_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    if let Err(e) = stdout.write_all(&chunk).and_then(|_| stdout.flush()) {
                        tracing::debug!("Failed to mirror console output: {}", e);
                    }

                    let before = driver.state();
                    for line in driver.feed(&chunk) {
                        if let Err(e) = send_line(&mut writer, &line) {
                            tracing::warn!("Failed to send {:?} to console: {}", line, e);
                        }
                    }
                    if driver.state() != before {
                        deadline = if driver.state().is_automated() {
                            self.next_deadline()
                        } else {
                            None
                        };
                    }
                }
                keys = input_rx.recv(), if input_open => {
                    match keys {
                        Some(keys) => {
                            if let Err(e) = writer.write_all(&keys).and_then(|_| writer.flush()) {
                                tracing::debug!("Failed to forward input: {}", e);
                            }
                        }
                        None => input_open = false,
                    }
                }
                _ = stall => {
                    driver.abandon();
                    deadline = None;
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("Stopping console");
                    if let Err(e) = child.kill() {
                        tracing::warn!("Failed to kill console: {}", e);
                    }
                    break;
                }
            }
        }

        driver.terminate();
        drop(writer);

        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .with_context(|| "Console wait task failed")?;
        let exit_code = match status {
            Ok(status) => Some(status.exit_code()),
            Err(e) => {
                tracing::warn!("Failed to collect console exit status: {}", e);
                None
            }
        };

        Ok(ConsoleExit {
            exit_code,
            outcome: driver.outcome().cloned(),
        })
    }

    fn next_deadline(&self) -> Option<tokio::time::Instant> {
        self.join_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout)
    }
}

fn send_line<W: Write + ?Sized>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(ENTER)?;
    writer.flush()
}
