//! Tunnel console automation
//!
//! The console speaks a free-form, line-oriented text protocol. The driver
//! watches its output for a handful of markers and answers each with the
//! next setup command: select the joined agent, register listeners and
//! start the tunnel on the session's interface. After that it goes quiet
//! and the operator drives the console directly.
//!
//! The driver does no I/O. Feed it output chunks; it returns the lines to
//! send back.

use std::fmt;

use ap_core::{CommandKind, Listener, RunJournal};

/// Printed by the console when an agent connects
pub const AGENT_JOINED: &str = "Agent joined";
/// Prompt of the session selector
pub const SESSION_PROMPT: &str = "Specify a session";
/// Tail of the per-agent console prompt, e.g. `[Agent : root@pivot] »`
pub const CONSOLE_PROMPT: &str = "] »";

/// Where the automation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Waiting for the remote agent to dial in
    AwaitingAgent,
    /// `session` sent, waiting for the selector
    SessionMenu,
    /// Session chosen, waiting for the agent prompt
    SelectingSession,
    /// At the agent prompt
    Console,
    /// Registering port forwards
    AddingListeners,
    /// Tunnel start issued
    StartingTunnel,
    /// Automation done or abandoned; operator in control
    Interactive,
    /// Console process exited
    Terminated,
}

impl DriverState {
    /// Whether the driver still reacts to output
    pub fn is_automated(self) -> bool {
        !matches!(self, DriverState::Interactive | DriverState::Terminated)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Reaction to a matched marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    ListSessions,
    ChooseSession,
    ConfigureTunnel,
}

struct Transition {
    from: DriverState,
    marker: &'static str,
    action: Action,
    to: DriverState,
}

const TRANSITIONS: &[Transition] = &[
    Transition {
        from: DriverState::AwaitingAgent,
        marker: AGENT_JOINED,
        action: Action::ListSessions,
        to: DriverState::SessionMenu,
    },
    Transition {
        from: DriverState::SessionMenu,
        marker: SESSION_PROMPT,
        action: Action::ChooseSession,
        to: DriverState::SelectingSession,
    },
    Transition {
        from: DriverState::SelectingSession,
        marker: CONSOLE_PROMPT,
        action: Action::ConfigureTunnel,
        to: DriverState::Console,
    },
];

fn transition_from(state: DriverState) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| t.from == state)
}

/// Longest marker, minus one: how much output to carry between chunks
fn carry_len() -> usize {
    TRANSITIONS
        .iter()
        .map(|t| t.marker.len())
        .max()
        .unwrap_or(1)
        .saturating_sub(1)
}

/// What the driver should set up once the agent is selected
#[derive(Debug, Clone)]
pub struct TunnelPlan {
    /// Session entry to pick in the selector
    ///
    /// Always the first entry: a run deploys exactly one agent, so it is the
    /// only one joined unless something else dials the same console.
    pub session_index: String,
    /// Port forwards to register
    pub listeners: Vec<Listener>,
    /// Local tun interface the tunnel is bound to
    pub interface: String,
}

impl TunnelPlan {
    /// Plan selecting the first joined agent
    pub fn new(listeners: Vec<Listener>, interface: impl Into<String>) -> Self {
        Self {
            session_index: "1".to_string(),
            listeners,
            interface: interface.into(),
        }
    }
}

/// How the automation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationOutcome {
    /// Every setup command was sent
    Completed,
    /// Stopped waiting for `expected` while in `state`
    Abandoned { state: DriverState, expected: String },
    /// The console exited before automation finished
    Interrupted { state: DriverState },
}

/// Marker-driven state machine over console output
pub struct ConsoleDriver {
    state: DriverState,
    plan: TunnelPlan,
    journal: RunJournal,
    carry: Vec<u8>,
    visited: Vec<DriverState>,
    outcome: Option<AutomationOutcome>,
}

impl ConsoleDriver {
    /// Driver in `AwaitingAgent`
    pub fn new(plan: TunnelPlan, journal: RunJournal) -> Self {
        Self {
            state: DriverState::AwaitingAgent,
            plan,
            journal,
            carry: Vec::new(),
            visited: vec![DriverState::AwaitingAgent],
            outcome: None,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn visited(&self) -> &[DriverState] {
        &self.visited
    }

    /// Final outcome, once automation has stopped
    pub fn outcome(&self) -> Option<&AutomationOutcome> {
        self.outcome.as_ref()
    }

    /// Marker the current state is waiting for
    pub fn expected_marker(&self) -> Option<&'static str> {
        transition_from(self.state).map(|t| t.marker)
    }

    /// Process a chunk of console output and return the lines to send
    ///
    /// Markers split across chunk boundaries still match. Once the driver
    /// is interactive every chunk is ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut commands = Vec::new();
        if !self.state.is_automated() {
            return commands;
        }

        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(chunk);

        while let Some(transition) = transition_from(self.state) {
            let Some(end) = find(&window, transition.marker.as_bytes()) else {
                break;
            };
            tracing::debug!(
                "Console marker {:?} seen in {}",
                transition.marker,
                self.state
            );
            window.drain(..end);
            self.enter(transition.to);
            self.act(transition.action, &mut commands);
        }

        if self.state.is_automated() {
            let keep = carry_len().min(window.len());
            self.carry = window.split_off(window.len() - keep);
        }
        commands
    }

    /// Give up waiting and hand control to the operator
    ///
    /// Returns `None` if automation had already stopped.
    pub fn abandon(&mut self) -> Option<AutomationOutcome> {
        if !self.state.is_automated() {
            return None;
        }
        let outcome = AutomationOutcome::Abandoned {
            state: self.state,
            expected: self.expected_marker().unwrap_or_default().to_string(),
        };
        tracing::warn!(
            "Console automation stalled in {} waiting for {:?}; complete the setup manually",
            self.state,
            self.expected_marker().unwrap_or_default()
        );
        self.finish(DriverState::Interactive, outcome.clone());
        Some(outcome)
    }

    /// The console process exited
    pub fn terminate(&mut self) {
        if self.state.is_automated() {
            let outcome = AutomationOutcome::Interrupted { state: self.state };
            self.finish(DriverState::Terminated, outcome);
        } else {
            self.enter(DriverState::Terminated);
        }
    }

    fn act(&mut self, action: Action, commands: &mut Vec<String>) {
        match action {
            Action::ListSessions => self.send("session".to_string(), commands),
            Action::ChooseSession => self.send(self.plan.session_index.clone(), commands),
            Action::ConfigureTunnel => {
                self.enter(DriverState::AddingListeners);
                for listener in self.plan.listeners.clone() {
                    let line = listener_command(&listener);
                    tracing::debug!("Adding listener {}", line);
                    self.send(line, commands);
                }

                self.enter(DriverState::StartingTunnel);
                tracing::debug!("Starting tunnel on {}", self.plan.interface);
                self.send(format!("start --tun {}", self.plan.interface), commands);

                self.finish(DriverState::Interactive, AutomationOutcome::Completed);
            }
        }
    }

    fn send(&mut self, line: String, commands: &mut Vec<String>) {
        self.journal.record(CommandKind::Console, line.as_str());
        commands.push(line);
    }

    fn enter(&mut self, state: DriverState) {
        self.state = state;
        self.visited.push(state);
    }

    fn finish(&mut self, state: DriverState, outcome: AutomationOutcome) {
        self.enter(state);
        self.carry.clear();
        self.outcome = Some(outcome);
    }
}

/// Console command registering a TCP port forward
pub fn listener_command(listener: &Listener) -> String {
    format!(
        "listener_add --tcp --addr 0.0.0.0:{} --to 127.0.0.1:{}",
        listener.local_port, listener.remote_port
    )
}

/// Byte offset just past the first occurrence of `needle`
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|start| start + needle.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listeners(base: u16, n: u16) -> Vec<Listener> {
        (1..=n)
            .map(|i| Listener {
                local_port: base + i,
                remote_port: base + i,
            })
            .collect()
    }

    fn driver(n: u16) -> (ConsoleDriver, RunJournal) {
        let journal = RunJournal::new();
        let plan = TunnelPlan::new(listeners(11600, n), "ligolo1");
        (ConsoleDriver::new(plan, journal.clone()), journal)
    }

    #[test]
    fn test_full_sequence() {
        let (mut driver, journal) = driver(3);
        let mut sent = Vec::new();
        sent.extend(driver.feed(b"INFO[0031] Agent joined. name=root@pivot\n"));
        sent.extend(driver.feed(b"? Specify a session : "));
        sent.extend(driver.feed("[Agent : root@pivot] » ".as_bytes()));

        assert_eq!(
            sent,
            vec![
                "session",
                "1",
                "listener_add --tcp --addr 0.0.0.0:11601 --to 127.0.0.1:11601",
                "listener_add --tcp --addr 0.0.0.0:11602 --to 127.0.0.1:11602",
                "listener_add --tcp --addr 0.0.0.0:11603 --to 127.0.0.1:11603",
                "start --tun ligolo1",
            ]
        );
        assert_eq!(driver.state(), DriverState::Interactive);
        assert_eq!(driver.outcome(), Some(&AutomationOutcome::Completed));
        assert_eq!(journal.commands(CommandKind::Console), sent);
        assert_eq!(
            driver.visited(),
            [
                DriverState::AwaitingAgent,
                DriverState::SessionMenu,
                DriverState::SelectingSession,
                DriverState::Console,
                DriverState::AddingListeners,
                DriverState::StartingTunnel,
                DriverState::Interactive,
            ]
        );
    }

    #[test]
    fn test_only_agent_joined_leaves_awaiting() {
        let (mut driver, _) = driver(5);
        for noise in [
            &b"Specify a session : "[..],
            "[Agent : x] » ".as_bytes(),
            b"Agent join",
            b"agent joined",
            b"WARN[0000] Using automatically generated self-signed certificates\n",
        ] {
            assert!(driver.feed(noise).is_empty());
            assert_eq!(driver.state(), DriverState::AwaitingAgent);
        }
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let (mut driver, _) = driver(1);
        assert!(driver.feed(b"INFO[0031] Agent jo").is_empty());
        assert_eq!(driver.feed(b"ined. name=root@pivot"), vec!["session"]);

        // "»" is two bytes; split it down the middle
        let prompt = "[Agent : root@pivot] »".as_bytes();
        let (head, tail) = prompt.split_at(prompt.len() - 1);
        assert_eq!(driver.feed(b"Specify a session : "), vec!["1"]);
        assert!(driver.feed(head).is_empty());
        assert_eq!(driver.feed(tail).len(), 2);
    }

    #[test]
    fn test_stale_marker_does_not_retrigger() {
        let (mut driver, _) = driver(0);
        assert_eq!(driver.feed(b"Agent joined"), vec!["session"]);
        // the same text again must not advance past SessionMenu
        assert!(driver.feed(b"Agent joined").is_empty());
        assert_eq!(driver.state(), DriverState::SessionMenu);
    }

    #[test]
    fn test_zero_listeners_still_starts_tunnel() {
        let (mut driver, _) = driver(0);
        driver.feed(b"Agent joined");
        driver.feed(b"Specify a session :");
        assert_eq!(driver.feed("] »".as_bytes()), vec!["start --tun ligolo1"]);
    }

    #[test]
    fn test_interactive_ignores_output() {
        let (mut driver, journal) = driver(1);
        driver.feed(b"Agent joined");
        driver.feed(b"Specify a session :");
        driver.feed("] »".as_bytes());
        let count = journal.commands(CommandKind::Console).len();

        assert!(driver.feed(b"Agent joined").is_empty());
        assert!(driver.feed("] »".as_bytes()).is_empty());
        assert_eq!(journal.commands(CommandKind::Console).len(), count);
    }

    #[test]
    fn test_abandon_hands_over() {
        let (mut driver, _) = driver(2);
        driver.feed(b"Agent joined");
        let outcome = driver.abandon().unwrap();
        assert_eq!(
            outcome,
            AutomationOutcome::Abandoned {
                state: DriverState::SessionMenu,
                expected: SESSION_PROMPT.to_string(),
            }
        );
        assert_eq!(driver.state(), DriverState::Interactive);
        assert!(driver.abandon().is_none());
        assert!(driver.feed(b"Specify a session :").is_empty());
    }

    #[test]
    fn test_terminate_before_completion() {
        let (mut driver, _) = driver(2);
        driver.terminate();
        assert_eq!(driver.state(), DriverState::Terminated);
        assert_eq!(
            driver.outcome(),
            Some(&AutomationOutcome::Interrupted {
                state: DriverState::AwaitingAgent
            })
        );
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abc] xyz", b"] "), Some(5));
        assert_eq!(find(b"ab", b"abc"), None);
        assert_eq!(find(b"abc", b""), None);
    }

    #[derive(Clone, Default)]
    struct Capture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_completed_automation_is_silent_at_info() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let (mut driver, _) = driver(2);
        tracing::subscriber::with_default(subscriber, || {
            driver.feed(b"Agent joined");
            driver.feed(b"Specify a session :");
            driver.feed("[Agent : root@pivot] » ".as_bytes());
        });

        assert_eq!(driver.outcome(), Some(&AutomationOutcome::Completed));
        let logged = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(logged.is_empty(), "raw-mode console got log lines: {}", logged);
    }
}
