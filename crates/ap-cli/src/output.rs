//! Terminal output for the run summary, teardown report and status lines
//!
//! Tables are rendered with `tabled`; status lines get a colored marker via
//! `crossterm` and go to stdout (success, info) or stderr (warning, error).

use std::io::Write;

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use ap_core::JournalData;
use ap_local::{StepResult, TeardownReport};

/// Widest a command column may grow before wrapping
const COMMAND_WIDTH: usize = 110;

#[derive(Tabled)]
struct CommandRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "WHERE")]
    side: &'static str,
    #[tabled(rename = "COMMAND")]
    command: String,
}

/// Every journaled command, grouped local, remote, console
///
/// This is the manual-cleanup reference printed before the console takes
/// over the terminal.
pub fn format_command_summary(journal: &JournalData) -> String {
    let groups: [(&'static str, &[String]); 3] = [
        ("local", &journal.local_commands),
        ("remote", &journal.remote_commands),
        ("console", &journal.console_commands),
    ];

    let rows: Vec<CommandRow> = groups
        .iter()
        .flat_map(|(side, commands)| commands.iter().map(move |c| (*side, c)))
        .enumerate()
        .map(|(i, (side, command))| CommandRow {
            index: i + 1,
            side,
            command: command.clone(),
        })
        .collect();

    if rows.is_empty() {
        return "No commands executed".to_string();
    }

    let mut out = Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(COMMAND_WIDTH))
        .to_string();
    if !journal.routes.is_empty() {
        out.push_str("\nRoutes: ");
        out.push_str(&journal.routes.join(", "));
    }
    out
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "STEP")]
    step: String,
    #[tabled(rename = "RESULT")]
    result: String,
}

/// One row per attempted teardown step
pub fn format_teardown(report: &TeardownReport) -> String {
    if report.steps.is_empty() {
        return "Nothing to tear down".to_string();
    }

    let rows: Vec<StepRow> = report
        .steps
        .iter()
        .map(|s| StepRow {
            step: s.step.clone(),
            result: match &s.result {
                StepResult::Done => "removed".to_string(),
                StepResult::AlreadyAbsent => "already absent".to_string(),
                StepResult::Failed(reason) => format!("FAILED: {}", reason),
            },
        })
        .collect();

    Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(COMMAND_WIDTH))
        .to_string()
}

#[derive(Debug, Clone, Copy)]
enum Tone {
    Success,
    Info,
    Warning,
    Error,
}

impl Tone {
    fn marker(self) -> (&'static str, Color) {
        match self {
            Tone::Success => ("✓ ", Color::Green),
            Tone::Info => ("ℹ ", Color::Cyan),
            Tone::Warning => ("⚠ ", Color::Yellow),
            Tone::Error => ("✗ ", Color::Red),
        }
    }
}

fn print_status(tone: Tone, msg: &str) {
    let (marker, color) = tone.marker();
    let mut out: Box<dyn Write> = match tone {
        Tone::Success | Tone::Info => Box::new(std::io::stdout()),
        Tone::Warning | Tone::Error => Box::new(std::io::stderr()),
    };
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(marker),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

pub fn print_success(msg: &str) {
    print_status(Tone::Success, msg);
}

pub fn print_info(msg: &str) {
    print_status(Tone::Info, msg);
}

pub fn print_warning(msg: &str) {
    print_status(Tone::Warning, msg);
}

pub fn print_error(msg: &str) {
    print_status(Tone::Error, msg);
}
