//! ap-console: Interactive tunnel console automation
//!
//! Hosts the local tunnel console in a PTY and answers its setup prompts
//! before handing the terminal to the operator.

pub mod driver;
pub mod session;

pub use driver::{AutomationOutcome, ConsoleDriver, DriverState, TunnelPlan};
pub use session::{ConsoleCommand, ConsoleExit, ConsoleSession};
