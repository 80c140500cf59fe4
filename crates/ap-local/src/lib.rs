//! ap-local: Local side of a pivot run
//!
//! Runs privileged iproute2 commands, discovers which remote routes to
//! mirror, and provisions the session's tun interface.

pub mod discovery;
pub mod interface;
pub mod runner;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use discovery::discover_routes;
pub use interface::{InterfaceProvisioner, StepOutcome, StepResult, TeardownReport};
pub use runner::{CommandRunner, LocalCommand, ProcessRunner};
