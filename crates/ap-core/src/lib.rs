//! ap-core: Core types and run state for autopivot
//!
//! This crate provides the configuration, error taxonomy, session types,
//! route filtering and run journal shared by the remote, local, console and
//! CLI crates.

pub mod config;
pub mod error;
pub mod journal;
pub mod privilege;
pub mod routes;
pub mod types;

pub use config::PivotConfig;
pub use error::{ConfigError, JournalError, LocalError, PivotError, RemoteError};
pub use journal::{CommandKind, JournalData, RunJournal};
pub use routes::{LocalRoutes, RouteFilter, RouteSet};
pub use types::{Credential, Listener, Session, SessionId, Target};
