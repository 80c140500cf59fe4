//! autopivot: run controller and terminal output for the `autopivot` binary

pub mod orchestrator;
pub mod output;
