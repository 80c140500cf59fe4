//! ap-remote: Remote side of a pivot run
//!
//! Runs commands on and uploads files to the pivot host over SSH, and
//! deploys the tunnel agent there.

pub mod channel;
pub mod deployer;

pub use channel::{ChannelTimeouts, RemoteExecutor, SshChannel};
pub use deployer::AgentDeployer;
