//! Route discovery across the pivot host and the local machine

use ap_core::routes::{filter_remote_routes, LocalRoutes, RouteFilter, RouteSet};
use ap_core::PivotError;
use ap_remote::RemoteExecutor;

use crate::runner::{CommandRunner, LocalCommand};

/// Remote command listing the pivot host's routes
pub const REMOTE_ROUTE_COMMAND: &str = "ip route";

/// Read the local routing table
pub async fn local_routes<L: CommandRunner + ?Sized>(local: &L) -> Result<LocalRoutes, PivotError> {
    let lines = local.run(&LocalCommand::ip(["route", "show"]), false).await?;
    let routes = LocalRoutes::parse(&lines);
    tracing::debug!("Local routing table has {} destination(s)", routes.len());
    Ok(routes)
}

/// Discover the remote networks to mirror onto the tunnel interface
///
/// A failed query on either side aborts discovery; there are no retries.
pub async fn discover_routes<R, L>(
    remote: &R,
    local: &L,
    filter: &RouteFilter,
) -> Result<RouteSet, PivotError>
where
    R: RemoteExecutor + ?Sized,
    L: CommandRunner + ?Sized,
{
    let local_table = local_routes(local).await?;
    let remote_lines = remote.execute(REMOTE_ROUTE_COMMAND, true).await?;
    let routes = filter_remote_routes(&remote_lines, &local_table, filter);
    tracing::info!("Remote routes: {:?}", routes.as_slice());
    Ok(routes)
}
