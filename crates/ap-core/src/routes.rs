//! Route table parsing and filtering
//!
//! Turns `ip route` output from both ends into the set of remote networks to
//! mirror onto the local tunnel interface.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

/// Route types that never describe a forwardable destination
const NON_FORWARDING_TYPES: &[&str] = &[
    "unreachable",
    "blackhole",
    "prohibit",
    "throw",
    "local",
    "broadcast",
    "multicast",
    "anycast",
    "nat",
];

/// Which remote routes are worth mirroring
#[derive(Debug, Clone)]
pub struct RouteFilter {
    /// Lines containing any of these are skipped (tunnel/container devices)
    pub exclude: Vec<String>,
    /// Skip host routes
    pub skip_host_routes: bool,
}

impl Default for RouteFilter {
    fn default() -> Self {
        Self {
            exclude: vec!["tun".to_string(), "docker".to_string()],
            skip_host_routes: true,
        }
    }
}

/// Ordered set of route destinations to install locally
///
/// Never contains a default route, and never contains a destination that
/// overlaps a route already present in the local table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet(Vec<String>);

impl RouteSet {
    /// Wrap an already-filtered list (e.g. loaded from a journal)
    pub fn from_vec(routes: Vec<String>) -> Self {
        Self(routes)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a RouteSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Destinations present in the local routing table
#[derive(Debug, Clone, Default)]
pub struct LocalRoutes {
    raw: HashSet<String>,
    nets: Vec<IpNet>,
}

impl LocalRoutes {
    /// Build from `ip route` output, discarding the default route
    pub fn parse<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut routes = Self::default();
        for line in lines {
            if let Some(dest) = destination(line.as_ref()) {
                if dest == "default" {
                    continue;
                }
                routes.insert(dest);
            }
        }
        routes
    }

    fn insert(&mut self, dest: &str) {
        if let Some(net) = parse_net(dest) {
            self.nets.push(net);
        }
        self.raw.insert(dest.to_string());
    }

    /// Whether `dest` equals or overlaps any local destination
    pub fn overlaps(&self, dest: &str) -> bool {
        if self.raw.contains(dest) {
            return true;
        }
        match parse_net(dest) {
            Some(net) => self
                .nets
                .iter()
                .any(|local| local.contains(&net) || net.contains(local)),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Destination token of an `ip route` line
///
/// Skips the optional `unicast` keyword; returns `None` for blank lines and
/// non-forwarding route types.
pub fn destination(line: &str) -> Option<&str> {
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    if first == "unicast" {
        return tokens.next();
    }
    if NON_FORWARDING_TYPES.contains(&first) {
        return None;
    }
    Some(first)
}

/// Whether a destination names a single host
///
/// The kernel prints host routes without a prefix length, so a bare IPv4
/// address counts as well as an explicit `/32`.
pub fn is_host_route(dest: &str) -> bool {
    if dest.ends_with("/32") {
        return true;
    }
    !dest.contains('/') && matches!(dest.parse::<IpAddr>(), Ok(IpAddr::V4(_)))
}

fn parse_net(dest: &str) -> Option<IpNet> {
    if let Ok(net) = dest.parse::<IpNet>() {
        return Some(net.trunc());
    }
    dest.parse::<IpAddr>().ok().map(IpNet::from)
}

/// Select the remote routes to mirror locally
///
/// Lines are considered in order: blank lines, default routes, lines matching
/// an exclusion substring, host routes (when skipped), routes overlapping the
/// local table and duplicates are dropped. Survivors keep their order.
pub fn filter_remote_routes<I, S>(lines: I, local: &LocalRoutes, filter: &RouteFilter) -> RouteSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut selected: Vec<String> = Vec::new();

    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("default") {
            continue;
        }
        if let Some(pattern) = filter.exclude.iter().find(|p| line.contains(p.as_str())) {
            tracing::debug!("Not including route {} (matches {:?})", line, pattern);
            continue;
        }
        let Some(dest) = destination(line) else {
            tracing::debug!("Ignoring non-forwarding route {}", line);
            continue;
        };
        if filter.skip_host_routes && is_host_route(dest) {
            tracing::debug!("Ignoring host route {}", dest);
            continue;
        }
        if local.overlaps(dest) {
            tracing::debug!("Route {} already reachable locally", dest);
            continue;
        }
        if selected.iter().any(|r| r == dest) {
            continue;
        }
        selected.push(dest.to_string());
    }

    RouteSet(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(exclude: &[&str], skip_host_routes: bool) -> RouteFilter {
        RouteFilter {
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            skip_host_routes,
        }
    }

    #[test]
    fn test_mixed_remote_table() {
        let remote = [
            "10.0.0.0/24 dev eth0",
            "192.168.1.5/32 dev eth0",
            "default via 10.0.0.1",
            "10.1.0.0/24 dev tun0",
        ];
        let local = LocalRoutes::parse(["10.1.0.0/24 dev wg0"]);
        let routes = filter_remote_routes(remote, &local, &filter(&["tun"], true));
        assert_eq!(routes.as_slice(), ["10.0.0.0/24"]);
    }

    #[test]
    fn test_local_parse_drops_default() {
        let local = LocalRoutes::parse([
            "default via 192.168.0.1 dev wlan0 proto dhcp metric 600",
            "192.168.0.0/24 dev wlan0 proto kernel scope link src 192.168.0.42",
            "",
        ]);
        assert_eq!(local.len(), 1);
        assert!(local.overlaps("192.168.0.0/24"));
        assert!(!local.overlaps("default"));
    }

    #[test]
    fn test_overlapping_networks_are_skipped() {
        let local = LocalRoutes::parse(["10.0.0.0/8 dev eth1"]);
        let routes = filter_remote_routes(
            [
                "10.20.0.0/16 dev eth0 proto kernel",
                "172.16.5.0/24 dev eth1 proto kernel",
            ],
            &local,
            &RouteFilter::default(),
        );
        assert_eq!(routes.as_slice(), ["172.16.5.0/24"]);
    }

    #[test]
    fn test_wider_remote_route_overlapping_local_is_skipped() {
        let local = LocalRoutes::parse(["172.16.5.0/24 dev eth1"]);
        let routes =
            filter_remote_routes(["172.16.0.0/12 dev eth0"], &local, &RouteFilter::default());
        assert!(routes.is_empty());
    }

    #[test]
    fn test_host_routes_without_prefix() {
        assert!(is_host_route("192.168.1.5/32"));
        assert!(is_host_route("192.168.1.5"));
        assert!(!is_host_route("192.168.1.0/24"));
        assert!(!is_host_route("fe80::/64"));

        let local = LocalRoutes::default();
        let remote = ["169.254.169.254 dev eth0", "10.9.0.0/16 dev eth0"];
        let skipped = filter_remote_routes(remote, &local, &filter(&[], true));
        assert_eq!(skipped.as_slice(), ["10.9.0.0/16"]);

        let kept = filter_remote_routes(remote, &local, &filter(&[], false));
        assert_eq!(kept.as_slice(), ["169.254.169.254", "10.9.0.0/16"]);
    }

    #[test]
    fn test_exclusions_match_whole_line() {
        let local = LocalRoutes::default();
        let routes = filter_remote_routes(
            [
                "172.17.0.0/16 dev docker0 proto kernel scope link src 172.17.0.1 linkdown",
                "10.8.0.0/24 dev tun0 proto kernel",
                "10.50.0.0/24 dev ens3",
            ],
            &local,
            &RouteFilter::default(),
        );
        assert_eq!(routes.as_slice(), ["10.50.0.0/24"]);
    }

    #[test]
    fn test_order_preserved_and_duplicates_dropped() {
        let local = LocalRoutes::default();
        let routes = filter_remote_routes(
            [
                "  10.3.0.0/24 dev eth2  ",
                "10.1.0.0/24 dev eth0",
                "10.3.0.0/24 dev eth3 metric 200",
                "unreachable 10.99.0.0/16",
                "unicast 10.2.0.0/24 dev eth1",
            ],
            &local,
            &filter(&[], true),
        );
        assert_eq!(
            routes.as_slice(),
            ["10.3.0.0/24", "10.1.0.0/24", "10.2.0.0/24"]
        );
    }

    #[test]
    fn test_never_yields_default_or_local() {
        let local = LocalRoutes::parse(["10.0.0.0/24 dev eth0", "default via 10.0.0.1"]);
        let remote = [
            "default via 10.10.0.1 dev eth0",
            "10.0.0.0/24 dev eth0",
            "0.0.0.0/1 via 10.10.0.1",
            "10.10.0.0/24 dev eth0",
        ];
        let routes = filter_remote_routes(remote, &local, &filter(&[], true));
        for route in &routes {
            assert_ne!(route, "default");
            assert!(!local.overlaps(route));
        }
        assert!(routes.iter().any(|r| r == "10.10.0.0/24"));
    }
}
