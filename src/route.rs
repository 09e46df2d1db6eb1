//! Default gateway discovery for the LAN conflict checks.

use std::net::{IpAddr, Ipv4Addr};

/// The IPv4 default gateway and the netmask of the LAN it sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LanGateway {
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl LanGateway {
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.gateway) & u32::from(self.netmask))
    }
}

/// Look up the default gateway of the host, `None` when there is none or the
/// lookup is not possible on this platform.
pub fn default_gateway() -> Option<LanGateway> {
    let (if_index, gateway) = match default_route() {
        Ok(Some(route)) => route,
        Ok(None) => return None,
        Err(e) => {
            log::debug!("default gateway lookup failed: {e}");
            return None;
        }
    };
    let addrs = match getifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            log::debug!("getifaddrs failed: {e}");
            return None;
        }
    };
    let candidates = addrs
        .filter(|v| if_index.is_none() || v.index == if_index)
        .map(|v| (v.address, v.netmask));
    let netmask = lan_netmask(candidates, gateway)?;
    Some(LanGateway { gateway, netmask })
}

/// Pick the netmask of the interface address whose subnet contains `gateway`.
pub(crate) fn lan_netmask<I>(addrs: I, gateway: Ipv4Addr) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = (IpAddr, Option<IpAddr>)>,
{
    let gw = u32::from(gateway);
    addrs.into_iter().find_map(|(addr, mask)| match (addr, mask) {
        (IpAddr::V4(addr), Some(IpAddr::V4(mask))) => {
            let m = u32::from(mask);
            (u32::from(addr) & m == gw & m).then_some(mask)
        }
        _ => None,
    })
}

/// One routing table entry, as far as the default route lookup cares.
#[cfg_attr(
    not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )),
    allow(dead_code)
)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RouteEntry {
    pub destination: IpAddr,
    pub prefix: u8,
    pub gateway: Option<IpAddr>,
    pub if_index: Option<u32>,
}

/// The first IPv4 `0.0.0.0/0` entry that has a next hop.
#[cfg_attr(
    not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )),
    allow(dead_code)
)]
pub(crate) fn select_default<I>(routes: I) -> Option<DefaultRoute>
where
    I: IntoIterator<Item = RouteEntry>,
{
    routes.into_iter().find_map(|route| match (route.destination, route.gateway) {
        (IpAddr::V4(dest), Some(IpAddr::V4(gw)))
            if dest.is_unspecified() && route.prefix == 0 && !gw.is_unspecified() =>
        {
            Some((route.if_index, gw))
        }
        _ => None,
    })
}

/// Interface index (when known) and next hop of the default route.
type DefaultRoute = (Option<u32>, Ipv4Addr);

#[cfg(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
fn default_route() -> std::io::Result<Option<DefaultRoute>> {
    let mut manager = route_manager::RouteManager::new()?;
    let routes = manager.list()?;
    let entries = routes.iter().map(|route| RouteEntry {
        destination: route.destination(),
        prefix: route.prefix(),
        gateway: route.gateway(),
        if_index: route.if_index(),
    });
    Ok(select_default(entries))
}

#[cfg(windows)]
fn default_route() -> std::io::Result<Option<DefaultRoute>> {
    crate::platform::windows::iphlp::best_route_to_any()
        .map(|route| route.map(|(index, gw)| (Some(index), gw)))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    windows
)))]
fn default_route() -> std::io::Result<Option<DefaultRoute>> {
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(dest: [u8; 4], prefix: u8, gw: Option<[u8; 4]>, if_index: u32) -> RouteEntry {
        RouteEntry {
            destination: IpAddr::from(dest),
            prefix,
            gateway: gw.map(IpAddr::from),
            if_index: Some(if_index),
        }
    }

    #[test]
    fn default_route_is_the_v4_catch_all_with_a_gateway() {
        let routes = vec![
            entry([172, 16, 0, 0], 16, None, 2),
            RouteEntry {
                destination: "::".parse().unwrap(),
                prefix: 0,
                gateway: Some("fe80::1".parse().unwrap()),
                if_index: Some(2),
            },
            entry([0, 0, 0, 0], 0, None, 7),
            entry([0, 0, 0, 0], 0, Some([172, 16, 0, 1]), 2),
            entry([0, 0, 0, 0], 0, Some([192, 168, 1, 1]), 3),
        ];
        assert_eq!(
            select_default(routes),
            Some((Some(2), Ipv4Addr::new(172, 16, 0, 1)))
        );
        assert_eq!(
            select_default(vec![entry([10, 0, 0, 0], 8, Some([10, 0, 0, 1]), 1)]),
            None
        );
    }

    #[test]
    fn netmask_of_matching_address() {
        let addrs = vec![
            (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), Some(IpAddr::V4(Ipv4Addr::new(255, 0, 0, 0)))),
            ("fe80::1".parse().unwrap(), None),
            (
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
                Some(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0))),
            ),
        ];
        assert_eq!(
            lan_netmask(addrs.clone(), Ipv4Addr::new(192, 168, 1, 1)),
            Some(Ipv4Addr::new(255, 255, 255, 0))
        );
        assert_eq!(lan_netmask(addrs, Ipv4Addr::new(172, 16, 0, 1)), None);
        let lan = LanGateway {
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        };
        assert_eq!(lan.network(), Ipv4Addr::new(192, 168, 1, 0));
    }
}
