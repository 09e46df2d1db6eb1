//! Device classification and ifconfig address checks.
//!
//! Everything here is pure. Checks that can only ever produce warnings
//! return an [`Advisory`] which the caller logs (or surfaces to a user);
//! checks that are fatal return [`Error`].

use crate::error::{Error, Result};
use crate::route::LanGateway;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

const SILENCE_HINT: &str = "(silence this warning by disabling strict ifconfig checks)";

/// The kind of virtual device requested by name or explicit type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    #[default]
    Undefined,
    /// Packets are discarded and nothing is opened.
    Null,
    /// Layer 3 tunnel.
    Tun,
    /// Layer 2 (ethernet) tunnel.
    Tap,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Tun => "tun",
            DeviceKind::Tap => "tap",
            DeviceKind::Null => "null",
            DeviceKind::Undefined => "[unknown-dev-type]",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressing model of a tun device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Topology {
    /// One /30 per client.
    #[default]
    Net30,
    /// Plain point-to-point pair.
    P2P,
    /// Local address plus netmask, like a TAP adapter.
    Subnet,
}

impl FromStr for Topology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "net30" => Ok(Topology::Net30),
            "p2p" => Ok(Topology::P2P),
            "subnet" => Ok(Topology::Subnet),
            other => Err(Error::Config(format!("unknown topology '{other}'"))),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topology::Net30 => "net30",
            Topology::P2P => "p2p",
            Topology::Subnet => "subnet",
        })
    }
}

fn is_dev_type(name: Option<&str>, explicit_type: Option<&str>, kind: &str) -> bool {
    let Some(name) = name else {
        return false;
    };
    match explicit_type {
        Some(t) => t == kind,
        None => name.starts_with(kind),
    }
}

/// Resolve the device kind from a device name and an optional explicit type.
///
/// An explicit type must match exactly; without one the name prefix decides,
/// so `tun7` is a tun device and `foo` is undefined.
pub fn classify(name: Option<&str>, explicit_type: Option<&str>) -> DeviceKind {
    if is_dev_type(name, explicit_type, "tun") {
        DeviceKind::Tun
    } else if is_dev_type(name, explicit_type, "tap") {
        DeviceKind::Tap
    } else if is_dev_type(name, explicit_type, "null") {
        DeviceKind::Null
    } else {
        DeviceKind::Undefined
    }
}

pub fn dev_type_string(name: Option<&str>, explicit_type: Option<&str>) -> &'static str {
    classify(name, explicit_type).as_str()
}

/// True when the second ifconfig parameter is a peer address rather than a netmask.
pub fn is_point_to_point(kind: DeviceKind, topology: Topology) -> Result<bool> {
    match (kind, topology) {
        (DeviceKind::Tap, _) | (DeviceKind::Tun, Topology::Subnet) => Ok(false),
        (DeviceKind::Tun, _) => Ok(true),
        (other, _) => Err(Error::Config(format!(
            "problem with tun vs. tap setting: device kind is {other}"
        ))),
    }
}

pub fn broadcast_of(local: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(local) | !u32::from(netmask))
}

pub fn looks_like_netmask(addr: Ipv4Addr) -> bool {
    u32::from(addr) & 0xFF00_0000 == 0xFF00_0000
}

/// Non-fatal finding produced by the address checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Advisory {
    /// A point-to-point tun got something that looks like a netmask.
    PeerLooksLikeNetmask(Ipv4Addr),
    /// A tap device got something that does not look like a netmask.
    NetmaskExpected(Ipv4Addr),
    /// A public endpoint equals one of the ifconfig addresses.
    EndpointConflict {
        role: String,
        public: Ipv4Addr,
        local: Ipv4Addr,
        remote_netmask: Ipv4Addr,
    },
    /// A public endpoint shares a /24 with an ifconfig address.
    EndpointSameSlash24 {
        role: String,
        public: Ipv4Addr,
        local: Ipv4Addr,
        remote_netmask: Ipv4Addr,
    },
    /// A public endpoint lies inside the tap subnet.
    EndpointInsideSubnet {
        role: String,
        public: Ipv4Addr,
        local: Ipv4Addr,
        netmask: Ipv4Addr,
    },
    /// The VPN subnet intersects the LAN behind the default gateway.
    LanSubnetConflict {
        label: String,
        lan_network: Ipv4Addr,
        lan_netmask: Ipv4Addr,
        network: Ipv4Addr,
        netmask: Ipv4Addr,
    },
    /// The LAN uses 192.168.0.x or 192.168.1.x.
    CommonLanSubnet(Ipv4Addr),
    /// IPv6 requested on a backend without explicit IPv6 framing.
    Ipv6Unsupported,
}

impl Advisory {
    /// True for the weaker "same /24" finding.
    pub fn is_minor(&self) -> bool {
        matches!(self, Advisory::EndpointSameSlash24 { .. })
    }

    pub fn log(&self) {
        log::warn!("{self}");
    }
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::PeerLooksLikeNetmask(addr) => write!(
                f,
                "WARNING: Since you are using a tun device with a point-to-point topology, \
                 the second ifconfig argument must be an IP address. You are using something \
                 ({addr}) that looks more like a netmask. {SILENCE_HINT}"
            ),
            Advisory::NetmaskExpected(_) => write!(
                f,
                "WARNING: Since you are using a tap device, the second ifconfig argument must \
                 be a netmask, for example something like 255.255.255.0. {SILENCE_HINT}"
            ),
            Advisory::EndpointConflict {
                role,
                public,
                local,
                remote_netmask,
            } => write!(
                f,
                "WARNING: {role} address [{public}] conflicts with ifconfig address pair \
                 [{local}, {remote_netmask}]. {SILENCE_HINT}"
            ),
            Advisory::EndpointSameSlash24 {
                role,
                public,
                local,
                remote_netmask,
            } => write!(
                f,
                "WARNING: potential conflict between {role} address [{public}] and ifconfig \
                 address pair [{local}, {remote_netmask}] -- this is a warning only that is \
                 triggered when local/remote addresses exist within the same /24 subnet as \
                 ifconfig endpoints. {SILENCE_HINT}"
            ),
            Advisory::EndpointInsideSubnet {
                role,
                public,
                local,
                netmask,
            } => write!(
                f,
                "WARNING: {role} address [{public}] conflicts with ifconfig subnet \
                 [{local}, {netmask}] -- local and remote addresses cannot be inside of the \
                 ifconfig subnet. {SILENCE_HINT}"
            ),
            Advisory::LanSubnetConflict {
                label,
                lan_network,
                lan_netmask,
                network,
                netmask,
            } => write!(
                f,
                "WARNING: potential {label} subnet conflict between local LAN \
                 [{lan_network}/{lan_netmask}] and remote VPN [{network}/{netmask}]"
            ),
            Advisory::CommonLanSubnet(net) => write!(
                f,
                "NOTE: your local LAN ({net}) uses the extremely common subnet address \
                 192.168.0.x or 192.168.1.x. Be aware that this might create routing conflicts \
                 if you connect to the VPN server from public locations such as internet cafes \
                 that use the same subnet."
            ),
            Advisory::Ipv6Unsupported => write!(
                f,
                "NOTE: explicit support for IPv6 tun devices is not provided for this OS"
            ),
        }
    }
}

/// Heuristic check of the second ifconfig parameter against the device kind.
pub fn sanity_check(
    kind: DeviceKind,
    remote_netmask: Ipv4Addr,
    topology: Topology,
) -> Option<Advisory> {
    let netmask_like = looks_like_netmask(remote_netmask);
    match kind {
        DeviceKind::Tun => {
            if netmask_like && matches!(topology, Topology::Net30 | Topology::P2P) {
                Some(Advisory::PeerLooksLikeNetmask(remote_netmask))
            } else {
                None
            }
        }
        _ => {
            if netmask_like {
                None
            } else {
                Some(Advisory::NetmaskExpected(remote_netmask))
            }
        }
    }
}

/// Check that a public endpoint does not collide with the virtual addresses.
///
/// An unspecified public address is never checked. A tun device may produce
/// two findings: an exact collision and a same-/24 proximity warning.
pub fn check_addr_clash(
    role: &str,
    kind: DeviceKind,
    public: Ipv4Addr,
    local: Ipv4Addr,
    remote_netmask: Ipv4Addr,
) -> Vec<Advisory> {
    let mut found = Vec::new();
    if public.is_unspecified() {
        return found;
    }
    let p = u32::from(public);
    let l = u32::from(local);
    let r = u32::from(remote_netmask);
    match kind {
        DeviceKind::Tun => {
            const TEST_NETMASK: u32 = 0xFFFF_FF00;
            if p == l || p == r {
                found.push(Advisory::EndpointConflict {
                    role: role.to_string(),
                    public,
                    local,
                    remote_netmask,
                });
            }
            let public_net = p & TEST_NETMASK;
            if public_net == l & TEST_NETMASK || public_net == r & TEST_NETMASK {
                found.push(Advisory::EndpointSameSlash24 {
                    role: role.to_string(),
                    public,
                    local,
                    remote_netmask,
                });
            }
        }
        DeviceKind::Tap => {
            if p & r == l & r {
                found.push(Advisory::EndpointInsideSubnet {
                    role: role.to_string(),
                    public,
                    local,
                    netmask: remote_netmask,
                });
            }
        }
        _ => {}
    }
    found
}

/// Do `ip/netmask` and the LAN behind the default gateway intersect?
pub fn subnet_conflict(
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    label: &str,
    lan: &LanGateway,
) -> Option<Advisory> {
    let lan_netmask = u32::from(lan.netmask);
    let lan_network = u32::from(lan.gateway) & lan_netmask;
    let mask = u32::from(netmask);
    let network = u32::from(ip) & mask;
    if network & lan_netmask == lan_network || lan_network & mask == network {
        Some(Advisory::LanSubnetConflict {
            label: label.to_string(),
            lan_network: lan_network.into(),
            lan_netmask: lan.netmask,
            network: network.into(),
            netmask,
        })
    } else {
        None
    }
}

/// Query the host default gateway and compare it against `ip/netmask`.
pub fn check_subnet_conflict(ip: Ipv4Addr, netmask: Ipv4Addr, label: &str) -> Option<Advisory> {
    let lan = crate::route::default_gateway()?;
    subnet_conflict(ip, netmask, label, &lan)
}

pub fn common_subnet_advisory(lan: &LanGateway) -> Option<Advisory> {
    let network = u32::from(lan.gateway) & u32::from(lan.netmask);
    if network == 0xC0A8_0000 || network == 0xC0A8_0100 {
        Some(Advisory::CommonLanSubnet(network.into()))
    } else {
        None
    }
}

/// Warn when the local LAN uses 192.168.0.x or 192.168.1.x.
pub fn warn_on_use_of_common_subnets() -> Option<Advisory> {
    let lan = crate::route::default_gateway()?;
    let advisory = common_subnet_advisory(&lan)?;
    advisory.log();
    Some(advisory)
}

/// Validate a point-to-point pair for drivers limited to a /30.
///
/// Both addresses must differ, sit in the same /30, and neither may be the
/// network or broadcast address of that /30.
pub fn verify_tight_point_to_point(local: Ipv4Addr, remote: Ipv4Addr) -> Result<()> {
    const MASK: u32 = !3;
    let l = u32::from(local);
    let r = u32::from(remote);
    let err = |why: &str| {
        let e = Error::Topology(format!(
            "There is a problem in your selection of ifconfig endpoints [local={local}, \
             remote={remote}]. The local and remote VPN endpoints {why}. Try \
             'valid_point_to_point_pairs' to show valid choices."
        ));
        log::error!("{e}");
        e
    };
    if l == r {
        return Err(err("must be different"));
    }
    if l & MASK != r & MASK {
        return Err(err(
            "must exist within the same 255.255.255.252 subnet. This is a limitation of \
             --dev tun when used with the TAP-WIN32 driver",
        ));
    }
    let test = |host: u32| {
        let low = host & 3;
        low == 0 || low == 3
    };
    if test(l) || test(r) {
        return Err(err(
            "cannot use the last significant octet values of 0 or 3 within their /30 subnet",
        ));
    }
    Ok(())
}

/// Every valid `[local, remote]` pair of the last octet for /30 point-to-point.
pub fn valid_point_to_point_pairs() -> Vec<[u8; 2]> {
    (0u8..64).map(|i| [i * 4 + 1, i * 4 + 2]).collect()
}

/// Peer compatibility string describing the ifconfig setup.
///
/// Subnet style devices report `network netmask`; point-to-point devices
/// report `remote local`, mirrored when describing the peer's view.
pub fn ifconfig_options_string(
    kind: DeviceKind,
    topology: Topology,
    local: Ipv4Addr,
    remote_netmask: Ipv4Addr,
    remote: bool,
) -> String {
    match (kind, topology) {
        (DeviceKind::Tap, _) | (DeviceKind::Tun, Topology::Subnet) => {
            let network = Ipv4Addr::from(u32::from(local) & u32::from(remote_netmask));
            format!("{network} {remote_netmask}")
        }
        (DeviceKind::Tun, _) => {
            let (l, r) = if remote {
                (remote_netmask, local)
            } else {
                (local, remote_netmask)
            };
            format!("{r} {l}")
        }
        _ => "[undef]".to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn classify_by_name_and_type() {
        assert_eq!(classify(Some("tun7"), None), DeviceKind::Tun);
        assert_eq!(classify(Some("foo"), Some("tap")), DeviceKind::Tap);
        assert_eq!(classify(Some("foo"), None), DeviceKind::Undefined);
        assert_eq!(classify(Some("null"), None), DeviceKind::Null);
        assert_eq!(classify(None, Some("tun")), DeviceKind::Undefined);
        // An explicit type overrides the name and must match exactly.
        assert_eq!(classify(Some("tap0"), Some("tunx")), DeviceKind::Undefined);
        assert_eq!(dev_type_string(Some("tap3"), None), "tap");
        assert_eq!(dev_type_string(Some("eth0"), None), "[unknown-dev-type]");
    }

    #[test]
    fn point_to_point_rules() {
        for t in [Topology::Net30, Topology::P2P, Topology::Subnet] {
            assert!(!is_point_to_point(DeviceKind::Tap, t).unwrap());
        }
        assert!(!is_point_to_point(DeviceKind::Tun, Topology::Subnet).unwrap());
        assert!(is_point_to_point(DeviceKind::Tun, Topology::Net30).unwrap());
        assert!(is_point_to_point(DeviceKind::Tun, Topology::P2P).unwrap());
        assert!(is_point_to_point(DeviceKind::Null, Topology::Net30).is_err());
        assert!(is_point_to_point(DeviceKind::Undefined, Topology::Subnet).is_err());
    }

    #[test]
    fn broadcast() {
        assert_eq!(
            broadcast_of(ip("10.0.0.1"), ip("255.255.255.0")),
            ip("10.0.0.255")
        );
        assert_eq!(
            broadcast_of(ip("192.168.50.1"), ip("255.255.254.0")),
            ip("192.168.51.255")
        );
    }

    #[test]
    fn sanity_heuristics() {
        assert_eq!(
            sanity_check(DeviceKind::Tun, ip("255.255.255.0"), Topology::Net30),
            Some(Advisory::PeerLooksLikeNetmask(ip("255.255.255.0")))
        );
        assert_eq!(
            sanity_check(DeviceKind::Tun, ip("255.255.255.0"), Topology::Subnet),
            None
        );
        assert_eq!(
            sanity_check(DeviceKind::Tun, ip("10.8.0.1"), Topology::P2P),
            None
        );
        assert_eq!(
            sanity_check(DeviceKind::Tap, ip("10.8.0.1"), Topology::Net30),
            Some(Advisory::NetmaskExpected(ip("10.8.0.1")))
        );
        assert_eq!(
            sanity_check(DeviceKind::Tap, ip("255.255.0.0"), Topology::Net30),
            None
        );
    }

    #[test]
    fn addr_clash_tun() {
        let found = check_addr_clash(
            "remote",
            DeviceKind::Tun,
            ip("10.8.0.1"),
            ip("10.8.0.2"),
            ip("10.8.0.1"),
        );
        assert_eq!(found.len(), 2);
        assert!(matches!(found[0], Advisory::EndpointConflict { .. }));
        assert!(found[1].is_minor());

        let found = check_addr_clash(
            "local",
            DeviceKind::Tun,
            ip("10.8.0.77"),
            ip("10.8.0.2"),
            ip("10.8.0.1"),
        );
        assert_eq!(found.len(), 1);
        assert!(found[0].is_minor());

        assert!(check_addr_clash(
            "local",
            DeviceKind::Tun,
            Ipv4Addr::UNSPECIFIED,
            ip("10.8.0.2"),
            ip("10.8.0.1"),
        )
        .is_empty());
    }

    #[test]
    fn addr_clash_tap() {
        let found = check_addr_clash(
            "remote",
            DeviceKind::Tap,
            ip("192.168.50.20"),
            ip("192.168.50.1"),
            ip("255.255.255.0"),
        );
        assert!(matches!(found[..], [Advisory::EndpointInsideSubnet { .. }]));
        assert!(check_addr_clash(
            "remote",
            DeviceKind::Tap,
            ip("192.168.51.20"),
            ip("192.168.50.1"),
            ip("255.255.255.0"),
        )
        .is_empty());
    }

    #[test]
    fn lan_conflict_either_direction() {
        let lan = LanGateway {
            gateway: ip("192.168.1.1"),
            netmask: ip("255.255.255.0"),
        };
        assert!(subnet_conflict(ip("192.168.1.7"), ip("255.255.255.0"), "x", &lan).is_some());
        // VPN subnet contains the LAN.
        assert!(subnet_conflict(ip("192.168.5.1"), ip("255.255.0.0"), "x", &lan).is_some());
        // Point-to-point host inside the LAN.
        assert!(subnet_conflict(ip("192.168.1.9"), ip("255.255.255.255"), "x", &lan).is_some());
        assert!(subnet_conflict(ip("10.8.0.1"), ip("255.255.255.0"), "x", &lan).is_none());
    }

    #[test]
    fn common_subnets() {
        let lan = |gw: &str| LanGateway {
            gateway: ip(gw),
            netmask: ip("255.255.255.0"),
        };
        assert!(common_subnet_advisory(&lan("192.168.0.1")).is_some());
        assert!(common_subnet_advisory(&lan("192.168.1.254")).is_some());
        assert!(common_subnet_advisory(&lan("192.168.2.1")).is_none());
    }

    #[test]
    fn tight_point_to_point() {
        assert!(verify_tight_point_to_point(ip("10.7.0.5"), ip("10.7.0.6")).is_ok());
        let e = verify_tight_point_to_point(ip("10.7.0.5"), ip("10.7.0.5")).unwrap_err();
        assert!(e.to_string().contains("must be different"));
        let e = verify_tight_point_to_point(ip("10.7.0.4"), ip("10.7.0.9")).unwrap_err();
        assert!(e.to_string().contains("same 255.255.255.252"));
        let e = verify_tight_point_to_point(ip("10.7.0.4"), ip("10.7.0.7")).unwrap_err();
        assert!(e.to_string().contains("0 or 3"));
    }

    #[test]
    fn valid_pairs_cover_a_slash_24() {
        let pairs = valid_point_to_point_pairs();
        assert_eq!(pairs.len(), 64);
        assert_eq!(pairs[0], [1, 2]);
        assert_eq!(pairs[63], [253, 254]);
        for [l, r] in pairs {
            let base = Ipv4Addr::new(10, 3, 0, 0);
            let o = base.octets();
            assert!(verify_tight_point_to_point(
                Ipv4Addr::new(o[0], o[1], o[2], l),
                Ipv4Addr::new(o[0], o[1], o[2], r)
            )
            .is_ok());
        }
    }

    #[test]
    fn options_string() {
        assert_eq!(
            ifconfig_options_string(
                DeviceKind::Tap,
                Topology::Net30,
                ip("192.168.50.1"),
                ip("255.255.255.0"),
                false
            ),
            "192.168.50.0 255.255.255.0"
        );
        assert_eq!(
            ifconfig_options_string(
                DeviceKind::Tun,
                Topology::Net30,
                ip("10.8.0.2"),
                ip("10.8.0.1"),
                false
            ),
            "10.8.0.1 10.8.0.2"
        );
        assert_eq!(
            ifconfig_options_string(
                DeviceKind::Tun,
                Topology::Net30,
                ip("10.8.0.2"),
                ip("10.8.0.1"),
                true
            ),
            "10.8.0.2 10.8.0.1"
        );
    }

    #[test]
    fn topology_names() {
        assert_eq!("subnet".parse::<Topology>().unwrap(), Topology::Subnet);
        assert_eq!(Topology::P2P.to_string(), "p2p");
        assert!("mesh".parse::<Topology>().is_err());
    }
}
