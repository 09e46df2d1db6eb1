//! OS specific address assignment command plans.
//!
//! Plans are built from plain values so each flavor can be checked on any
//! host; the Unix backends pick their flavor and run the plan through the
//! [`CommandDriver`].

use crate::cmdline;
use crate::command::{CommandDriver, CommandLine, Severity};
use crate::error::Result;
use crate::validate::Topology;
use std::net::{IpAddr, Ipv4Addr};

const IFCONFIG: &str = "ifconfig";
const IPROUTE: &str = "ip";
const ROUTE: &str = "route";

/// Values needed to assign an address to an opened device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IfconfigRequest {
    pub name: String,
    /// Second parameter is a peer address, not a netmask.
    pub point_to_point: bool,
    pub topology: Topology,
    pub local: Ipv4Addr,
    pub remote_netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub mtu: u32,
}

impl IfconfigRequest {
    pub fn prefix_len(&self) -> u8 {
        netmask_bits(self.remote_netmask)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.local) & u32::from(self.remote_netmask))
    }

    fn subnet_route_wanted(&self) -> bool {
        !self.point_to_point && self.topology == Topology::Subnet
    }
}

/// Number of one bits in a netmask.
pub fn netmask_bits(mask: Ipv4Addr) -> u8 {
    ipnet::ip_mask_to_prefix(IpAddr::V4(mask)).unwrap_or(u32::from(mask).count_ones() as u8)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedCommand {
    pub line: CommandLine,
    pub severity: Severity,
}

impl PlannedCommand {
    fn fatal(line: CommandLine) -> Self {
        Self {
            line,
            severity: Severity::Fatal,
        }
    }
    fn warn(line: CommandLine) -> Self {
        Self {
            line,
            severity: Severity::Warn,
        }
    }
    fn tolerate(line: CommandLine) -> Self {
        Self {
            line,
            severity: Severity::Tolerate,
        }
    }
}

/// Commands to run in order, plus cleanup run when a fatal step fails.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IfconfigPlan {
    pub steps: Vec<PlannedCommand>,
    pub on_failure: Vec<PlannedCommand>,
}

impl IfconfigPlan {
    pub fn lines(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.line.to_string()).collect()
    }

    /// Execute every step; on the first fatal failure run the cleanup steps
    /// and return the error.
    pub fn run(&self, driver: &CommandDriver) -> Result<()> {
        for step in &self.steps {
            if let Err(e) = driver.execute(&step.line, step.severity) {
                for cleanup in &self.on_failure {
                    let _ = driver.execute(&cleanup.line, cleanup.severity);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Dialect of the address assignment commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IfconfigFlavor {
    LinuxIproute,
    LinuxIfconfig,
    Solaris,
    OpenBsd,
    NetBsd,
    MacOs,
    /// FreeBSD and DragonFly.
    FreeBsd,
}

impl IfconfigFlavor {
    /// Flavor for the running OS; `None` where addresses are not assigned
    /// through external commands.
    pub fn native(use_iproute: bool) -> Option<Self> {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            Some(if use_iproute {
                IfconfigFlavor::LinuxIproute
            } else {
                IfconfigFlavor::LinuxIfconfig
            })
        } else if cfg!(any(target_os = "solaris", target_os = "illumos")) {
            Some(IfconfigFlavor::Solaris)
        } else if cfg!(target_os = "openbsd") {
            Some(IfconfigFlavor::OpenBsd)
        } else if cfg!(target_os = "netbsd") {
            Some(IfconfigFlavor::NetBsd)
        } else if cfg!(target_os = "macos") {
            Some(IfconfigFlavor::MacOs)
        } else if cfg!(any(target_os = "freebsd", target_os = "dragonfly")) {
            Some(IfconfigFlavor::FreeBsd)
        } else {
            None
        }
    }

    /// Commands bringing the device up with its address.
    pub fn up(&self, req: &IfconfigRequest) -> IfconfigPlan {
        let n = req.name.as_str();
        let l = req.local;
        let r = req.remote_netmask;
        let b = req.broadcast;
        let mtu = req.mtu;
        let mut plan = IfconfigPlan::default();
        match self {
            IfconfigFlavor::LinuxIproute => {
                plan.steps.push(PlannedCommand::fatal(cmdline!(
                    IPROUTE, "link", "set", "dev", n, "up", "mtu", mtu
                )));
                let addr = if req.point_to_point {
                    cmdline!(IPROUTE, "addr", "add", "dev", n, "local", l, "peer", r)
                } else {
                    cmdline!(
                        IPROUTE,
                        "addr",
                        "add",
                        "dev",
                        n,
                        format!("{l}/{}", req.prefix_len()),
                        "broadcast",
                        b
                    )
                };
                plan.steps.push(PlannedCommand::fatal(addr));
            }
            IfconfigFlavor::LinuxIfconfig => {
                let line = if req.point_to_point {
                    cmdline!(IFCONFIG, n, l, "pointopoint", r, "mtu", mtu)
                } else {
                    cmdline!(IFCONFIG, n, l, "netmask", r, "mtu", mtu, "broadcast", b)
                };
                plan.steps.push(PlannedCommand::fatal(line));
            }
            IfconfigFlavor::Solaris => {
                if req.point_to_point {
                    plan.steps.push(PlannedCommand::fatal(cmdline!(
                        IFCONFIG, n, l, r, "mtu", mtu, "up"
                    )));
                    plan.steps.push(PlannedCommand::fatal(cmdline!(
                        IFCONFIG,
                        n,
                        "netmask",
                        "255.255.255.255"
                    )));
                } else if req.topology == Topology::Subnet {
                    plan.steps.push(PlannedCommand::fatal(cmdline!(
                        IFCONFIG, n, l, l, "netmask", r, "mtu", mtu, "up"
                    )));
                } else {
                    plan.steps.push(PlannedCommand::fatal(cmdline!(
                        IFCONFIG, n, l, "netmask", r, "broadcast", "+", "up"
                    )));
                }
                plan.on_failure
                    .push(PlannedCommand::warn(cmdline!(IFCONFIG, n, "unplumb")));
            }
            IfconfigFlavor::OpenBsd => {
                plan.steps
                    .push(PlannedCommand::tolerate(cmdline!(IFCONFIG, n, "destroy")));
                plan.steps
                    .push(PlannedCommand::tolerate(cmdline!(IFCONFIG, n, "create")));
                plan.steps.push(PlannedCommand::fatal(if req.point_to_point {
                    cmdline!(
                        IFCONFIG,
                        n,
                        l,
                        r,
                        "mtu",
                        mtu,
                        "netmask",
                        "255.255.255.255",
                        "up"
                    )
                } else {
                    cmdline!(IFCONFIG, n, l, "netmask", r, "mtu", mtu, "broadcast", b, "link0")
                }));
            }
            IfconfigFlavor::NetBsd => {
                plan.steps.push(PlannedCommand::fatal(if req.point_to_point {
                    cmdline!(
                        IFCONFIG,
                        n,
                        l,
                        r,
                        "mtu",
                        mtu,
                        "netmask",
                        "255.255.255.255",
                        "up"
                    )
                } else {
                    cmdline!(IFCONFIG, n, l, "netmask", r, "mtu", mtu, "broadcast", b)
                }));
            }
            IfconfigFlavor::MacOs => {
                plan.steps
                    .push(PlannedCommand::tolerate(cmdline!(IFCONFIG, n, "delete")));
                plan.steps.push(PlannedCommand::fatal(if req.point_to_point {
                    cmdline!(
                        IFCONFIG,
                        n,
                        l,
                        r,
                        "mtu",
                        mtu,
                        "netmask",
                        "255.255.255.255",
                        "up"
                    )
                } else if req.topology == Topology::Subnet {
                    cmdline!(IFCONFIG, n, l, l, "netmask", r, "mtu", mtu, "up")
                } else {
                    cmdline!(IFCONFIG, n, l, "netmask", r, "mtu", mtu, "up")
                }));
            }
            IfconfigFlavor::FreeBsd => {
                plan.steps.push(PlannedCommand::fatal(if req.point_to_point {
                    cmdline!(
                        IFCONFIG,
                        n,
                        l,
                        r,
                        "mtu",
                        mtu,
                        "netmask",
                        "255.255.255.255",
                        "up"
                    )
                } else {
                    cmdline!(IFCONFIG, n, l, "netmask", r, "mtu", mtu, "up")
                }));
            }
        }
        if req.subnet_route_wanted() {
            if let Some(route) = self.subnet_route(req) {
                plan.steps.push(PlannedCommand::warn(route));
            }
        }
        plan
    }

    /// Network route `local & netmask` via `local` for subnet style devices.
    pub fn subnet_route(&self, req: &IfconfigRequest) -> Option<CommandLine> {
        let net = req.network();
        let mask = req.remote_netmask;
        let gw = req.local;
        match self {
            IfconfigFlavor::Solaris => Some(cmdline!(ROUTE, "add", net, "-netmask", mask, gw, 0)),
            IfconfigFlavor::MacOs | IfconfigFlavor::FreeBsd => {
                Some(cmdline!(ROUTE, "add", "-net", net, gw, mask))
            }
            _ => None,
        }
    }

    /// Commands removing the address again on close.
    pub fn down(&self, req: &IfconfigRequest) -> Vec<PlannedCommand> {
        let n = req.name.as_str();
        match self {
            IfconfigFlavor::LinuxIproute => {
                let line = if req.point_to_point {
                    cmdline!(
                        IPROUTE,
                        "addr",
                        "del",
                        "dev",
                        n,
                        "local",
                        req.local,
                        "peer",
                        req.remote_netmask
                    )
                } else {
                    cmdline!(
                        IPROUTE,
                        "addr",
                        "del",
                        "dev",
                        n,
                        format!("{}/{}", req.local, req.prefix_len())
                    )
                };
                vec![PlannedCommand::warn(line)]
            }
            IfconfigFlavor::LinuxIfconfig => {
                vec![PlannedCommand::warn(cmdline!(IFCONFIG, n, "0.0.0.0"))]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn p2p() -> IfconfigRequest {
        IfconfigRequest {
            name: "tun0".into(),
            point_to_point: true,
            topology: Topology::Net30,
            local: Ipv4Addr::new(10, 8, 0, 2),
            remote_netmask: Ipv4Addr::new(10, 8, 0, 1),
            broadcast: Ipv4Addr::UNSPECIFIED,
            mtu: 1500,
        }
    }

    fn subnet(name: &str) -> IfconfigRequest {
        IfconfigRequest {
            name: name.into(),
            point_to_point: false,
            topology: Topology::Subnet,
            local: Ipv4Addr::new(192, 168, 50, 1),
            remote_netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Ipv4Addr::new(192, 168, 50, 255),
            mtu: 1500,
        }
    }

    #[test]
    fn linux_iproute() {
        let plan = IfconfigFlavor::LinuxIproute.up(&p2p());
        assert_eq!(
            plan.lines(),
            [
                "ip link set dev tun0 up mtu 1500",
                "ip addr add dev tun0 local 10.8.0.2 peer 10.8.0.1"
            ]
        );
        let plan = IfconfigFlavor::LinuxIproute.up(&subnet("tap0"));
        assert_eq!(
            plan.lines()[1],
            "ip addr add dev tap0 192.168.50.1/24 broadcast 192.168.50.255"
        );
        let down = IfconfigFlavor::LinuxIproute.down(&subnet("tap0"));
        assert_eq!(down[0].line.to_string(), "ip addr del dev tap0 192.168.50.1/24");
        let down = IfconfigFlavor::LinuxIproute.down(&p2p());
        assert_eq!(
            down[0].line.to_string(),
            "ip addr del dev tun0 local 10.8.0.2 peer 10.8.0.1"
        );
    }

    #[test]
    fn linux_legacy_ifconfig() {
        assert_eq!(
            IfconfigFlavor::LinuxIfconfig.up(&p2p()).lines(),
            ["ifconfig tun0 10.8.0.2 pointopoint 10.8.0.1 mtu 1500"]
        );
        assert_eq!(
            IfconfigFlavor::LinuxIfconfig.up(&subnet("tap0")).lines(),
            ["ifconfig tap0 192.168.50.1 netmask 255.255.255.0 mtu 1500 broadcast 192.168.50.255"]
        );
        assert_eq!(
            IfconfigFlavor::LinuxIfconfig.down(&p2p())[0].line.to_string(),
            "ifconfig tun0 0.0.0.0"
        );
    }

    #[test]
    fn solaris_two_phase_and_route() {
        let plan = IfconfigFlavor::Solaris.up(&p2p());
        assert_eq!(
            plan.lines(),
            [
                "ifconfig tun0 10.8.0.2 10.8.0.1 mtu 1500 up",
                "ifconfig tun0 netmask 255.255.255.255"
            ]
        );
        assert_eq!(plan.on_failure[0].line.to_string(), "ifconfig tun0 unplumb");

        let plan = IfconfigFlavor::Solaris.up(&subnet("tap0"));
        assert_eq!(
            plan.lines(),
            [
                "ifconfig tap0 192.168.50.1 192.168.50.1 netmask 255.255.255.0 mtu 1500 up",
                "route add 192.168.50.0 -netmask 255.255.255.0 192.168.50.1 0"
            ]
        );
        let mut tap = subnet("tap0");
        tap.topology = Topology::Net30;
        assert_eq!(
            IfconfigFlavor::Solaris.up(&tap).lines(),
            ["ifconfig tap0 192.168.50.1 netmask 255.255.255.0 broadcast + up"]
        );
    }

    #[test]
    fn openbsd_recreates_interface() {
        let plan = IfconfigFlavor::OpenBsd.up(&p2p());
        assert_eq!(
            plan.lines(),
            [
                "ifconfig tun0 destroy",
                "ifconfig tun0 create",
                "ifconfig tun0 10.8.0.2 10.8.0.1 mtu 1500 netmask 255.255.255.255 up"
            ]
        );
        assert_eq!(plan.steps[0].severity, Severity::Tolerate);
        let plan = IfconfigFlavor::OpenBsd.up(&subnet("tap0"));
        assert_eq!(
            plan.lines()[2],
            "ifconfig tap0 192.168.50.1 netmask 255.255.255.0 mtu 1500 broadcast 192.168.50.255 link0"
        );
    }

    #[test]
    fn netbsd_has_no_link0() {
        assert_eq!(
            IfconfigFlavor::NetBsd.up(&subnet("tap0")).lines(),
            ["ifconfig tap0 192.168.50.1 netmask 255.255.255.0 mtu 1500 broadcast 192.168.50.255"]
        );
    }

    #[test]
    fn macos_and_freebsd_subnet_routes() {
        let plan = IfconfigFlavor::MacOs.up(&subnet("tap0"));
        assert_eq!(
            plan.lines(),
            [
                "ifconfig tap0 delete",
                "ifconfig tap0 192.168.50.1 192.168.50.1 netmask 255.255.255.0 mtu 1500 up",
                "route add -net 192.168.50.0 192.168.50.1 255.255.255.0"
            ]
        );
        let plan = IfconfigFlavor::FreeBsd.up(&subnet("tap0"));
        assert_eq!(
            plan.lines(),
            [
                "ifconfig tap0 192.168.50.1 netmask 255.255.255.0 mtu 1500 up",
                "route add -net 192.168.50.0 192.168.50.1 255.255.255.0"
            ]
        );
        // No route for point-to-point devices.
        assert_eq!(IfconfigFlavor::FreeBsd.up(&p2p()).lines().len(), 1);
    }

    #[test]
    fn prefix_bits() {
        assert_eq!(netmask_bits(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(netmask_bits(Ipv4Addr::new(255, 255, 255, 252)), 30);
        assert_eq!(netmask_bits(Ipv4Addr::UNSPECIFIED), 0);
    }

    #[test]
    fn failing_step_runs_cleanup() {
        use crate::command::test::Recorder;
        use crate::command::CommandLock;
        use std::sync::Arc;

        let recorder = Arc::new(Recorder {
            fail_containing: vec!["netmask 255.255.255.255".into()],
            ..Default::default()
        });
        let driver = CommandDriver::new(recorder.clone(), CommandLock::default());
        let plan = IfconfigFlavor::Solaris.up(&p2p());
        assert!(plan.run(&driver).is_err());
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.last().unwrap(), "ifconfig tun0 unplumb");
        assert_eq!(seen.len(), 3);
    }
}
