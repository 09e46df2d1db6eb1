use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tuntap_ctl::command::{CommandDriver, CommandLine, CommandLock, CommandRunner};
use tuntap_ctl::ifconfig::IfconfigFlavor;
use tuntap_ctl::route::LanGateway;
use tuntap_ctl::{
    Advisory, Backend, DeviceBuilder, DeviceContext, DeviceState, Error, Topology, TunTapDevice,
};

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    fail_containing: Vec<String>,
}

impl Recorder {
    fn lines(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl CommandRunner for Recorder {
    fn run(&self, command: &CommandLine) -> io::Result<Vec<u8>> {
        let line = command.to_string();
        self.seen.lock().unwrap().push(line.clone());
        if self.fail_containing.iter().any(|s| line.contains(s)) {
            return Err(io::Error::other("exit status 1"));
        }
        Ok(Vec::new())
    }
}

/// Loopback device assigning addresses with the iproute commands.
#[derive(Default)]
struct Loopback {
    queue: VecDeque<Vec<u8>>,
    open: bool,
    ipv6: bool,
    lan: Option<LanGateway>,
}

impl Backend for Loopback {
    fn ipv6_supported(&self) -> bool {
        self.ipv6
    }

    fn open(&mut self, _ctx: &DeviceContext<'_>, name: &str, node: Option<&str>) -> tuntap_ctl::Result<String> {
        if node == Some("/dev/missing") {
            return Err(Error::DeviceUnavailable(name.to_string()));
        }
        self.open = true;
        Ok(if name == "tun" || name == "tap" {
            format!("{name}0")
        } else {
            name.to_string()
        })
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn configure_address(&mut self, ctx: &DeviceContext<'_>, actual_name: &str) -> tuntap_ctl::Result<()> {
        let Some(req) = ctx.ifconfig_request(actual_name) else {
            return Ok(());
        };
        IfconfigFlavor::LinuxIproute.up(&req).run(ctx.commands)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .queue
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queue.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn close(&mut self, ctx: &DeviceContext<'_>, actual_name: &str, configured: bool) {
        if configured {
            if let Some(req) = ctx.ifconfig_request(actual_name) {
                for step in IfconfigFlavor::LinuxIproute.down(&req) {
                    let _ = ctx.commands.execute(&step.line, step.severity);
                }
            }
        }
        self.open = false;
        self.queue.clear();
    }

    fn default_gateway(&self) -> Option<LanGateway> {
        self.lan
    }
}

fn driver(recorder: &Arc<Recorder>) -> CommandDriver {
    CommandDriver::new(recorder.clone(), CommandLock::new("test"))
}

#[test]
fn tun_net30_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();
    let recorder = Arc::new(Recorder::default());
    let mut dev = DeviceBuilder::new()
        .name("tun")
        .topology(Topology::Net30)
        .ifconfig("10.8.0.2", "10.8.0.1")
        .strict_warnings(false)
        .commands(driver(&recorder))
        .build_with(Loopback::default())
        .unwrap();

    assert_eq!(dev.env().get("ifconfig_local"), Some("10.8.0.2"));
    assert_eq!(dev.env().get("ifconfig_remote"), Some("10.8.0.1"));
    assert!(!dev.env().contains("ifconfig_broadcast"));
    assert!(!dev.env().contains("ifconfig_netmask"));
    assert_eq!(dev.addresses().unwrap().broadcast, None);

    dev.open().unwrap();
    assert_eq!(dev.actual_name(), Some("tun0"));
    dev.configure().unwrap();
    assert_eq!(dev.state(), DeviceState::ConfiguredAtOs);
    assert_eq!(
        recorder.lines(),
        vec![
            "ip link set dev tun0 up mtu 1500",
            "ip addr add dev tun0 local 10.8.0.2 peer 10.8.0.1",
        ]
    );

    let packet = [0x45, 0, 0, 20];
    assert_eq!(dev.write(&packet).unwrap(), 4);
    let mut buf = [0u8; 64];
    assert_eq!(dev.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], &packet);
    assert_eq!(
        dev.read(&mut buf).unwrap_err().kind(),
        io::ErrorKind::WouldBlock
    );

    assert_eq!(dev.ifconfig_options_string(false, false), "10.8.0.1 10.8.0.2");
    assert_eq!(dev.ifconfig_options_string(true, false), "10.8.0.2 10.8.0.1");

    dev.close();
    assert_eq!(
        recorder.lines().last().map(String::as_str),
        Some("ip addr del dev tun0 local 10.8.0.2 peer 10.8.0.1")
    );
    assert_eq!(dev.state(), DeviceState::Closed);
    assert!(dev.actual_name().is_none());
    assert!(!dev.ifconfig_parameters_computed());
}

#[test]
fn tap_end_to_end() {
    let recorder = Arc::new(Recorder::default());
    let mut dev = DeviceBuilder::new()
        .name("tap")
        .ifconfig("192.168.50.1", "255.255.255.0")
        .mtu(1400)
        .strict_warnings(false)
        .commands(driver(&recorder))
        .build_with(Loopback::default())
        .unwrap();

    assert_eq!(dev.env().get("ifconfig_local"), Some("192.168.50.1"));
    assert_eq!(dev.env().get("ifconfig_netmask"), Some("255.255.255.0"));
    assert_eq!(dev.env().get("ifconfig_broadcast"), Some("192.168.50.255"));
    assert!(!dev.env().contains("ifconfig_remote"));

    dev.open().unwrap();
    dev.configure().unwrap();
    assert_eq!(
        recorder.lines(),
        vec![
            "ip link set dev tap0 up mtu 1400",
            "ip addr add dev tap0 192.168.50.1/24 broadcast 192.168.50.255",
        ]
    );
    assert_eq!(
        dev.ifconfig_options_string(false, false),
        "192.168.50.0 255.255.255.0"
    );
}

#[test]
fn close_never_opened_device() {
    let recorder = Arc::new(Recorder::default());
    let mut dev = DeviceBuilder::new()
        .name("tun")
        .ifconfig("10.8.0.2", "10.8.0.1")
        .strict_warnings(false)
        .commands(driver(&recorder))
        .build_with(Loopback::default())
        .unwrap();
    dev.close();
    dev.close();
    assert_eq!(dev.state(), DeviceState::Closed);
    assert!(dev.actual_name().is_none());
    assert!(dev.addresses().is_none());
    assert!(recorder.lines().is_empty());
    assert!(dev.open().is_err());
}

#[test]
fn failing_configuration_keeps_device_open() {
    let recorder = Arc::new(Recorder {
        fail_containing: vec!["addr add".to_string()],
        ..Default::default()
    });
    let mut dev = DeviceBuilder::new()
        .name("tun5")
        .ifconfig("10.8.0.2", "10.8.0.1")
        .strict_warnings(false)
        .commands(driver(&recorder))
        .build_with(Loopback::default())
        .unwrap();
    dev.open().unwrap();
    assert_eq!(dev.actual_name(), Some("tun5"));
    assert!(matches!(dev.configure(), Err(Error::Command { .. })));
    assert_eq!(dev.state(), DeviceState::Opened);
    assert!(!dev.ifconfig_applied_to_os());
}

#[test]
fn unavailable_device_may_be_retried() {
    let mut dev = DeviceBuilder::new()
        .name("tun")
        .dev_node("/dev/missing")
        .build_with(Loopback::default())
        .unwrap();
    let err = dev.open().unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(dev.state(), DeviceState::Validated);
}

#[test]
fn without_ifconfig_nothing_is_configured() {
    let recorder = Arc::new(Recorder::default());
    let mut dev = DeviceBuilder::new()
        .name("tap")
        .commands(driver(&recorder))
        .build_with(Loopback::default())
        .unwrap();
    assert!(dev.env().is_empty());
    dev.open().unwrap();
    dev.configure().unwrap();
    assert_eq!(dev.state(), DeviceState::Opened);
    assert!(recorder.lines().is_empty());
    assert_eq!(dev.ifconfig_options_string(false, false), "");
}

#[test]
fn strict_warnings_are_collected() {
    let dev = DeviceBuilder::new()
        .name("tap")
        .ifconfig("10.3.0.1", "10.3.0.2")
        .local_public(Ipv4Addr::new(10, 3, 0, 77))
        .build_with(Loopback::default())
        .unwrap();
    let advisories = dev.advisories();
    assert!(advisories.contains(&Advisory::NetmaskExpected(Ipv4Addr::new(10, 3, 0, 2))));
}

#[test]
fn subnet_topology_tun_uses_netmask() {
    let dev: TunTapDevice<Loopback> = DeviceBuilder::new()
        .name("tun")
        .topology(Topology::Subnet)
        .ifconfig("10.8.0.1", "255.255.255.0")
        .strict_warnings(false)
        .build_with(Loopback::default())
        .unwrap();
    assert!(!dev.addresses().unwrap().point_to_point);
    assert_eq!(dev.env().get("ifconfig_broadcast"), Some("10.8.0.255"));
}

#[test]
fn ipv6_request_downgraded() {
    let mut dev = DeviceBuilder::new()
        .name("tun")
        .ipv6(true)
        .build_with(Loopback::default())
        .unwrap();
    dev.open().unwrap();
    assert!(!dev.ipv6());
    assert!(dev.advisories().contains(&Advisory::Ipv6Unsupported));

    let mut dev = DeviceBuilder::new()
        .name("tun")
        .ipv6(true)
        .build_with(Loopback {
            ipv6: true,
            ..Default::default()
        })
        .unwrap();
    dev.open().unwrap();
    assert!(dev.ipv6());
}

#[test]
fn hostname_only_allowed_for_peers() {
    let err = DeviceBuilder::new()
        .name("tap")
        .ifconfig("192.168.50.1", "localhost")
        .build_with(Loopback::default())
        .unwrap_err();
    assert!(matches!(err, Error::Resolve { .. }));
}

#[test]
fn vpn_subnet_overlapping_the_lan_is_reported() {
    let lan = LanGateway {
        gateway: Ipv4Addr::new(10, 8, 0, 254),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
    };
    let dev = DeviceBuilder::new()
        .name("tap")
        .ifconfig("10.8.0.1", "255.255.255.0")
        .build_with(Loopback {
            lan: Some(lan),
            ..Default::default()
        })
        .unwrap();
    assert!(dev.advisories().contains(&Advisory::LanSubnetConflict {
        label: "TUN/TAP adapter".to_string(),
        lan_network: Ipv4Addr::new(10, 8, 0, 0),
        lan_netmask: Ipv4Addr::new(255, 255, 255, 0),
        network: Ipv4Addr::new(10, 8, 0, 0),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
    }));

    let dev = DeviceBuilder::new()
        .name("tap")
        .ifconfig("10.9.0.1", "255.255.255.0")
        .build_with(Loopback {
            lan: Some(lan),
            ..Default::default()
        })
        .unwrap();
    assert!(!dev
        .advisories()
        .iter()
        .any(|a| matches!(a, Advisory::LanSubnetConflict { .. })));

    let dev = DeviceBuilder::new()
        .name("tap")
        .ifconfig("10.8.0.1", "255.255.255.0")
        .strict_warnings(false)
        .build_with(Loopback {
            lan: Some(lan),
            ..Default::default()
        })
        .unwrap();
    assert!(dev.advisories().is_empty());
}
