//! The device lifecycle shared by every platform.
//!
//! A [`TunTapDevice`] is validated when it is created, then opened,
//! configured at the OS, driven by the caller and finally closed:
//!
//! ```text
//! Uninitialized -> Validated -> Opened -> ConfiguredAtOs -> Closed
//! ```
//!
//! All OS specific work is delegated to a [`Backend`].

use crate::command::CommandDriver;
use crate::env::EnvSet;
use crate::error::{Error, Result};
use crate::options::TunTapOptions;
use crate::platform::{Addressing, Backend, DeviceContext};
use crate::validate::{self, Advisory, DeviceKind, Topology};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

/// Name reported for `null` devices, which never reach the OS.
pub const NULL_DEVICE_NAME: &str = "null";

/// Where a device is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    Uninitialized,
    /// Parameters checked, no OS resources held.
    Validated,
    /// The OS handle is held.
    Opened,
    /// Addresses were assigned at the OS.
    ConfiguredAtOs,
    Closed,
}

impl DeviceState {
    pub fn is_open(&self) -> bool {
        matches!(self, DeviceState::Opened | DeviceState::ConfiguredAtOs)
    }
}

/// Everything a device is created from. Usually filled by
/// [`crate::DeviceBuilder`].
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Requested device name, e.g. `tun`, `tun3` or `tap`.
    pub name: String,
    /// Explicit `tun`/`tap`/`null`, overriding the name prefix.
    pub dev_type: Option<String>,
    /// Device node, or adapter GUID/connection name on Windows.
    pub dev_node: Option<String>,
    pub topology: Topology,
    /// Local address and remote address or netmask, both unresolved.
    pub ifconfig: Option<(String, String)>,
    pub local_public: Ipv4Addr,
    pub remote_public: Ipv4Addr,
    pub strict_warnings: bool,
    pub ipv6: bool,
    pub mtu: u32,
    pub options: TunTapOptions,
    pub commands: CommandDriver,
}

/// A tun, tap or null device driven through backend `B`.
pub struct TunTapDevice<B: Backend> {
    config: DeviceConfig,
    kind: DeviceKind,
    state: DeviceState,
    /// Effective IPv6 framing, cleared when the backend lacks support.
    ipv6: bool,
    addresses: Option<Addressing>,
    actual_name: Option<String>,
    env: EnvSet,
    advisories: Vec<Advisory>,
    standby_iter: u32,
    backend: B,
}

impl<B: Backend> std::fmt::Debug for TunTapDevice<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunTapDevice")
            .field("name", &self.config.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("actual_name", &self.actual_name)
            .field("addresses", &self.addresses)
            .finish()
    }
}

fn context<'a>(
    kind: DeviceKind,
    ipv6: bool,
    config: &'a DeviceConfig,
    addresses: Option<&'a Addressing>,
) -> DeviceContext<'a> {
    DeviceContext {
        kind,
        topology: config.topology,
        ipv6,
        mtu: config.mtu,
        options: &config.options,
        commands: &config.commands,
        addresses,
    }
}

/// Turn an ifconfig parameter into an address. Only point-to-point peers
/// and local addresses may be host names.
fn resolve_host(host: &str, allow_lookup: bool) -> Result<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    let fail = |reason: String| {
        let e = Error::Resolve {
            host: host.to_string(),
            reason,
        };
        log::error!("{e}");
        e
    };
    if !allow_lookup {
        return Err(fail("not a dotted-decimal address".to_string()));
    }
    let addrs = (host, 0)
        .to_socket_addrs()
        .map_err(|e| fail(e.to_string()))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(fail("no IPv4 address".to_string()))
}

impl<B: Backend> TunTapDevice<B> {
    /// Create a device and validate its parameters.
    ///
    /// Resolution failures and impossible topologies are fatal; address
    /// heuristics are logged and kept in [`TunTapDevice::advisories`].
    pub fn new(config: DeviceConfig, backend: B) -> Result<Self> {
        let kind = validate::classify(Some(&config.name), config.dev_type.as_deref());
        let mut device = Self {
            ipv6: config.ipv6,
            config,
            kind,
            state: DeviceState::Uninitialized,
            addresses: None,
            actual_name: None,
            env: EnvSet::new(),
            advisories: Vec::new(),
            standby_iter: 0,
            backend,
        };
        device.validate()?;
        Ok(device)
    }

    fn advise(&mut self, advisory: Option<Advisory>) {
        if let Some(advisory) = advisory {
            advisory.log();
            self.advisories.push(advisory);
        }
    }

    fn validate(&mut self) -> Result<()> {
        let Some((local_parm, remote_parm)) = self.config.ifconfig.clone() else {
            self.state = DeviceState::Validated;
            return Ok(());
        };
        let kind = self.kind;
        let topology = self.config.topology;
        let point_to_point = validate::is_point_to_point(kind, topology).map_err(|e| {
            log::error!("{e}");
            e
        })?;

        let local = resolve_host(&local_parm, true)?;
        let remote_netmask = resolve_host(&remote_parm, point_to_point)?;

        if self.config.strict_warnings {
            self.advise(validate::sanity_check(kind, remote_netmask, topology));
            for (role, public) in [
                ("local", self.config.local_public),
                ("remote", self.config.remote_public),
            ] {
                for advisory in
                    validate::check_addr_clash(role, kind, public, local, remote_netmask)
                {
                    self.advise(Some(advisory));
                }
            }
            let netmask = if point_to_point {
                Ipv4Addr::BROADCAST
            } else {
                remote_netmask
            };
            if let Some(lan) = self.backend.default_gateway() {
                self.advise(validate::subnet_conflict(
                    local,
                    netmask,
                    "TUN/TAP adapter",
                    &lan,
                ));
            }
        }

        let broadcast =
            (!point_to_point).then(|| validate::broadcast_of(local, remote_netmask));

        self.env.set_addr("ifconfig_local", local);
        match broadcast {
            None => self.env.set_addr("ifconfig_remote", remote_netmask),
            Some(broadcast) => {
                self.env.set_addr("ifconfig_netmask", remote_netmask);
                self.env.set_addr("ifconfig_broadcast", broadcast);
            }
        }

        self.addresses = Some(Addressing {
            local,
            remote_netmask,
            broadcast,
            point_to_point,
        });
        self.state = DeviceState::Validated;
        Ok(())
    }

    /// Acquire the OS device.
    ///
    /// A device that is missing but may show up later is reported as
    /// [`Error::DeviceUnavailable`] and leaves the device validated, so the
    /// caller may call `open` again.
    pub fn open(&mut self) -> Result<()> {
        if self.state != DeviceState::Validated {
            return Err(Error::State(format!(
                "cannot open a device in state {:?}",
                self.state
            )));
        }
        if self.kind == DeviceKind::Null {
            self.actual_name = Some(NULL_DEVICE_NAME.to_string());
            self.state = DeviceState::Opened;
            log::info!("Null device opened, no packets will be carried");
            return Ok(());
        }
        if self.ipv6 && !self.backend.ipv6_supported() {
            self.advise(Some(Advisory::Ipv6Unsupported));
            self.ipv6 = false;
        }
        let ctx = context(self.kind, self.ipv6, &self.config, self.addresses.as_ref());
        let actual = self.backend.open(
            &ctx,
            &self.config.name,
            self.config.dev_node.as_deref(),
        )?;
        self.actual_name = Some(actual);
        self.state = DeviceState::Opened;
        self.standby_iter = 0;
        Ok(())
    }

    /// Assign the validated addresses at the OS. Nothing happens for a
    /// device created without ifconfig parameters.
    pub fn configure(&mut self) -> Result<()> {
        if self.state != DeviceState::Opened {
            return Err(Error::State(format!(
                "cannot configure a device in state {:?}",
                self.state
            )));
        }
        if self.addresses.is_none() || self.kind == DeviceKind::Null {
            log::debug!("No ifconfig parameters, leaving {} unconfigured", self.config.name);
            return Ok(());
        }
        let actual = self.actual_name.as_deref().unwrap_or(&self.config.name);
        let ctx = context(self.kind, self.ipv6, &self.config, self.addresses.as_ref());
        self.backend.configure_address(&ctx, actual)?;
        self.state = DeviceState::ConfiguredAtOs;
        Ok(())
    }

    /// Read one packet. Null devices never have one.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.state.is_open() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if self.kind == DeviceKind::Null {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        self.backend.read(buf)
    }

    /// Write one packet. Null devices discard it.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.state.is_open() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if self.kind == DeviceKind::Null {
            return Ok(buf.len());
        }
        self.backend.write(buf)
    }

    /// Release every OS resource and forget the computed parameters.
    ///
    /// Safe on a device that was never opened, and calling it twice does
    /// nothing the second time.
    pub fn close(&mut self) {
        if self.state == DeviceState::Closed {
            return;
        }
        if self.state.is_open() && self.kind != DeviceKind::Null {
            let configured = self.state == DeviceState::ConfiguredAtOs;
            let actual = self
                .actual_name
                .clone()
                .unwrap_or_else(|| self.config.name.clone());
            let ctx = context(self.kind, self.ipv6, &self.config, self.addresses.as_ref());
            self.backend.close(&ctx, &actual, configured);
        }
        if let Some(name) = self.actual_name.take() {
            log::debug!("TUN/TAP device {name} closed");
        }
        self.addresses = None;
        self.standby_iter = 0;
        self.state = DeviceState::Closed;
    }

    /// Restart the standby poll counter.
    pub fn standby_init(&mut self) {
        self.standby_iter = 0;
    }

    /// One poll while waiting for the device to come up. Returns false
    /// once waiting should stop.
    pub fn standby(&mut self) -> Result<bool> {
        if !self.state.is_open() || self.kind == DeviceKind::Null {
            return Ok(true);
        }
        self.standby_iter += 1;
        let actual = self
            .actual_name
            .clone()
            .unwrap_or_else(|| self.config.name.clone());
        let ctx = context(self.kind, self.ipv6, &self.config, self.addresses.as_ref());
        self.backend.standby(&ctx, &actual, self.standby_iter)
    }

    /// Whether the OS reports the device as ready.
    pub fn is_up(&self) -> bool {
        if !self.state.is_open() {
            return false;
        }
        let ctx = context(self.kind, self.ipv6, &self.config, self.addresses.as_ref());
        self.backend.is_up(&ctx)
    }

    /// Peer compatibility string, empty when no parameters were computed
    /// or when `disable` is set.
    pub fn ifconfig_options_string(&self, remote: bool, disable: bool) -> String {
        match (&self.addresses, disable) {
            (Some(addr), false) => validate::ifconfig_options_string(
                self.kind,
                self.config.topology,
                addr.local,
                addr.remote_netmask,
                remote,
            ),
            _ => String::new(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn dev_type_string(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn topology(&self) -> Topology {
        self.config.topology
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Name the OS gave the device, once opened.
    pub fn actual_name(&self) -> Option<&str> {
        self.actual_name.as_deref()
    }

    pub fn addresses(&self) -> Option<&Addressing> {
        self.addresses.as_ref()
    }

    pub fn ifconfig_parameters_computed(&self) -> bool {
        self.addresses.is_some()
    }

    pub fn ifconfig_applied_to_os(&self) -> bool {
        self.state == DeviceState::ConfiguredAtOs
    }

    pub fn ipv6(&self) -> bool {
        self.ipv6
    }

    pub fn mtu(&self) -> u32 {
        self.config.mtu
    }

    pub fn options(&self) -> &TunTapOptions {
        &self.config.options
    }

    /// Variables published for up/down scripts.
    pub fn env(&self) -> &EnvSet {
        &self.env
    }

    /// Findings logged so far.
    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Platform specific handles, e.g. the Windows overlapped I/O state.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: Backend> Drop for TunTapDevice<B> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Best guess of the name external tools know the device by: the netsh
/// name of the adapter on Windows, the requested name elsewhere.
pub fn guess_device_name(name: &str, dev_type: Option<&str>, dev_node: Option<&str>) -> String {
    #[cfg(windows)]
    {
        let kind = validate::classify(Some(name), dev_type);
        if matches!(kind, DeviceKind::Tun | DeviceKind::Tap) {
            match crate::platform::windows::netsh_id(dev_node) {
                Ok(id) => return id,
                Err(e) => log::debug!("Cannot guess adapter name: {e}"),
            }
        }
    }
    #[cfg(not(windows))]
    let _ = (dev_type, dev_node);
    name.to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Calls {
        opened: u32,
        configured: u32,
        closed: Vec<bool>,
    }

    #[derive(Debug, Default)]
    struct Fake {
        calls: Arc<Mutex<Calls>>,
        ipv6: bool,
        missing: bool,
        open: bool,
    }

    impl Backend for Fake {
        fn ipv6_supported(&self) -> bool {
            self.ipv6
        }

        fn open(&mut self, _ctx: &DeviceContext<'_>, name: &str, _node: Option<&str>) -> Result<String> {
            if self.missing {
                return Err(Error::DeviceUnavailable(name.to_string()));
            }
            self.calls.lock().unwrap().opened += 1;
            self.open = true;
            Ok(format!("{name}0"))
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn configure_address(&mut self, ctx: &DeviceContext<'_>, _actual: &str) -> Result<()> {
            assert!(ctx.addresses.is_some());
            self.calls.lock().unwrap().configured += 1;
            Ok(())
        }

        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn close(&mut self, _ctx: &DeviceContext<'_>, _actual: &str, configured: bool) {
            self.calls.lock().unwrap().closed.push(configured);
            self.open = false;
        }
    }

    fn config(name: &str, ifconfig: Option<(&str, &str)>) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            dev_type: None,
            dev_node: None,
            topology: Topology::Net30,
            ifconfig: ifconfig.map(|(l, r)| (l.to_string(), r.to_string())),
            local_public: Ipv4Addr::UNSPECIFIED,
            remote_public: Ipv4Addr::UNSPECIFIED,
            strict_warnings: false,
            ipv6: false,
            mtu: 1500,
            options: TunTapOptions::default(),
            commands: CommandDriver::default(),
        }
    }

    #[test]
    fn full_cycle() {
        let fake = Fake::default();
        let calls = fake.calls.clone();
        let mut dev =
            TunTapDevice::new(config("tun", Some(("10.8.0.2", "10.8.0.1"))), fake).unwrap();
        assert_eq!(dev.state(), DeviceState::Validated);
        dev.open().unwrap();
        assert_eq!(dev.actual_name(), Some("tun0"));
        dev.configure().unwrap();
        assert!(dev.ifconfig_applied_to_os());
        assert_eq!(dev.write(&[1, 2, 3]).unwrap(), 3);
        dev.close();
        dev.close();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.opened, 1);
        assert_eq!(calls.configured, 1);
        assert_eq!(calls.closed, vec![true]);
    }

    #[test]
    fn null_device_skips_backend() {
        let fake = Fake::default();
        let calls = fake.calls.clone();
        let mut dev = TunTapDevice::new(config("null", None), fake).unwrap();
        dev.open().unwrap();
        assert_eq!(dev.actual_name(), Some(NULL_DEVICE_NAME));
        dev.configure().unwrap();
        assert_eq!(dev.write(&[0; 8]).unwrap(), 8);
        assert_eq!(
            dev.read(&mut [0; 8]).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        dev.close();
        assert_eq!(calls.lock().unwrap().opened, 0);
        assert!(calls.lock().unwrap().closed.is_empty());
    }

    #[test]
    fn null_with_ifconfig_is_fatal() {
        let err = TunTapDevice::new(config("null", Some(("10.8.0.2", "10.8.0.1"))), Fake::default())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unavailable_device_stays_validated() {
        let fake = Fake {
            missing: true,
            ..Default::default()
        };
        let mut dev = TunTapDevice::new(config("tun", None), fake).unwrap();
        let err = dev.open().unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(dev.state(), DeviceState::Validated);
        assert!(dev.actual_name().is_none());
    }

    #[test]
    fn ipv6_downgraded_without_backend_support() {
        let mut cfg = config("tun", None);
        cfg.ipv6 = true;
        let mut dev = TunTapDevice::new(cfg, Fake::default()).unwrap();
        dev.open().unwrap();
        assert!(!dev.ipv6());
        assert_eq!(dev.advisories(), &[Advisory::Ipv6Unsupported]);
    }

    #[test]
    fn tap_netmask_must_be_dotted() {
        let err = TunTapDevice::new(
            config("tap", Some(("192.168.50.1", "not-a-mask"))),
            Fake::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Resolve { .. }));
    }

    #[test]
    fn strict_checks_report_clash() {
        let mut cfg = config("tun", Some(("10.8.0.2", "10.8.0.1")));
        cfg.strict_warnings = true;
        cfg.remote_public = Ipv4Addr::new(10, 8, 0, 1);
        let dev = TunTapDevice::new(cfg, Fake::default()).unwrap();
        assert!(dev
            .advisories()
            .iter()
            .any(|a| matches!(a, Advisory::EndpointConflict { role, .. } if role == "remote")));
    }

    #[test]
    fn io_requires_open_device() {
        let mut dev = TunTapDevice::new(config("tun", None), Fake::default()).unwrap();
        assert_eq!(
            dev.write(&[0]).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert!(matches!(dev.configure(), Err(Error::State(_))));
        assert!(!dev.is_up());
    }

    #[test]
    fn options_string() {
        let dev = TunTapDevice::new(
            config("tap", Some(("192.168.50.1", "255.255.255.0"))),
            Fake::default(),
        )
        .unwrap();
        assert_eq!(dev.ifconfig_options_string(false, false), "192.168.50.0 255.255.255.0");
        assert_eq!(dev.ifconfig_options_string(false, true), "");
    }

    #[cfg(not(windows))]
    #[test]
    fn guess_name_falls_back_to_requested() {
        assert_eq!(guess_device_name("tun3", None, None), "tun3");
    }
}
