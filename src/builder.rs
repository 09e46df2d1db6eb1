/*!
# Device Builder Module

This module provides the [`DeviceBuilder`] struct for describing a TUN/TAP device before it is
validated and handed to a backend.

## Overview

The builder collects everything the lifecycle needs:
- Device name, explicit type and device node (adapter GUID or connection name on Windows)
- Topology and the ifconfig pair (local address, peer address or netmask)
- Public endpoints used by the address clash checks
- MTU, IPv6 framing and the [`TunTapOptions`] bag
- The [`CommandDriver`] shared with the rest of the daemon

Nothing touches the OS until [`crate::TunTapDevice::open`] is called.

## Basic Usage

```no_run
# #[cfg(target_os = "linux")]
# {
use tuntap_ctl::{DeviceBuilder, Topology};

let mut dev = DeviceBuilder::new()
    .name("tun")
    .topology(Topology::Net30)
    .ifconfig("10.8.0.2", "10.8.0.1")
    .mtu(1500)
    .build()?;
dev.open()?;
dev.configure()?;
# }
# Ok::<(), tuntap_ctl::Error>(())
```

## Windows Options

```no_run
# #[cfg(target_os = "windows")]
# {
use tuntap_ctl::{DeviceBuilder, IpAssignMethod, TunTapOptions};

let options = TunTapOptions::builder()
    .ip_assign(IpAssignMethod::DhcpMasquerade)
    .dns("10.8.0.1".parse().unwrap())
    .build()?;
let dev = DeviceBuilder::new()
    .name("tap")
    .dev_node("MyTap")
    .ifconfig("10.3.0.1", "255.255.255.0")
    .options(options)
    .build()?;
# }
# Ok::<(), tuntap_ctl::Error>(())
```
*/

use crate::command::CommandDriver;
use crate::device::{DeviceConfig, TunTapDevice};
use crate::error::{Error, Result};
use crate::options::TunTapOptions;
use crate::platform::Backend;
use crate::validate::Topology;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// MTU used when none is given.
pub const DEFAULT_MTU: u32 = 1500;

/// Describes a device to create.
#[derive(Debug, Default)]
pub struct DeviceBuilder {
    name: Option<String>,
    dev_type: Option<String>,
    dev_node: Option<String>,
    topology: Option<Topology>,
    ifconfig: Option<(String, String)>,
    local_public: Option<io::Result<Ipv4Addr>>,
    remote_public: Option<io::Result<Ipv4Addr>>,
    strict_warnings: Option<bool>,
    ipv6: Option<bool>,
    mtu: Option<u32>,
    options: Option<TunTapOptions>,
    commands: Option<CommandDriver>,
}

impl DeviceBuilder {
    /// Creates a new DeviceBuilder instance with default settings.
    pub fn new() -> Self {
        Self::default()
    }
    /// Sets the requested device name, e.g. `tun`, `tap0` or `null`.
    pub fn name<S: Into<String>>(mut self, dev_name: S) -> Self {
        self.name = Some(dev_name.into());
        self
    }
    /// Sets `tun`, `tap` or `null` explicitly, for names without that prefix.
    pub fn dev_type<S: Into<String>>(mut self, dev_type: S) -> Self {
        self.dev_type = Some(dev_type.into());
        self
    }
    /// Sets the device node to open, or the adapter GUID/connection name on Windows.
    pub fn dev_node<S: Into<String>>(mut self, dev_node: S) -> Self {
        self.dev_node = Some(dev_node.into());
        self
    }
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }
    /// Sets the ifconfig pair. `remote_netmask` is the peer address for
    /// point-to-point tun devices and the netmask otherwise. Host names
    /// are resolved when the device is built.
    pub fn ifconfig<L: Into<String>, R: Into<String>>(mut self, local: L, remote_netmask: R) -> Self {
        self.ifconfig = Some((local.into(), remote_netmask.into()));
        self
    }
    /// Public address of this host, checked against the virtual addresses.
    pub fn local_public<A: ToIpv4Address>(mut self, addr: A) -> Self {
        self.local_public = Some(addr.ipv4());
        self
    }
    /// Public address of the peer, checked against the virtual addresses.
    pub fn remote_public<A: ToIpv4Address>(mut self, addr: A) -> Self {
        self.remote_public = Some(addr.ipv4());
        self
    }
    /// Overrides [`TunTapOptions::strict_warnings`].
    pub fn strict_warnings(mut self, strict: bool) -> Self {
        self.strict_warnings = Some(strict);
        self
    }
    /// Requests explicit IPv6 framing. Backends without it log a note and
    /// fall back to IPv4 only.
    pub fn ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = Some(ipv6);
        self
    }
    /// Sets the device MTU (Maximum Transmission Unit).
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }
    pub fn options(mut self, options: TunTapOptions) -> Self {
        self.options = Some(options);
        self
    }
    /// Sets the driver used for `ip`, `ifconfig`, `route` and `netsh`.
    /// Defaults to running the system commands.
    pub fn commands(mut self, commands: CommandDriver) -> Self {
        self.commands = Some(commands);
        self
    }

    fn public(addr: Option<io::Result<Ipv4Addr>>, role: &str) -> Result<Ipv4Addr> {
        match addr {
            None => Ok(Ipv4Addr::UNSPECIFIED),
            Some(Ok(addr)) => Ok(addr),
            Some(Err(e)) => Err(Error::Config(format!("invalid {role} public address: {e}"))),
        }
    }

    /// Checks the collected settings without validating addresses.
    pub fn build_config(self) -> Result<DeviceConfig> {
        let name = match self.name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(Error::Config("a device name is required".to_string())),
        };
        let mtu = self.mtu.unwrap_or(DEFAULT_MTU);
        if mtu == 0 {
            return Err(Error::Config("MTU must be positive".to_string()));
        }
        let options = self.options.unwrap_or_default();
        Ok(DeviceConfig {
            name,
            dev_type: self.dev_type,
            dev_node: self.dev_node,
            topology: self.topology.unwrap_or_default(),
            ifconfig: self.ifconfig,
            local_public: Self::public(self.local_public, "local")?,
            remote_public: Self::public(self.remote_public, "remote")?,
            strict_warnings: self.strict_warnings.unwrap_or(options.strict_warnings()),
            ipv6: self.ipv6.unwrap_or(false),
            mtu,
            options,
            commands: self.commands.unwrap_or_default(),
        })
    }

    /// Validates the settings and creates a device driven by `backend`.
    pub fn build_with<B: Backend>(self, backend: B) -> Result<TunTapDevice<B>> {
        let config = self.build_config()?;
        TunTapDevice::new(config, backend)
    }

    /// Validates the settings and creates a device for this OS.
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "macos",
        target_os = "solaris",
        target_os = "illumos",
        target_os = "windows"
    ))]
    pub fn build(self) -> Result<crate::Device> {
        self.build_with(crate::platform::PlatformBackend::default())
    }
}

/// Trait for converting various types into an IPv4 address.
pub trait ToIpv4Address {
    /// Attempts to convert the implementing type into an `Ipv4Addr`.
    fn ipv4(&self) -> io::Result<Ipv4Addr>;
}
impl ToIpv4Address for Ipv4Addr {
    fn ipv4(&self) -> io::Result<Ipv4Addr> {
        Ok(*self)
    }
}
impl ToIpv4Address for IpAddr {
    fn ipv4(&self) -> io::Result<Ipv4Addr> {
        match self {
            IpAddr::V4(ip) => Ok(*ip),
            IpAddr::V6(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid address",
            )),
        }
    }
}
impl ToIpv4Address for String {
    fn ipv4(&self) -> io::Result<Ipv4Addr> {
        self.as_str().ipv4()
    }
}
impl ToIpv4Address for &str {
    fn ipv4(&self) -> io::Result<Ipv4Addr> {
        Ipv4Addr::from_str(self)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid IPv4 str"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = DeviceBuilder::new().name("tun").build_config().unwrap();
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.topology, Topology::Net30);
        assert!(config.strict_warnings);
        assert!(!config.ipv6);
        assert!(config.local_public.is_unspecified());
        assert!(config.ifconfig.is_none());
    }

    #[test]
    fn name_required() {
        assert!(matches!(
            DeviceBuilder::new().build_config(),
            Err(Error::Config(_))
        ));
        assert!(DeviceBuilder::new().name("").build_config().is_err());
    }

    #[test]
    fn bad_public_address_reported_at_build() {
        let err = DeviceBuilder::new()
            .name("tun")
            .remote_public("vpn.example.org")
            .build_config()
            .unwrap_err();
        assert!(err.to_string().contains("remote"));
    }

    #[test]
    fn strict_override() {
        let config = DeviceBuilder::new()
            .name("tap")
            .strict_warnings(false)
            .local_public(IpAddr::from([198, 51, 100, 7]))
            .build_config()
            .unwrap();
        assert!(!config.strict_warnings);
        assert_eq!(config.local_public, Ipv4Addr::new(198, 51, 100, 7));
    }

    #[test]
    fn devices_share_the_default_command_lock() {
        let a = DeviceBuilder::new().name("tun").build_config().unwrap();
        let b = DeviceBuilder::new().name("tap").build_config().unwrap();
        assert!(a.commands.lock().shares_with(b.commands.lock()));
        assert_eq!(
            a.commands.lock().name(),
            crate::command::DEFAULT_LOCK_NAME
        );
    }
}
