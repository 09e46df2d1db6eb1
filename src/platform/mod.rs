//! Per-OS device backends behind one [`Backend`] trait.

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::linux::LinuxBackend as PlatformBackend;

#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
pub(crate) mod freebsd;
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
pub use self::freebsd::FreeBsdBackend as PlatformBackend;

#[cfg(target_os = "openbsd")]
pub(crate) mod openbsd;
#[cfg(target_os = "openbsd")]
pub use self::openbsd::OpenBsdBackend as PlatformBackend;

#[cfg(target_os = "netbsd")]
pub(crate) mod netbsd;
#[cfg(target_os = "netbsd")]
pub use self::netbsd::NetBsdBackend as PlatformBackend;

#[cfg(target_os = "macos")]
pub(crate) mod macos;
#[cfg(target_os = "macos")]
pub use self::macos::MacOsBackend as PlatformBackend;

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
pub(crate) mod solaris;
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
pub use self::solaris::SolarisBackend as PlatformBackend;

#[cfg(target_os = "windows")]
pub(crate) mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::WindowsBackend as PlatformBackend;

use crate::command::CommandDriver;
use crate::error::Result;
use crate::ifconfig::IfconfigRequest;
use crate::options::TunTapOptions;
use crate::route::LanGateway;
use crate::validate::{DeviceKind, Topology};
use std::io;
use std::net::Ipv4Addr;

/// Binary ifconfig parameters computed during validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Addressing {
    pub local: Ipv4Addr,
    /// Peer address for point-to-point devices, netmask otherwise.
    pub remote_netmask: Ipv4Addr,
    /// Only set for subnet style devices.
    pub broadcast: Option<Ipv4Addr>,
    pub point_to_point: bool,
}

/// Everything a backend may consult besides its own state.
#[derive(Clone, Copy, Debug)]
pub struct DeviceContext<'a> {
    pub kind: DeviceKind,
    pub topology: Topology,
    /// IPv6 framing requested and supported.
    pub ipv6: bool,
    pub mtu: u32,
    pub options: &'a TunTapOptions,
    pub commands: &'a CommandDriver,
    /// `None` when no ifconfig parameters were supplied.
    pub addresses: Option<&'a Addressing>,
}

impl DeviceContext<'_> {
    /// Address assignment request for the device called `name`.
    pub fn ifconfig_request(&self, name: &str) -> Option<IfconfigRequest> {
        let addr = self.addresses?;
        Some(IfconfigRequest {
            name: name.to_string(),
            point_to_point: addr.point_to_point,
            topology: self.topology,
            local: addr.local,
            remote_netmask: addr.remote_netmask,
            broadcast: addr.broadcast.unwrap_or(Ipv4Addr::UNSPECIFIED),
            mtu: self.mtu,
        })
    }
}

/// One OS's way of opening, addressing and driving a tun/tap device.
///
/// Backends are never handed a `Null` device; the lifecycle handles those
/// itself.
pub trait Backend {
    /// Whether this backend frames IPv6 packets explicitly.
    fn ipv6_supported(&self) -> bool;

    /// Acquire the device. `name` is the requested device name, `node` an
    /// explicit device node (or adapter GUID/name on Windows). Returns the
    /// name the OS actually gave the device.
    ///
    /// A missing device that may appear later is reported as
    /// [`crate::Error::DeviceUnavailable`].
    fn open(&mut self, ctx: &DeviceContext<'_>, name: &str, node: Option<&str>) -> Result<String>;

    fn is_open(&self) -> bool;

    /// Assign the computed addresses to the opened device.
    fn configure_address(&mut self, ctx: &DeviceContext<'_>, actual_name: &str) -> Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Release everything acquired by `open` and `configure_address`.
    /// Failures are logged, never returned.
    fn close(&mut self, ctx: &DeviceContext<'_>, actual_name: &str, configured: bool);

    /// One poll while waiting for the device to come up. Returns false
    /// once the caller should stop waiting.
    fn standby(
        &mut self,
        _ctx: &DeviceContext<'_>,
        _actual_name: &str,
        _iteration: u32,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Whether the OS shows the device with its address yet.
    fn is_up(&self, _ctx: &DeviceContext<'_>) -> bool {
        true
    }

    /// LAN behind the host default gateway.
    fn default_gateway(&self) -> Option<LanGateway> {
        crate::route::default_gateway()
    }
}
