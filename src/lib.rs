#![cfg_attr(docsrs, feature(doc_cfg))]

/*!
# tuntap-ctl: TUN/TAP device management for user-space VPN daemons

This crate creates, addresses and drives the kernel tunnel device of a VPN daemon on Linux,
Solaris, the BSD family, macOS and Windows (TAP-Windows driver). It hides the differences
between the device-file + ioctl world of Unix and the handle + `DeviceIoControl` + overlapped
I/O + registry world of Windows behind one [`TunTapDevice`] lifecycle, checks the chosen
addresses before anything is touched and runs the native configuration commands
(`ip`, `ifconfig`, `route`, `netsh`) for you.

## Lifecycle

```text
Uninitialized -> Validated -> Opened -> ConfiguredAtOs -> Closed
```

1. **Validate**: [`DeviceBuilder::build`] classifies the device (`tun`, `tap` or `null`),
   resolves the ifconfig pair, runs the address checks and publishes the `ifconfig_*`
   variables in [`TunTapDevice::env`].
2. **Open**: [`TunTapDevice::open`] acquires the device node or adapter.
3. **Configure**: [`TunTapDevice::configure`] assigns the addresses at the OS.
4. **Drive**: the caller's event loop calls [`TunTapDevice::read`] and [`TunTapDevice::write`].
5. **Close**: [`TunTapDevice::close`] (also run on drop) releases everything exactly once.

## Quick Start

```no_run
# #[cfg(target_os = "linux")]
# {
use tuntap_ctl::{DeviceBuilder, Topology};

let mut dev = DeviceBuilder::new()
    .name("tun")
    .topology(Topology::Net30)
    .ifconfig("10.8.0.2", "10.8.0.1")
    .build()?;
dev.open()?;
dev.configure()?;

let mut buf = [0; 1600];
loop {
    match dev.read(&mut buf) {
        Ok(len) => println!("Received packet: {:?}", &buf[..len]),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
        Err(e) => return Err(e.into()),
    }
}
# }
# Ok::<(), tuntap_ctl::Error>(())
```

## Address Checks

With strict warnings on (the default), validation reports ifconfig parameters that look
wrong for the topology, public endpoints that collide with the virtual addresses and VPN
subnets that overlap the LAN behind the default gateway. Findings are logged and kept as
[`Advisory`] values; only impossible settings are errors.

## Platform-Specific Notes

### Windows
- Requires the TAP-Windows driver (component id `tap0901`), version 9.1 or newer
- Addresses are assigned by `netsh`, the IP helper API or the driver's DHCP masquerade
- Reads and writes are overlapped; wait on the events of `TapDevice`

### Linux
- Opens `/dev/net/tun`; the `tun_pi` header is used only with IPv6 framing
- Uses `ip` by default, legacy `ifconfig` on request

### BSD, macOS and Solaris
- Device nodes are probed dynamically (`/dev/tun0` .. `/dev/tun255`) when no unit is given
- FreeBSD, DragonFly and OpenBSD prefix packets with a 4-byte address family

## Logging

Diagnostics go through the [`log`] facade: errors right before a fatal error is returned,
warnings for advisories, info for status messages.
*/

mod builder;
mod device;
mod error;
mod platform;

pub mod adapter;
pub mod command;
pub mod dhcp;
pub mod env;
pub mod ifconfig;
pub mod netsh;
pub mod options;
pub mod overlapped;
pub mod route;
pub mod tap_protocol;
pub mod validate;

pub use crate::builder::*;
pub use crate::device::*;
pub use crate::error::{Error, Result};
pub use crate::options::{DhcpOptionSet, IpAssignMethod, NetbiosNodeType, TunTapOptions};
pub use crate::platform::{Addressing, Backend, DeviceContext};
pub use crate::validate::{Advisory, DeviceKind, Topology};

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
pub use crate::platform::PlatformBackend;

/// A device driven by the backend of this OS.
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
pub type Device = TunTapDevice<PlatformBackend>;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use crate::platform::linux::{persist_config, PersistOwnership};

#[cfg(target_os = "windows")]
pub use crate::platform::windows::{adapter_index_flexible, netsh_id, show_adapters, TapDevice};
