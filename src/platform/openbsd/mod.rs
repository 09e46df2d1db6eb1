//! OpenBSD `tun(4)`. Every tun packet carries an address family header.

use crate::error::Result;
use crate::platform::unix::{self, Fd, Framing, Tun};
use crate::platform::{Backend, DeviceContext};
use crate::validate::DeviceKind;
use libc::{c_uint, c_ushort};
use nix::{ioctl_read, ioctl_write_ptr};
use std::io;
use std::os::unix::io::AsRawFd;

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct tuninfo {
    pub mtu: c_uint,
    pub type_: c_ushort,
    pub flags: c_ushort,
    pub baudrate: c_uint,
}

ioctl_write_ptr!(tunsifinfo, b't', 91, tuninfo);
ioctl_read!(tungifinfo, b't', 92, tuninfo);

/// Turn on `IFF_MULTICAST`. Failures only degrade the device.
fn enable_multicast(fd: &Fd) {
    let mut info = tuninfo::default();
    if let Err(e) = unsafe { tungifinfo(fd.as_raw_fd(), &mut info) } {
        log::warn!("Can't get interface info: {}", io::Error::from(e));
    }
    info.flags |= libc::IFF_MULTICAST as c_ushort;
    if let Err(e) = unsafe { tunsifinfo(fd.as_raw_fd(), &info) } {
        log::warn!("Can't set interface info: {}", io::Error::from(e));
    }
}

#[derive(Debug, Default)]
pub struct OpenBsdBackend {
    tun: Option<Tun>,
}

impl Backend for OpenBsdBackend {
    fn ipv6_supported(&self) -> bool {
        true
    }

    fn open(&mut self, ctx: &DeviceContext<'_>, name: &str, node: Option<&str>) -> Result<String> {
        let (fd, actual_name) = unix::open_generic(name, node, true)?;
        enable_multicast(&fd);
        let framing = if ctx.kind == DeviceKind::Tun {
            Framing::AddressFamily
        } else {
            Framing::None
        };
        self.tun = Some(Tun::new(fd, framing, ctx.ipv6));
        Ok(actual_name)
    }

    fn is_open(&self) -> bool {
        self.tun.is_some()
    }

    /// Devices may survive a previous run, they are destroyed and created
    /// again before the address is set.
    fn configure_address(&mut self, ctx: &DeviceContext<'_>, actual_name: &str) -> Result<()> {
        unix::configure_with_commands(ctx, actual_name)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        unix::recv_on(self.tun.as_ref(), buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        unix::send_on(self.tun.as_ref(), buf)
    }

    fn close(&mut self, _ctx: &DeviceContext<'_>, _actual_name: &str, _configured: bool) {
        self.tun = None;
    }
}
