//! NetBSD `tun(4)` with link layer mode off, so packets carry no header.

mod sys;

use crate::error::Result;
use crate::platform::unix::{self, Fd, Framing, Tun};
use crate::platform::{Backend, DeviceContext};
use std::io;
use std::os::unix::io::AsRawFd;
use sys::*;

/// Multicast on, and no address family prepended to each packet.
fn set_modes(fd: &Fd) {
    let mode = libc::IFF_POINTOPOINT | libc::IFF_MULTICAST;
    if let Err(e) = unsafe { tunsifmode(fd.as_raw_fd(), &mode) } {
        log::debug!("ioctl(TUNSIFMODE): {}", io::Error::from(e));
    }
    if let Err(e) = unsafe { tunslmode(fd.as_raw_fd(), &0) } {
        log::debug!("ioctl(TUNSLMODE): {}", io::Error::from(e));
    }
}

#[derive(Debug, Default)]
pub struct NetBsdBackend {
    tun: Option<Tun>,
}

impl Backend for NetBsdBackend {
    fn ipv6_supported(&self) -> bool {
        true
    }

    fn open(&mut self, ctx: &DeviceContext<'_>, name: &str, node: Option<&str>) -> Result<String> {
        let (fd, actual_name) = unix::open_generic(name, node, true)?;
        set_modes(&fd);
        self.tun = Some(Tun::new(fd, Framing::None, ctx.ipv6));
        Ok(actual_name)
    }

    fn is_open(&self) -> bool {
        self.tun.is_some()
    }

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
