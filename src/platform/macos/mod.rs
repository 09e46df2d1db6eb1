//! macOS through the third party tun/tap kernel extension (`/dev/tunN`,
//! `/dev/tapN`). The driver has no explicit IPv6 framing.

use crate::error::Result;
use crate::platform::unix::{self, Framing, Tun};
use crate::platform::{Backend, DeviceContext};
use std::io;

#[derive(Debug, Default)]
pub struct MacOsBackend {
    tun: Option<Tun>,
}

impl Backend for MacOsBackend {
    fn ipv6_supported(&self) -> bool {
        false
    }

    fn open(&mut self, ctx: &DeviceContext<'_>, name: &str, node: Option<&str>) -> Result<String> {
        let (fd, actual_name) = unix::open_generic(name, node, true)?;
        self.tun = Some(Tun::new(fd, Framing::None, ctx.ipv6));
        Ok(actual_name)
    }

    fn is_open(&self) -> bool {
        self.tun.is_some()
    }

    /// Addresses left over from an earlier run are deleted first.
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
