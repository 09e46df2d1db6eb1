//! FreeBSD and DragonFly `tun(4)`/`tap(4)`.

use crate::error::Result;
use crate::platform::unix::{self, Fd, Framing, Tun};
use crate::platform::{Backend, DeviceContext};
use crate::validate::{DeviceKind, Topology};
use libc::c_int;
use nix::ioctl_write_ptr;
use std::io;
use std::os::unix::io::AsRawFd;

#[cfg(target_os = "dragonfly")]
ioctl_write_ptr!(tunslmode, b't', 93, c_int);
#[cfg(target_os = "freebsd")]
ioctl_write_ptr!(tunsifmode, b't', 94, c_int);
ioctl_write_ptr!(tunsifhead, b't', 96, c_int);

/// Interface mode for `TUNSIFMODE`.
#[cfg_attr(target_os = "dragonfly", allow(dead_code))]
pub(crate) fn tun_mode(topology: Topology) -> c_int {
    let mode = if topology == Topology::Subnet {
        libc::IFF_BROADCAST
    } else {
        libc::IFF_POINTOPOINT
    };
    mode | libc::IFF_MULTICAST
}

#[derive(Debug, Default)]
pub struct FreeBsdBackend {
    tun: Option<Tun>,
}

// If the TUNSIFHEAD ioctl has been set, every packet is preceded with a
// four byte address family.
#[cfg(target_os = "freebsd")]
fn set_modes(fd: &Fd, ctx: &DeviceContext<'_>) {
    if ctx.kind != DeviceKind::Tun {
        return;
    }
    let mode = tun_mode(ctx.topology);
    if let Err(e) = unsafe { tunsifmode(fd.as_raw_fd(), &mode) } {
        log::warn!("ioctl(TUNSIFMODE): {}", io::Error::from(e));
    }
    if let Err(e) = unsafe { tunsifhead(fd.as_raw_fd(), &1) } {
        log::warn!("ioctl(TUNSIFHEAD): {}", io::Error::from(e));
    }
}

#[cfg(target_os = "dragonfly")]
fn set_modes(fd: &Fd, _ctx: &DeviceContext<'_>) {
    // Extended modes off, address family header on.
    if let Err(e) = unsafe { tunslmode(fd.as_raw_fd(), &0) } {
        log::debug!("ioctl(TUNSLMODE): {}", io::Error::from(e));
    }
    if let Err(e) = unsafe { tunsifhead(fd.as_raw_fd(), &1) } {
        log::debug!("ioctl(TUNSIFHEAD): {}", io::Error::from(e));
    }
}

impl Backend for FreeBsdBackend {
    fn ipv6_supported(&self) -> bool {
        true
    }

    fn open(&mut self, ctx: &DeviceContext<'_>, name: &str, node: Option<&str>) -> Result<String> {
        let (fd, actual_name) = unix::open_generic(name, node, true)?;
        set_modes(&fd, ctx);
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

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mode_by_topology() {
        assert_eq!(
            tun_mode(Topology::Subnet),
            libc::IFF_BROADCAST | libc::IFF_MULTICAST
        );
        assert_eq!(
            tun_mode(Topology::Net30),
            libc::IFF_POINTOPOINT | libc::IFF_MULTICAST
        );
    }
}
