//! Linux `tun` driver through `/dev/net/tun`.

mod sys;

use crate::error::{Error, Result};
use crate::platform::unix::{self, copy_if_name, Fd, Framing, Tun};
use crate::platform::{Backend, DeviceContext};
use crate::validate::DeviceKind;
use nix::unistd::{Group, User};
use std::io;
use std::os::unix::io::AsRawFd;
use sys::*;

/// Clone device used when no node is given.
pub const DEFAULT_NODE: &str = "/dev/net/tun";

/// Linux backend. Interface names other than the bare `tun`/`tap` are
/// requested explicitly, otherwise the kernel picks the next free unit.
#[derive(Debug, Default)]
pub struct LinuxBackend {
    tun: Option<Tun>,
}

/// Flags passed to `TUNSETIFF`.
pub(crate) fn tunsetiff_flags(kind: DeviceKind, ipv6: bool) -> Result<libc::c_short> {
    let mut flags = if ipv6 { 0 } else { IFF_NO_PI };
    flags |= IFF_ONE_QUEUE;
    match kind {
        DeviceKind::Tun => flags |= IFF_TUN,
        DeviceKind::Tap => flags |= IFF_TAP,
        other => {
            let e = Error::Config(format!("I don't recognize device {other} as a tun or tap device"));
            log::error!("{e}");
            return Err(e);
        }
    }
    Ok(flags)
}

/// Name to request from the kernel, `None` to let it allocate one.
pub(crate) fn requested_name(dev: &str) -> Option<&str> {
    (dev != "tun" && dev != "tap").then_some(dev)
}

fn unavailable(what: String, e: io::Error) -> Error {
    log::warn!("Note: {what}: {e}");
    Error::DeviceUnavailable(what)
}

/// Open the clone device and attach it to an interface.
fn open_device(
    kind: DeviceKind,
    ipv6: bool,
    dev: &str,
    node: Option<&str>,
    txqueuelen: u32,
) -> Result<(Tun, String)> {
    let flags = tunsetiff_flags(kind, ipv6)?;
    let node = node.unwrap_or(DEFAULT_NODE);
    let fd = Fd::open(node)
        .map_err(|e| unavailable(format!("Cannot open TUN/TAP dev {node}"), e))?;

    let mut ifr = ifreq::zeroed();
    ifr.ifr_ifru.ifru_flags = flags;
    if let Some(name) = requested_name(dev) {
        copy_if_name(name, &mut ifr.ifr_name).map_err(|e| Error::Config(e.to_string()))?;
    }
    if let Err(e) = unsafe { tunsetiff(fd.as_raw_fd(), &mut ifr) } {
        return Err(unavailable(
            format!("Cannot ioctl TUNSETIFF {dev}"),
            io::Error::from(e),
        ));
    }
    let actual_name = ifr.name();
    log::info!("TUN/TAP device {actual_name} opened");

    if txqueuelen > 0 {
        match set_txqueuelen(&actual_name, txqueuelen) {
            Ok(()) => log::debug!("TUN/TAP TX queue length set to {txqueuelen}"),
            Err(e) => log::warn!("Note: Cannot set tx queue length on {actual_name}: {e}"),
        }
    }

    unix::prepare(&fd).map_err(|source| Error::Open {
        path: node.to_string(),
        source,
    })?;
    let framing = if ipv6 {
        Framing::PacketInfo
    } else {
        Framing::None
    };
    Ok((Tun::new(fd, framing, ipv6), actual_name))
}

fn set_txqueuelen(name: &str, len: u32) -> io::Result<()> {
    let ctl = unix::ctl()?;
    let mut ifr = ifreq::zeroed();
    copy_if_name(name, &mut ifr.ifr_name)?;
    ifr.ifr_ifru.ifru_qlen = libc::c_int::try_from(len)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    unsafe { siocsiftxqlen(ctl.as_raw_fd(), &ifr) }?;
    Ok(())
}

/// Owner and group applied to a persistent device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistOwnership {
    pub user: Option<String>,
    pub group: Option<String>,
}

/// Make a device persistent (or drop persistence) without running a
/// tunnel over it, optionally handing it to an unprivileged user/group.
pub fn persist_config(
    kind: DeviceKind,
    dev: &str,
    node: Option<&str>,
    persist: bool,
    ownership: &PersistOwnership,
) -> Result<()> {
    let (tun, name) = open_device(kind, false, dev, node, 0)?;
    let fd = tun.as_raw_fd();
    unsafe { tunsetpersist(fd, libc::c_ulong::from(persist) as _) }.map_err(|e| {
        driver_error("TUNSETPERSIST", e)
    })?;
    if let Some(user) = &ownership.user {
        let uid = match User::from_name(user) {
            Ok(Some(u)) => u.uid,
            _ => return Err(config_error(format!("Cannot get user entry for {user}"))),
        };
        unsafe { tunsetowner(fd, uid.as_raw() as _) }
            .map_err(|e| driver_error("TUNSETOWNER", e))?;
    }
    if let Some(group) = &ownership.group {
        let gid = match Group::from_name(group) {
            Ok(Some(g)) => g.gid,
            _ => return Err(config_error(format!("Cannot get group entry for {group}"))),
        };
        unsafe { tunsetgroup(fd, gid.as_raw() as _) }
            .map_err(|e| driver_error("TUNSETGROUP", e))?;
    }
    drop(tun);
    log::info!(
        "Persist state of {name} set to: {}",
        if persist { "ON" } else { "OFF" }
    );
    Ok(())
}

fn driver_error(request: &'static str, e: nix::Error) -> Error {
    let e = Error::Driver {
        request,
        source: io::Error::from(e),
    };
    log::error!("{e}");
    e
}

fn config_error(msg: String) -> Error {
    let e = Error::Config(msg);
    log::error!("{e}");
    e
}

impl Backend for LinuxBackend {
    fn ipv6_supported(&self) -> bool {
        true
    }

    fn open(&mut self, ctx: &DeviceContext<'_>, name: &str, node: Option<&str>) -> Result<String> {
        let (tun, actual_name) =
            open_device(ctx.kind, ctx.ipv6, name, node, ctx.options.txqueuelen())?;
        self.tun = Some(tun);
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

    fn close(&mut self, ctx: &DeviceContext<'_>, actual_name: &str, configured: bool) {
        if configured {
            unix::unconfigure_with_commands(ctx, actual_name);
        }
        self.tun = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags_follow_kind_and_ipv6() {
        let tun = tunsetiff_flags(DeviceKind::Tun, false).unwrap();
        assert_eq!(tun, IFF_TUN | IFF_NO_PI | IFF_ONE_QUEUE);
        let tap6 = tunsetiff_flags(DeviceKind::Tap, true).unwrap();
        assert_eq!(tap6, IFF_TAP | IFF_ONE_QUEUE);
        assert!(tunsetiff_flags(DeviceKind::Null, false).is_err());
    }

    #[test]
    fn bare_names_are_allocated_by_the_kernel() {
        assert_eq!(requested_name("tun"), None);
        assert_eq!(requested_name("tap"), None);
        assert_eq!(requested_name("tun5"), Some("tun5"));
        assert_eq!(requested_name("vpn-office"), Some("vpn-office"));
    }

    #[test]
    fn missing_clone_device_is_retryable() {
        let e = open_device(DeviceKind::Tun, false, "tun", Some("/nonexistent/net/tun"), 0)
            .unwrap_err();
        assert!(!e.is_fatal());
    }

    #[test]
    fn ifreq_name_roundtrip() {
        let mut ifr = ifreq::zeroed();
        copy_if_name("tun9", &mut ifr.ifr_name).unwrap();
        assert_eq!(ifr.name(), "tun9");
    }

    #[test]
    fn unopened_backend_refuses_io() {
        let mut backend = LinuxBackend::default();
        assert!(!backend.is_open());
        let mut buf = [0u8; 4];
        assert_eq!(
            backend.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
