//! Solaris/illumos STREAMS `tun`/`tap` driver.
//!
//! Opening plumbs the device below IP (and ARP for tap) with persistent
//! links; closing unlinks them again by multiplexor id.

mod sys;

use crate::error::{Error, Result};
use crate::platform::unix::{self, Fd};
use crate::platform::{Backend, DeviceContext};
use crate::validate::DeviceKind;
use std::io;
use std::os::unix::io::AsRawFd;
use sys::*;

const IP_NODE: &str = "/dev/udp";

/// Unit number requested by name; `-1` lets the driver choose.
pub(crate) fn requested_ppa(dev: &str) -> libc::c_int {
    if dev.is_empty() {
        return -1;
    }
    let digits: String = dev
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

fn fatal(what: String, source: io::Error) -> Error {
    let e = Error::Open { path: what, source };
    log::error!("{e}");
    e
}

fn open_node(path: &str) -> Result<Fd> {
    Fd::open(path).map_err(|e| fatal(format!("Can't open {path}"), e))
}

#[derive(Debug, Default)]
pub struct SolarisBackend {
    fd: Option<Fd>,
    ip_fd: Option<Fd>,
    tap: bool,
}

impl SolarisBackend {
    /// Plumb `if_fd` (and an ARP stream for tap) under `ip_fd`.
    fn plumb_tap(&self, if_fd: &Fd, ip_fd: &Fd, node: &str, name: &str, ppa: libc::c_int) -> Result<Fd> {
        let step = |what: &str, r: io::Result<libc::c_int>| {
            r.map_err(|e| fatal(what.to_string(), e))
        };
        let mut ifr = lifreq::zeroed();
        step("Can't get flags", unsafe { lif_ioctl(if_fd, SIOCGLIFFLAGS, &mut ifr) })?;
        unix::copy_if_name(name, &mut ifr.lifr_name).map_err(|e| fatal(name.to_string(), e))?;
        ifr.lifr_ppa = ppa as libc::c_uint;
        step(&format!("Can't set PPA {ppa}"), unsafe {
            lif_ioctl(if_fd, SIOCSLIFNAME, &mut ifr)
        })?;
        step("Can't get flags", unsafe { lif_ioctl(if_fd, SIOCGLIFFLAGS, &mut ifr) })?;
        step("Can't push ARP module", push_module(if_fd, ARP_MODULE))?;
        while pop_module(ip_fd).is_ok() {}
        step("Can't push ARP module", push_module(ip_fd, ARP_MODULE))?;
        let arp_fd = open_node(node)?;
        step("Can't push ARP module", push_module(&arp_fd, ARP_MODULE))?;
        step("Can't set ifname to arp", unsafe {
            str_ioctl(
                &arp_fd,
                SIOCSLIFNAME,
                &mut ifr as *mut lifreq as *mut libc::c_char,
                std::mem::size_of::<lifreq>(),
            )
        })?;
        Ok(arp_fd)
    }
}

impl Backend for SolarisBackend {
    fn ipv6_supported(&self) -> bool {
        true
    }

    fn open(&mut self, ctx: &DeviceContext<'_>, name: &str, node: Option<&str>) -> Result<String> {
        let (default_node, type_name) = match ctx.kind {
            DeviceKind::Tun => ("/dev/tun", "tun"),
            DeviceKind::Tap => ("/dev/tap", "tap"),
            other => {
                let e = Error::Config(format!(
                    "I don't recognize device {name} ({other}) as a tun or tap device"
                ));
                log::error!("{e}");
                return Err(e);
            }
        };
        let node = node.unwrap_or(default_node);
        let mut ppa = requested_ppa(name);

        let ip_fd = open_node(IP_NODE)?;
        let fd = open_node(node)?;
        ppa = unsafe {
            str_ioctl(
                &fd,
                TUNNEWPPA,
                &mut ppa as *mut libc::c_int as *mut libc::c_char,
                std::mem::size_of::<libc::c_int>(),
            )
        }
        .map_err(|e| fatal("Can't assign new interface".to_string(), e))?;

        let if_fd = Fd::open(node).map_err(|e| fatal(format!("Can't open {node} (2)"), e))?;
        push_module(&if_fd, IP_MODULE).map_err(|e| fatal("Can't push IP module".into(), e))?;
        if ctx.kind == DeviceKind::Tun {
            unsafe { ioctl_ptr(&if_fd, IF_UNITSEL, &mut ppa as *mut libc::c_int as *mut _) }
                .map_err(|e| fatal(format!("Can't set PPA {ppa}"), e))?;
        }
        let actual_name = format!("{type_name}{ppa}");

        let arp_fd = if ctx.kind == DeviceKind::Tap {
            Some(self.plumb_tap(&if_fd, &ip_fd, node, &actual_name, ppa)?)
        } else {
            None
        };

        let ip_muxid = link(&ip_fd, &if_fd)
            .map_err(|e| fatal(format!("Can't link {type_name} device to IP"), e))?;
        let arp_muxid = match &arp_fd {
            Some(arp_fd) => Some(link(&ip_fd, arp_fd).map_err(|e| {
                fatal(format!("Can't link {type_name} device to ARP"), e)
            })?),
            None => None,
        };
        drop(arp_fd);

        let mut ifr = lifreq::zeroed();
        unix::copy_if_name(&actual_name, &mut ifr.lifr_name)
            .map_err(|e| fatal(actual_name.clone(), e))?;
        unsafe {
            ifr.lifr_lifru.muxid = [ip_muxid, arp_muxid.unwrap_or(0)];
        }
        if let Err(e) = unsafe { lif_ioctl(&ip_fd, SIOCSLIFMUXID, &mut ifr) } {
            if let Some(arp_muxid) = arp_muxid {
                let _ = unlink(&ip_fd, arp_muxid);
            }
            let _ = unlink(&ip_fd, ip_muxid);
            return Err(fatal("Can't set multiplexor id".to_string(), e));
        }

        unix::prepare(&fd).map_err(|e| fatal(node.to_string(), e))?;
        ip_fd
            .set_cloexec()
            .map_err(|e| fatal(IP_NODE.to_string(), e))?;
        log::info!("TUN/TAP device {actual_name} opened");
        self.fd = Some(fd);
        self.ip_fd = Some(ip_fd);
        self.tap = ctx.kind == DeviceKind::Tap;
        Ok(actual_name)
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// A failing ifconfig unplumbs the interface before reporting.
    fn configure_address(&mut self, ctx: &DeviceContext<'_>, actual_name: &str) -> Result<()> {
        unix::configure_with_commands(ctx, actual_name)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.fd {
            Some(fd) => get_message(fd, buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.fd {
            Some(fd) => put_message(fd, buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn close(&mut self, _ctx: &DeviceContext<'_>, actual_name: &str, _configured: bool) {
        if let Some(ip_fd) = self.ip_fd.take() {
            let mut ifr = lifreq::zeroed();
            if unix::copy_if_name(actual_name, &mut ifr.lifr_name).is_ok() {
                if let Err(e) = unsafe { lif_ioctl(&ip_fd, SIOCGLIFFLAGS, &mut ifr) } {
                    log::warn!("Can't get iface flags: {e}");
                }
                if let Err(e) = unsafe { lif_ioctl(&ip_fd, SIOCGLIFMUXID, &mut ifr) } {
                    log::warn!("Can't get multiplexor id: {e}");
                }
                let [ip_muxid, arp_muxid] = unsafe { ifr.lifr_lifru.muxid };
                if self.tap {
                    if let Err(e) = unlink(&ip_fd, arp_muxid) {
                        log::warn!("Can't unlink interface(arp): {e}");
                    }
                }
                if let Err(e) = unlink(&ip_fd, ip_muxid) {
                    log::warn!("Can't unlink interface(ip): {e}");
                }
            }
        }
        self.fd = None;
        self.tap = false;
    }
}

fn get_message(fd: &Fd, buf: &mut [u8]) -> io::Result<usize> {
    let mut sbuf = strbuf {
        maxlen: buf.len().min(libc::c_int::MAX as usize) as libc::c_int,
        len: 0,
        buf: buf.as_mut_ptr() as *mut libc::c_char,
    };
    let mut flags: libc::c_int = 0;
    if unsafe { getmsg(fd.as_raw_fd(), std::ptr::null_mut(), &mut sbuf, &mut flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sbuf.len.max(0) as usize)
}

fn put_message(fd: &Fd, buf: &[u8]) -> io::Result<usize> {
    let sbuf = strbuf {
        maxlen: 0,
        len: libc::c_int::try_from(buf.len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
        buf: buf.as_ptr() as *mut libc::c_char,
    };
    if unsafe { putmsg(fd.as_raw_fd(), std::ptr::null(), &sbuf, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(buf.len())
}
