mod fd;
pub(crate) use self::fd::Fd;
mod tun;
pub(crate) use self::tun::{Framing, Tun};

use crate::error::{Error, Result};
use crate::ifconfig::IfconfigFlavor;
use crate::platform::DeviceContext;
use std::io;

/// Highest unit number tried when allocating a device dynamically.
pub const MAX_DYNAMIC_UNITS: u32 = 256;

/// Where to look for the device node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeSearch {
    /// Open exactly this path; the device keeps the requested name.
    Fixed(String),
    /// Try `/dev/<base>0` up to `/dev/<base>255`, first success wins.
    Probe(String),
}

impl NodeSearch {
    /// `(path, interface name)` pairs in the order they are tried.
    pub fn candidates<'a>(&'a self, dev: &'a str) -> Box<dyn Iterator<Item = (String, String)> + 'a> {
        match self {
            NodeSearch::Fixed(path) => Box::new(std::iter::once((path.clone(), dev.to_string()))),
            NodeSearch::Probe(base) => Box::new(
                (0..MAX_DYNAMIC_UNITS).map(move |i| (format!("/dev/{base}{i}"), format!("{base}{i}"))),
            ),
        }
    }
}

/// Decide how to find the node for device `dev`.
///
/// An explicit node is used literally. Otherwise a name without a unit
/// number is allocated dynamically when the backend allows it, and a name
/// with one maps to `/dev/<dev>`.
pub fn resolve_unit(dev: &str, node: Option<&str>, dynamic_allowed: bool) -> NodeSearch {
    match node {
        Some(node) => NodeSearch::Fixed(node.to_string()),
        None if dynamic_allowed && !dev.chars().any(|c| c.is_ascii_digit()) => {
            NodeSearch::Probe(dev.to_string())
        }
        None => NodeSearch::Fixed(format!("/dev/{dev}")),
    }
}

/// Open the device node for `dev`, returning it non-blocking and
/// close-on-exec together with the interface name.
#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
pub(crate) fn open_generic(dev: &str, node: Option<&str>, dynamic: bool) -> Result<(Fd, String)> {
    let search = resolve_unit(dev, node, dynamic);
    let (fd, path, name) = match &search {
        NodeSearch::Fixed(path) => match Fd::open(path) {
            Ok(fd) => (fd, path.clone(), dev.to_string()),
            Err(source) => {
                let e = Error::Open {
                    path: path.clone(),
                    source,
                };
                log::error!("{e}");
                return Err(e);
            }
        },
        NodeSearch::Probe(_) => {
            let mut opened = None;
            for (path, name) in search.candidates(dev) {
                match Fd::open(&path) {
                    Ok(fd) => {
                        opened = Some((fd, path, name));
                        break;
                    }
                    Err(e) => log::trace!("Tried opening {path} (failed): {e}"),
                }
            }
            match opened {
                Some(found) => found,
                None => {
                    let e = Error::Exhausted(format!("/dev/{dev}[0-{}]", MAX_DYNAMIC_UNITS - 1));
                    log::error!("{e}");
                    return Err(e);
                }
            }
        }
    };
    prepare(&fd).map_err(|source| Error::Open {
        path: path.clone(),
        source,
    })?;
    log::info!("TUN/TAP device {path} opened");
    Ok((fd, name))
}

/// Non-blocking and not inherited by the scripts we spawn.
pub(crate) fn prepare(fd: &Fd) -> io::Result<()> {
    fd.set_nonblocking(true)?;
    fd.set_cloexec()
}

/// Datagram socket used as the target of interface ioctls.
#[allow(dead_code)]
pub(crate) fn ctl() -> io::Result<Fd> {
    let fd = Fd::new(unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) })?;
    fd.set_cloexec()?;
    Ok(fd)
}

/// Copy `name` into a fixed size, NUL terminated interface name field.
#[allow(dead_code)]
pub(crate) fn copy_if_name(name: &str, dst: &mut [libc::c_char]) -> io::Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= dst.len() || bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name '{name}'"),
        ));
    }
    for (d, s) in dst.iter_mut().zip(bytes) {
        *d = *s as libc::c_char;
    }
    dst[bytes.len()] = 0;
    Ok(())
}

pub(crate) fn recv_on(tun: Option<&Tun>, buf: &mut [u8]) -> io::Result<usize> {
    match tun {
        Some(tun) => tun.recv(buf),
        None => Err(io::ErrorKind::NotConnected.into()),
    }
}

pub(crate) fn send_on(tun: Option<&Tun>, buf: &[u8]) -> io::Result<usize> {
    match tun {
        Some(tun) => tun.send(buf),
        None => Err(io::ErrorKind::NotConnected.into()),
    }
}

/// Assign addresses through the native ifconfig flavor of this OS.
pub(crate) fn configure_with_commands(ctx: &DeviceContext<'_>, actual_name: &str) -> Result<()> {
    let Some(req) = ctx.ifconfig_request(actual_name) else {
        return Ok(());
    };
    let Some(flavor) = IfconfigFlavor::native(ctx.options.use_iproute()) else {
        return Err(Error::NotSupported(
            "address assignment on this platform".to_string(),
        ));
    };
    flavor.up(&req).run(ctx.commands)
}

/// Undo [`configure_with_commands`]. Failures are logged only.
pub(crate) fn unconfigure_with_commands(ctx: &DeviceContext<'_>, actual_name: &str) {
    let (Some(req), Some(flavor)) = (
        ctx.ifconfig_request(actual_name),
        IfconfigFlavor::native(ctx.options.use_iproute()),
    ) else {
        return;
    };
    for step in flavor.down(&req) {
        let _ = ctx.commands.execute(&step.line, step.severity);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn explicit_node_is_literal() {
        assert_eq!(
            resolve_unit("tun", Some("/dev/custom"), true),
            NodeSearch::Fixed("/dev/custom".into())
        );
        let search = resolve_unit("tun", Some("/dev/custom"), true);
        let all: Vec<_> = search.candidates("tun").collect();
        assert_eq!(all, [("/dev/custom".to_string(), "tun".to_string())]);
    }

    #[test]
    fn dynamic_only_without_unit_number() {
        assert_eq!(resolve_unit("tun", None, true), NodeSearch::Probe("tun".into()));
        assert_eq!(
            resolve_unit("tun3", None, true),
            NodeSearch::Fixed("/dev/tun3".into())
        );
        assert_eq!(
            resolve_unit("tap", None, false),
            NodeSearch::Fixed("/dev/tap".into())
        );
        let search = resolve_unit("tap", None, true);
        let all: Vec<_> = search.candidates("tap").collect();
        assert_eq!(all.len(), 256);
        assert_eq!(all[0], ("/dev/tap0".to_string(), "tap0".to_string()));
        assert_eq!(all[255].1, "tap255");
    }

    #[test]
    fn open_failures() {
        let e = open_generic("tun", Some("/nonexistent/tun-node"), true).unwrap_err();
        assert!(matches!(e, Error::Open { ref path, .. } if path == "/nonexistent/tun-node"));
        assert!(e.is_fatal());
        let e = open_generic("nosuchdevprefix", None, true).unwrap_err();
        assert!(matches!(e, Error::Exhausted(_)));
    }

    #[test]
    fn open_literal_node() {
        let (fd, name) = open_generic("tun", Some("/dev/null"), true).unwrap();
        assert_eq!(name, "tun");
        assert!(fd.is_nonblocking().unwrap());
    }

    #[test]
    fn interface_name_field() {
        let mut field = [1 as libc::c_char; 16];
        copy_if_name("tun0", &mut field).unwrap();
        assert_eq!(field[..5], [b't' as _, b'u' as _, b'n' as _, b'0' as _, 0]);
        assert!(copy_if_name("a-name-that-is-too-long", &mut field).is_err());
    }
}
