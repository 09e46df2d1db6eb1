use crate::platform::unix::Fd;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, RawFd};

/// Length of the header some drivers put in front of every packet.
pub(crate) const HEADER_LENGTH: usize = 4;

const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;

/// Per-packet header the driver expects on this device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Raw packets.
    None,
    /// Address family as a network order u32 (BSD `TUNSIFHEAD` style).
    AddressFamily,
    /// Linux `tun_pi`: zero flags plus the ethertype.
    PacketInfo,
}

/// Version nibble of an IP header, 4 for anything unreadable.
fn ip_version(buf: &[u8]) -> u8 {
    buf.first().map(|b| b >> 4).unwrap_or(4)
}

/// Address family header for `buf`. IPv6 is only tagged as such when the
/// device runs with IPv6 enabled.
pub(crate) fn af_header(buf: &[u8], ipv6: bool) -> [u8; HEADER_LENGTH] {
    let family = if ipv6 && ip_version(buf) == 6 {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };
    (family as u32).to_be_bytes()
}

/// `tun_pi` header for `buf`.
pub(crate) fn pi_header(buf: &[u8]) -> [u8; HEADER_LENGTH] {
    let proto = if ip_version(buf) == 6 {
        ETH_P_IPV6
    } else {
        ETH_P_IP
    };
    let mut header = [0u8; HEADER_LENGTH];
    header[2..].copy_from_slice(&proto.to_be_bytes());
    header
}

/// Payload length of a transfer that included an address family header.
/// Short transfers count as empty.
pub(crate) fn strip_af(len: usize) -> usize {
    len.saturating_sub(HEADER_LENGTH)
}

/// Payload length of a transfer that included a `tun_pi` header.
pub(crate) fn strip_pi(len: usize) -> io::Result<usize> {
    len.checked_sub(HEADER_LENGTH).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("short packet information transfer ({len} bytes)"),
        )
    })
}

/// An open device node together with its framing.
#[derive(Debug)]
pub(crate) struct Tun {
    pub(crate) fd: Fd,
    framing: Framing,
    ipv6: bool,
}

impl Tun {
    pub(crate) fn new(fd: Fd, framing: Framing, ipv6: bool) -> Self {
        Self { fd, framing, ipv6 }
    }

    pub(crate) fn framing(&self) -> Framing {
        self.framing
    }

    #[inline]
    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self.framing {
            Framing::None => self.fd.write(buf),
            Framing::AddressFamily => {
                let header = af_header(buf, self.ipv6);
                let len = self
                    .fd
                    .writev(&[IoSlice::new(&header), IoSlice::new(buf)])?;
                Ok(strip_af(len))
            }
            Framing::PacketInfo => {
                let header = pi_header(buf);
                let len = self
                    .fd
                    .writev(&[IoSlice::new(&header), IoSlice::new(buf)])?;
                strip_pi(len)
            }
        }
    }

    #[inline]
    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.framing == Framing::None {
            return self.fd.read(buf);
        }
        let mut header = [0u8; HEADER_LENGTH];
        let len = self
            .fd
            .readv(&mut [IoSliceMut::new(&mut header), IoSliceMut::new(buf)])?;
        match self.framing {
            Framing::PacketInfo => strip_pi(len),
            _ => Ok(strip_af(len)),
        }
    }
}

impl AsRawFd for Tun {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
