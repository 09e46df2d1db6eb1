//! Control codes and payloads of the TAP-Windows driver.
//!
//! Payloads are plain byte arrays so they can be checked on any host; the
//! Windows backend hands them to `DeviceIoControl` unchanged.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, NativeEndian};
use std::net::Ipv4Addr;

const FILE_DEVICE_UNKNOWN: u32 = 0x0000_0022;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

#[allow(non_snake_case)]
#[inline]
const fn CTL_CODE(DeviceType: u32, Function: u32, Method: u32, Access: u32) -> u32 {
    (DeviceType << 16) | (Access << 14) | (Function << 2) | Method
}

const fn tap_control_code(function: u32) -> u32 {
    CTL_CODE(FILE_DEVICE_UNKNOWN, function, METHOD_BUFFERED, FILE_ANY_ACCESS)
}

pub const TAP_IOCTL_GET_MAC: u32 = tap_control_code(1);
pub const TAP_IOCTL_GET_VERSION: u32 = tap_control_code(2);
pub const TAP_IOCTL_GET_MTU: u32 = tap_control_code(3);
pub const TAP_IOCTL_GET_INFO: u32 = tap_control_code(4);
pub const TAP_IOCTL_CONFIG_POINT_TO_POINT: u32 = tap_control_code(5);
pub const TAP_IOCTL_SET_MEDIA_STATUS: u32 = tap_control_code(6);
pub const TAP_IOCTL_CONFIG_DHCP_MASQ: u32 = tap_control_code(7);
pub const TAP_IOCTL_GET_LOG_LINE: u32 = tap_control_code(8);
pub const TAP_IOCTL_CONFIG_DHCP_SET_OPT: u32 = tap_control_code(9);
pub const TAP_IOCTL_CONFIG_TUN: u32 = tap_control_code(10);

/// Component id the driver registers its adapters under.
pub const TAP_COMPONENT_ID: &str = "tap0901";
pub const USERMODEDEVICEDIR: &str = "\\\\.\\Global\\";
pub const TAPSUFFIX: &str = ".tap";

pub const TAP_WIN32_MIN_MAJOR: u32 = 9;
pub const TAP_WIN32_MIN_MINOR: u32 = 1;

/// Reply buffers for the free form text requests.
pub const INFO_BUFFER_SIZE: usize = 256;
pub const LOG_LINE_BUFFER_SIZE: usize = 1024;

/// `\\.\Global\{guid}.tap`
pub fn device_path(guid: &str) -> String {
    format!("{USERMODEDEVICEDIR}{guid}{TAPSUFFIX}")
}

/// Driver version as reported by `TAP_IOCTL_GET_VERSION`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
    pub debug: bool,
}

impl DriverVersion {
    pub fn from_reply(reply: &[u32; 3]) -> Self {
        Self {
            major: reply[0],
            minor: reply[1],
            debug: reply[2] != 0,
        }
    }

    /// The major version must match exactly, the minor one may be newer.
    pub fn check(&self) -> Result<()> {
        if self.major == TAP_WIN32_MIN_MAJOR && self.minor >= TAP_WIN32_MIN_MINOR {
            Ok(())
        } else {
            let e = Error::DriverVersion {
                major: self.major,
                minor: self.minor,
                min_major: TAP_WIN32_MIN_MAJOR,
                min_minor: TAP_WIN32_MIN_MINOR,
            };
            log::error!("{e}");
            Err(e)
        }
    }
}

impl std::fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if self.debug {
            f.write_str(" (DEBUG)")?;
        }
        Ok(())
    }
}

/// `TAP_IOCTL_CONFIG_POINT_TO_POINT`: local, remote.
pub fn point_to_point_payload(local: Ipv4Addr, remote: Ipv4Addr) -> [u8; 8] {
    let mut out = [0u8; 8];
    BigEndian::write_u32_into(&[local.into(), remote.into()], &mut out);
    out
}

/// `TAP_IOCTL_CONFIG_TUN`: local, network, netmask.
pub fn tun_subnet_payload(local: Ipv4Addr, netmask: Ipv4Addr) -> [u8; 12] {
    let l = u32::from(local);
    let m = u32::from(netmask);
    let mut out = [0u8; 12];
    BigEndian::write_u32_into(&[l, l & m, m], &mut out);
    out
}

/// `TAP_IOCTL_CONFIG_DHCP_MASQ`: address, netmask and server in network
/// order; the lease in host order, which is what the driver expects.
pub fn dhcp_masq_payload(
    local: Ipv4Addr,
    netmask: Ipv4Addr,
    server: Ipv4Addr,
    lease_secs: u32,
) -> [u8; 16] {
    let mut out = [0u8; 16];
    BigEndian::write_u32_into(
        &[local.into(), netmask.into(), server.into()],
        &mut out[..12],
    );
    NativeEndian::write_u32(&mut out[12..], lease_secs);
    out
}

/// `TAP_IOCTL_SET_MEDIA_STATUS`
pub fn media_status_payload(connected: bool) -> [u8; 4] {
    let mut out = [0u8; 4];
    NativeEndian::write_u32(&mut out, u32::from(connected));
    out
}

/// Text up to the first NUL of a reply buffer.
pub fn reply_text(reply: &[u8]) -> String {
    let end = reply.iter().position(|b| *b == 0).unwrap_or(reply.len());
    String::from_utf8_lossy(&reply[..end]).into_owned()
}
