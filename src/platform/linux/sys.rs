use libc::{c_char, c_int, c_short, IFNAMSIZ};
use nix::{ioctl_readwrite_bad, ioctl_write_int, ioctl_write_ptr_bad, request_code_write};
use std::mem;

pub const IFF_TUN: c_short = 0x0001;
pub const IFF_TAP: c_short = 0x0002;
pub const IFF_NO_PI: c_short = 0x1000;
pub const IFF_ONE_QUEUE: c_short = 0x2000;

pub const SIOCSIFTXQLEN: libc::c_ulong = 0x8943;

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ifreq {
    pub ifr_name: [c_char; IFNAMSIZ],
    pub ifr_ifru: ifr_ifru,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone)]
pub union ifr_ifru {
    pub ifru_flags: c_short,
    pub ifru_qlen: c_int,
    pub ifru_pad: [u8; 24],
}

impl ifreq {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }

    /// Interface name up to the first NUL.
    pub fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .ifr_name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

ioctl_readwrite_bad!(
    tunsetiff,
    request_code_write!(b'T', 202, mem::size_of::<c_int>()),
    ifreq
);
ioctl_write_int!(tunsetpersist, b'T', 203);
ioctl_write_int!(tunsetowner, b'T', 204);
ioctl_write_int!(tunsetgroup, b'T', 206);
ioctl_write_ptr_bad!(siocsiftxqlen, SIOCSIFTXQLEN, ifreq);
