use crate::platform::unix::Fd;
use libc::{c_char, c_int, c_uint, c_ulong};
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;

pub const LIFNAMSIZ: usize = 32;

const STR: c_int = (b'S' as c_int) << 8;
pub const I_PUSH: c_int = STR | 0o2;
pub const I_POP: c_int = STR | 0o3;
pub const I_STR: c_int = STR | 0o10;
pub const I_PLINK: c_int = STR | 0o26;
pub const I_PUNLINK: c_int = STR | 0o27;

pub const IF_UNITSEL: c_int = -2;
pub const TUNNEWPPA: c_int = ((b'T' as c_int) << 16) | 0x0001;

pub const IP_MODULE: &[u8] = b"ip\0";
pub const ARP_MODULE: &[u8] = b"arp\0";

const IOC_IN: c_ulong = 0x8000_0000;
const IOC_INOUT: c_ulong = 0xC000_0000;
const IOCPARM_MASK: c_ulong = 0xff;

const fn ioc(dir: c_ulong, group: u8, num: c_ulong, len: usize) -> c_int {
    (dir | ((len as c_ulong & IOCPARM_MASK) << 16) | ((group as c_ulong) << 8) | num) as c_int
}

pub const SIOCGLIFFLAGS: c_int = ioc(IOC_INOUT, b'i', 117, mem::size_of::<lifreq>());
pub const SIOCSLIFNAME: c_int = ioc(IOC_INOUT, b'i', 129, mem::size_of::<lifreq>());
pub const SIOCGLIFMUXID: c_int = ioc(IOC_INOUT, b'i', 131, mem::size_of::<lifreq>());
pub const SIOCSLIFMUXID: c_int = ioc(IOC_IN, b'i', 132, mem::size_of::<lifreq>());

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone)]
pub struct lifreq {
    pub lifr_name: [c_char; LIFNAMSIZ],
    pub lifr_ppa: c_uint,
    pub lifr_type: c_uint,
    pub lifr_lifru: lifr_lifru,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Copy, Clone)]
pub union lifr_lifru {
    /// IP and ARP multiplexor ids.
    pub muxid: [c_int; 2],
    pub flags: u64,
    pub pad: [u64; 42],
}

impl lifreq {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[allow(non_camel_case_types)]
#[repr(C)]
pub struct strioctl {
    pub ic_cmd: c_int,
    pub ic_timout: c_int,
    pub ic_len: c_int,
    pub ic_dp: *mut c_char,
}

#[allow(non_camel_case_types)]
#[repr(C)]
pub struct strbuf {
    pub maxlen: c_int,
    pub len: c_int,
    pub buf: *mut c_char,
}

extern "C" {
    pub fn getmsg(fd: c_int, ctlptr: *mut strbuf, dataptr: *mut strbuf, flags: *mut c_int) -> c_int;
    pub fn putmsg(fd: c_int, ctlptr: *const strbuf, dataptr: *const strbuf, flags: c_int) -> c_int;
}

fn check(ret: c_int) -> io::Result<c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub unsafe fn ioctl_ptr(fd: &Fd, request: c_int, arg: *mut libc::c_void) -> io::Result<c_int> {
    check(libc::ioctl(fd.as_raw_fd(), request as _, arg))
}

pub unsafe fn lif_ioctl(fd: &Fd, request: c_int, ifr: &mut lifreq) -> io::Result<c_int> {
    ioctl_ptr(fd, request, ifr as *mut lifreq as *mut libc::c_void)
}

/// `I_STR` wrapping `cmd` with an in/out buffer of `len` bytes.
pub unsafe fn str_ioctl(fd: &Fd, cmd: c_int, data: *mut c_char, len: usize) -> io::Result<c_int> {
    let mut strioc = strioctl {
        ic_cmd: cmd,
        ic_timout: 0,
        ic_len: len as c_int,
        ic_dp: data,
    };
    ioctl_ptr(fd, I_STR, &mut strioc as *mut strioctl as *mut libc::c_void)
}

pub fn push_module(fd: &Fd, module: &[u8]) -> io::Result<c_int> {
    unsafe { ioctl_ptr(fd, I_PUSH, module.as_ptr() as *mut libc::c_void) }
}

pub fn pop_module(fd: &Fd) -> io::Result<c_int> {
    unsafe { ioctl_ptr(fd, I_POP, std::ptr::null_mut()) }
}

/// Persistent link of `lower` below `upper`, returns the multiplexor id.
pub fn link(upper: &Fd, lower: &Fd) -> io::Result<c_int> {
    check(unsafe { libc::ioctl(upper.as_raw_fd(), I_PLINK as _, lower.as_raw_fd()) })
}

pub fn unlink(upper: &Fd, muxid: c_int) -> io::Result<c_int> {
    check(unsafe { libc::ioctl(upper.as_raw_fd(), I_PUNLINK as _, muxid) })
}
