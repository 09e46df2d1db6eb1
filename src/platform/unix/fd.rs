use std::ffi::CString;
use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

/// Owned POSIX file descriptor of a device node, closed on drop.
#[derive(Debug)]
pub(crate) struct Fd {
    pub(crate) inner: RawFd,
}

impl Fd {
    pub(crate) fn new(value: RawFd) -> io::Result<Self> {
        if value < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Fd { inner: value })
    }

    /// Open `path` read/write.
    pub(crate) fn open(path: &str) -> io::Result<Self> {
        let c_path =
            CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        Fd::new(fd)
    }

    pub(crate) fn is_nonblocking(&self) -> io::Result<bool> {
        let flags = unsafe { libc::fcntl(self.inner, libc::F_GETFL) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok((flags & libc::O_NONBLOCK) != 0)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut nonblocking = nonblocking as libc::c_int;
        match unsafe { libc::ioctl(self.as_raw_fd(), libc::FIONBIO, &mut nonblocking) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.inner, libc::F_GETFD) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        match unsafe { libc::fcntl(self.inner, libc::F_SETFD, flags | libc::FD_CLOEXEC) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        }
    }

    #[inline]
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let amount = unsafe { libc::read(self.inner, buf.as_mut_ptr() as *mut _, buf.len()) };
        if amount < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(amount as usize)
    }

    #[inline]
    pub fn readv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let amount = unsafe {
            libc::readv(
                self.inner,
                bufs.as_mut_ptr() as *mut libc::iovec as *const libc::iovec,
                bufs.len() as libc::c_int,
            )
        };
        if amount < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(amount as usize)
    }

    #[inline]
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let amount = unsafe { libc::write(self.inner, buf.as_ptr() as *const _, buf.len()) };
        if amount < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(amount as usize)
    }

    #[inline]
    pub fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let amount = unsafe {
            libc::writev(
                self.inner,
                bufs.as_ptr() as *const libc::iovec,
                bufs.len() as libc::c_int,
            )
        };
        if amount < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(amount as usize)
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(mut self) -> RawFd {
        let fd = self.inner;
        self.inner = -1;
        fd
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.inner >= 0 {
            unsafe { libc::close(self.inner) };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flags_on_a_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let rx = Fd::new(fds[0]).unwrap();
        let tx = Fd::new(fds[1]).unwrap();
        rx.set_nonblocking(true).unwrap();
        rx.set_cloexec().unwrap();
        assert!(rx.is_nonblocking().unwrap());
        let mut buf = [0u8; 8];
        assert_eq!(
            rx.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        assert_eq!(tx.writev(&[IoSlice::new(b"ab"), IoSlice::new(b"cd")]).unwrap(), 4);
        let (mut a, mut b) = ([0u8; 1], [0u8; 8]);
        let n = rx
            .readv(&mut [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)])
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(&b[..3], b"bcd");
    }

    #[test]
    fn open_missing_path() {
        let e = Fd::open("/nonexistent/tuntap-node").unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::NotFound);
        assert!(Fd::new(-1).is_err());
    }
}
