//! Per-direction state of an overlapped (asynchronous) transfer.
//!
//! Issuing and completing are separate steps driven by the caller's event
//! loop: `queue_*` arms the completion event and starts the OS call,
//! [`OverlappedIo::finalize`] collects the result once the event fired.

use bytes::BytesMut;
use std::fmt;
use std::io;

/// Room for one ethernet frame plus the largest payload the driver hands out.
pub const IO_BUFFER_SIZE: usize = 14 + 65536;

/// OS primitives behind one direction of overlapped I/O.
pub trait OverlappedOps {
    fn reset_event(&self) -> io::Result<()>;
    fn set_event(&self) -> io::Result<()>;
    /// Start a read. `Err(WouldBlock)` means the request is pending; `buf`
    /// must then stay in place until the request completes.
    fn start_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Start a write. `Err(WouldBlock)` means the request is pending.
    fn start_write(&mut self, buf: &[u8]) -> io::Result<usize>;
    /// Result of the pending request without waiting; `Err(WouldBlock)`
    /// while it is still incomplete.
    fn overlapped_result(&mut self) -> io::Result<usize>;
    /// Ask the OS to abandon any pending request.
    fn cancel(&mut self) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IoState {
    #[default]
    Initial,
    Queued,
    ImmediateReturn,
}

impl IoState {
    /// Single character used in status lines.
    pub fn as_char(&self) -> char {
        match self {
            IoState::Initial => '0',
            IoState::Queued => 'Q',
            IoState::ImmediateReturn => '1',
        }
    }
}

impl fmt::Display for IoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Buffer, state and last status of one direction.
pub struct OverlappedIo<O: OverlappedOps> {
    ops: O,
    buf: BytesMut,
    state: IoState,
    size: usize,
    status: Option<io::Error>,
}

impl<O: OverlappedOps> fmt::Debug for OverlappedIo<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlappedIo")
            .field("state", &self.state)
            .field("size", &self.size)
            .field("status", &self.status)
            .finish()
    }
}

impl<O: OverlappedOps> OverlappedIo<O> {
    pub fn new(ops: O) -> Self {
        Self {
            ops,
            buf: BytesMut::zeroed(IO_BUFFER_SIZE),
            state: IoState::Initial,
            size: 0,
            status: None,
        }
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Data of the last completed transfer.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    /// Issue a read into the internal buffer. Does nothing unless the
    /// direction is idle.
    pub fn queue_read(&mut self) -> IoState {
        if self.state != IoState::Initial {
            return self.state;
        }
        if let Err(e) = self.ops.reset_event() {
            log::warn!("overlapped read: reset event failed: {e}");
        }
        let len = self.buf.len();
        let result = self.ops.start_read(&mut self.buf[..len]);
        self.started("read", result)
    }

    /// Copy `data` into the internal buffer and issue a write.
    pub fn queue_write(&mut self, data: &[u8]) -> IoState {
        if self.state != IoState::Initial {
            return self.state;
        }
        if let Err(e) = self.ops.reset_event() {
            log::warn!("overlapped write: reset event failed: {e}");
        }
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.size = data.len();
        let result = self.ops.start_write(&self.buf[..]);
        self.started("write", result)
    }

    fn started(&mut self, what: &str, result: io::Result<usize>) -> IoState {
        match result {
            Ok(n) => {
                self.size = n;
                self.status = None;
                self.signal(what);
                self.state = IoState::ImmediateReturn;
                log::trace!("overlapped {what}: immediate return [{n}]");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.status = None;
                self.state = IoState::Queued;
                log::trace!("overlapped {what}: queued");
            }
            Err(e) => {
                log::trace!("overlapped {what}: error {e}");
                self.status = Some(e);
                self.signal(what);
                self.state = IoState::ImmediateReturn;
            }
        }
        self.state
    }

    fn signal(&self, what: &str) {
        if let Err(e) = self.ops.set_event() {
            log::warn!("overlapped {what}: set event failed: {e}");
        }
    }

    fn rearm(&mut self) {
        self.state = IoState::Initial;
        if let Err(e) = self.ops.reset_event() {
            log::warn!("overlapped: reset event failed: {e}");
        }
    }

    /// Collect the result of the issued transfer and return to `Initial`.
    ///
    /// While a queued request is still running this returns `WouldBlock`
    /// and keeps the state. Calling it with nothing issued is an error.
    pub fn finalize(&mut self) -> io::Result<usize> {
        match self.state {
            IoState::Queued => match self.ops.overlapped_result() {
                Ok(n) => {
                    self.size = n;
                    self.rearm();
                    Ok(n)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
                Err(e) => {
                    self.size = 0;
                    self.rearm();
                    Err(e)
                }
            },
            IoState::ImmediateReturn => {
                self.rearm();
                match self.status.take() {
                    Some(e) => {
                        self.size = 0;
                        Err(e)
                    }
                    None => Ok(self.size),
                }
            }
            IoState::Initial => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "overlapped finalize called with no request issued",
            )),
        }
    }

    /// Cancel a pending request. The state returns to `Initial` unless the
    /// OS refused, in which case the request is still in flight.
    pub fn cancel(&mut self) -> io::Result<()> {
        if self.state == IoState::Queued {
            self.ops.cancel()?;
        }
        self.state = IoState::Initial;
        self.status = None;
        Ok(())
    }
}
