use crate::overlapped::OverlappedOps;
use crate::platform::windows::ffi;
use std::io;
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::sync::Arc;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::IO::OVERLAPPED;

/// One direction of overlapped I/O on the adapter handle.
pub struct OwnedOVERLAPPED {
    file_handle: Arc<OwnedHandle>,
    event_handle: OwnedHandle,
    overlapped: Box<OVERLAPPED>,
}

impl OwnedOVERLAPPED {
    pub fn new(file_handle: Arc<OwnedHandle>) -> io::Result<OwnedOVERLAPPED> {
        let event_handle = ffi::create_event()?;
        let mut overlapped = Box::new(ffi::io_overlapped());
        overlapped.hEvent = event_handle.as_raw_handle();
        Ok(Self {
            file_handle,
            event_handle,
            overlapped,
        })
    }

    /// Completion event for the caller's wait loop.
    pub fn event(&self) -> HANDLE {
        self.event_handle.as_raw_handle()
    }

    fn file(&self) -> HANDLE {
        self.file_handle.as_raw_handle()
    }
}

impl OverlappedOps for OwnedOVERLAPPED {
    fn reset_event(&self) -> io::Result<()> {
        ffi::reset_event(self.event())
    }

    fn set_event(&self) -> io::Result<()> {
        ffi::set_event(self.event())
    }

    fn start_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file();
        ffi::try_read_file(file, &mut self.overlapped, buf).map(|n| n as usize)
    }

    fn start_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self.file();
        ffi::try_write_file(file, &mut self.overlapped, buf).map(|n| n as usize)
    }

    fn overlapped_result(&mut self) -> io::Result<usize> {
        ffi::try_io_overlapped(self.file(), &self.overlapped).map(|n| n as usize)
    }

    fn cancel(&mut self) -> io::Result<()> {
        ffi::cancel_io_overlapped(self.file(), &self.overlapped)
    }
}
