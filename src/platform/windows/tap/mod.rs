use crate::overlapped::{IoState, OverlappedIo};
use crate::platform::windows::ffi;
use crate::tap_protocol::*;
use overlapped::OwnedOVERLAPPED;
use std::io;
use std::net::Ipv4Addr;
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::sync::Arc;
use windows_sys::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_ATTRIBUTE_SYSTEM, FILE_FLAG_OVERLAPPED, OPEN_EXISTING,
};

mod overlapped;

/// An opened TAP-Windows adapter with its read and write state.
pub struct TapDevice {
    handle: Arc<OwnedHandle>,
    reads: OverlappedIo<OwnedOVERLAPPED>,
    writes: OverlappedIo<OwnedOVERLAPPED>,
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        log::debug!("Attempting close of overlapped events on TAP-Win32 adapter");
        if let Err(e) = self.reads.cancel() {
            log::warn!("Warning: cancelling the pending read failed: {e}");
        }
        if let Err(e) = self.writes.cancel() {
            log::warn!("Warning: cancelling the pending write failed: {e}");
        }
    }
}

impl TapDevice {
    /// Open `\\.\Global\{guid}.tap` exclusively, so an adapter used by
    /// another process fails to open.
    pub fn open(path: &str) -> io::Result<Self> {
        let handle = ffi::create_file(
            path,
            GENERIC_READ | GENERIC_WRITE,
            0,
            OPEN_EXISTING,
            FILE_ATTRIBUTE_SYSTEM | FILE_FLAG_OVERLAPPED,
        )?;
        let handle = Arc::new(handle);
        let reads = OverlappedIo::new(OwnedOVERLAPPED::new(handle.clone())?);
        let writes = OverlappedIo::new(OwnedOVERLAPPED::new(handle.clone())?);
        Ok(Self {
            handle,
            reads,
            writes,
        })
    }

    fn raw(&self) -> HANDLE {
        self.handle.as_raw_handle()
    }

    fn control(&self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<u32> {
        ffi::device_io_control(self.raw(), code, input, output)
    }

    /// Driver version, zero when the driver does not answer.
    pub fn version(&self) -> DriverVersion {
        let mut reply = [0u8; 12];
        if let Err(e) = self.control(TAP_IOCTL_GET_VERSION, &[0; 12], &mut reply) {
            log::debug!("TAP_IOCTL_GET_VERSION failed: {e}");
        }
        let mut words = [0u32; 3];
        for (word, chunk) in words.iter_mut().zip(reply.chunks_exact(4)) {
            *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        DriverVersion::from_reply(&words)
    }

    pub fn mtu(&self) -> io::Result<u32> {
        let mut reply = [0u8; 4];
        self.control(TAP_IOCTL_GET_MTU, &[0; 4], &mut reply)?;
        Ok(u32::from_ne_bytes(reply))
    }

    pub fn mac(&self) -> io::Result<[u8; 6]> {
        let mut mac = [0u8; 6];
        self.control(TAP_IOCTL_GET_MAC, &[], &mut mac)?;
        Ok(mac)
    }

    pub fn set_point_to_point(&self, local: Ipv4Addr, remote: Ipv4Addr) -> io::Result<()> {
        let mut ep = point_to_point_payload(local, remote);
        let input = ep;
        self.control(TAP_IOCTL_CONFIG_POINT_TO_POINT, &input, &mut ep)?;
        Ok(())
    }

    pub fn set_tun_subnet(&self, local: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()> {
        let mut ep = tun_subnet_payload(local, netmask);
        let input = ep;
        self.control(TAP_IOCTL_CONFIG_TUN, &input, &mut ep)?;
        Ok(())
    }

    pub fn set_dhcp_masq(&self, payload: [u8; 16]) -> io::Result<()> {
        let mut out = payload;
        self.control(TAP_IOCTL_CONFIG_DHCP_MASQ, &payload, &mut out)?;
        Ok(())
    }

    pub fn set_dhcp_options(&self, options: &[u8]) -> io::Result<()> {
        let mut out = options.to_vec();
        self.control(TAP_IOCTL_CONFIG_DHCP_SET_OPT, options, &mut out)?;
        Ok(())
    }

    /// Set the status of the interface, true for connected.
    pub fn set_status(&self, connected: bool) -> io::Result<()> {
        let status = media_status_payload(connected);
        let mut out = [0u8; 4];
        self.control(TAP_IOCTL_SET_MEDIA_STATUS, &status, &mut out)?;
        Ok(())
    }

    /// Free form status text of the driver.
    pub fn info(&self) -> io::Result<String> {
        let mut out = [0u8; INFO_BUFFER_SIZE];
        self.control(TAP_IOCTL_GET_INFO, &[0; INFO_BUFFER_SIZE], &mut out)?;
        Ok(reply_text(&out))
    }

    /// Next line of the driver debug log, `None` once drained.
    pub fn log_line(&self) -> Option<String> {
        let mut out = vec![0u8; LOG_LINE_BUFFER_SIZE];
        let input = out.clone();
        self.control(TAP_IOCTL_GET_LOG_LINE, &input, &mut out)
            .ok()
            .map(|_| reply_text(&out))
    }

    pub fn reads(&mut self) -> &mut OverlappedIo<OwnedOVERLAPPED> {
        &mut self.reads
    }

    pub fn writes(&mut self) -> &mut OverlappedIo<OwnedOVERLAPPED> {
        &mut self.writes
    }

    pub fn read_event(&self) -> HANDLE {
        self.reads.ops().event()
    }

    pub fn write_event(&self) -> HANDLE {
        self.writes.ops().event()
    }

    pub fn io_states(&self) -> (IoState, IoState) {
        (self.reads.state(), self.writes.state())
    }

    /// Read one packet. `WouldBlock` while the request is queued; wait on
    /// [`TapDevice::read_event`] and call again.
    pub fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reads.state() == IoState::Initial {
            self.reads.queue_read();
        }
        let len = self.reads.finalize()?;
        let data = &self.reads.buffer()[..len];
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Queue one packet. A queued write counts as written; its outcome is
    /// reported when the next write collects it.
    pub fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.writes.state() != IoState::Initial {
            self.writes.finalize()?;
        }
        match self.writes.queue_write(buf) {
            IoState::Queued => Ok(buf.len()),
            _ => self.writes.finalize(),
        }
    }

    pub fn cancel_io(&mut self) -> io::Result<()> {
        log::debug!("Attempting CancelIO on TAP-Win32 adapter");
        let reads = self.reads.cancel();
        let writes = self.writes.cancel();
        let handle = ffi::cancel_io(self.raw());
        reads.and(writes).and(handle)
    }
}
