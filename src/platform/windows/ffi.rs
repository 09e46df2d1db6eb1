use std::io;
use std::os::windows::io::{FromRawHandle, OwnedHandle};
use std::ptr;
use widestring::U16CString;
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_IO_INCOMPLETE, ERROR_IO_PENDING, ERROR_NOT_FOUND, FALSE, HANDLE,
    INVALID_HANDLE_VALUE, TRUE,
};
use windows_sys::Win32::Storage::FileSystem::{CreateFileW, ReadFile, WriteFile};
use windows_sys::Win32::System::Threading::{CreateEventW, ResetEvent, SetEvent};
use windows_sys::Win32::System::IO::{
    CancelIoEx, DeviceIoControl, GetOverlappedResult, OVERLAPPED,
};

pub fn encode_utf16(string: &str) -> io::Result<U16CString> {
    U16CString::from_str(string).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

pub fn create_file(
    file_name: &str,
    desired_access: u32,
    share_mode: u32,
    creation_disposition: u32,
    flags_and_attributes: u32,
) -> io::Result<OwnedHandle> {
    let file_name = encode_utf16(file_name)?;
    let handle = unsafe {
        CreateFileW(
            file_name.as_ptr(),
            desired_access,
            share_mode,
            ptr::null(),
            creation_disposition,
            flags_and_attributes,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedHandle::from_raw_handle(handle) })
    }
}

/// Synchronous `DeviceIoControl`, returns the number of bytes written to
/// `output`.
pub fn device_io_control(
    handle: HANDLE,
    io_control_code: u32,
    input: &[u8],
    output: &mut [u8],
) -> io::Result<u32> {
    let mut ret_size = 0;
    let ok = unsafe {
        DeviceIoControl(
            handle,
            io_control_code,
            input.as_ptr().cast(),
            input.len() as u32,
            output.as_mut_ptr().cast(),
            output.len() as u32,
            &mut ret_size,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret_size)
    }
}

/// Manual reset event, initially signaled.
pub fn create_event() -> io::Result<OwnedHandle> {
    let handle = unsafe { CreateEventW(ptr::null(), TRUE, TRUE, ptr::null()) };
    if handle.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedHandle::from_raw_handle(handle) })
    }
}

pub fn set_event(handle: HANDLE) -> io::Result<()> {
    if unsafe { SetEvent(handle) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn reset_event(handle: HANDLE) -> io::Result<()> {
    if unsafe { ResetEvent(handle) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn io_overlapped() -> OVERLAPPED {
    unsafe { std::mem::zeroed() }
}

/// `ERROR_IO_PENDING` and `ERROR_IO_INCOMPLETE` become `WouldBlock`.
fn pending_as_would_block() -> io::Error {
    let code = unsafe { GetLastError() };
    if code == ERROR_IO_PENDING || code == ERROR_IO_INCOMPLETE {
        io::ErrorKind::WouldBlock.into()
    } else {
        io::Error::from_raw_os_error(code as i32)
    }
}

pub fn try_read_file(
    handle: HANDLE,
    overlapped: &mut OVERLAPPED,
    buf: &mut [u8],
) -> io::Result<u32> {
    let mut read_size = 0;
    let ok = unsafe {
        ReadFile(
            handle,
            buf.as_mut_ptr(),
            buf.len() as u32,
            &mut read_size,
            overlapped,
        )
    };
    if ok == 0 {
        Err(pending_as_would_block())
    } else {
        Ok(read_size)
    }
}

pub fn try_write_file(handle: HANDLE, overlapped: &mut OVERLAPPED, buf: &[u8]) -> io::Result<u32> {
    let mut write_size = 0;
    let ok = unsafe {
        WriteFile(
            handle,
            buf.as_ptr(),
            buf.len() as u32,
            &mut write_size,
            overlapped,
        )
    };
    if ok == 0 {
        Err(pending_as_would_block())
    } else {
        Ok(write_size)
    }
}

/// Result of an issued request, `WouldBlock` while it is still running.
pub fn try_io_overlapped(handle: HANDLE, overlapped: &OVERLAPPED) -> io::Result<u32> {
    let mut size = 0;
    let ok = unsafe { GetOverlappedResult(handle, overlapped, &mut size, FALSE) };
    if ok == 0 {
        Err(pending_as_would_block())
    } else {
        Ok(size)
    }
}

/// Cancel the request and wait until the driver let go of its buffer.
pub fn cancel_io_overlapped(handle: HANDLE, overlapped: &OVERLAPPED) -> io::Result<()> {
    if unsafe { CancelIoEx(handle, overlapped) } == 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(ERROR_NOT_FOUND as i32) {
            return Ok(());
        }
        return Err(e);
    }
    let mut size = 0;
    unsafe { GetOverlappedResult(handle, overlapped, &mut size, TRUE) };
    Ok(())
}

/// Cancel every request issued on `handle` by this thread.
pub fn cancel_io(handle: HANDLE) -> io::Result<()> {
    if unsafe { windows_sys::Win32::System::IO::CancelIo(handle) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
