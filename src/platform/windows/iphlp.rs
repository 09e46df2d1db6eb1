//! IP helper API queries and the address changes made through it.

use crate::adapter::AdapterInfo;
use crate::platform::windows::ffi::encode_utf16;
use std::io;
use std::net::Ipv4Addr;
use std::ptr;
use windows_sys::Win32::Foundation::{
    ERROR_BUFFER_OVERFLOW, ERROR_INSUFFICIENT_BUFFER, ERROR_NO_DATA, NO_ERROR,
};
use windows_sys::Win32::NetworkManagement::IpHelper::{
    AddIPAddress, DeleteIPAddress, FlushIpNetTable, GetAdapterIndex, GetAdaptersInfo,
    GetBestRoute, GetInterfaceInfo, GetPerAdapterInfo, IpReleaseAddress, IpRenewAddress,
    IP_ADAPTER_INDEX_MAP, IP_ADAPTER_INFO, IP_ADDR_STRING, IP_INTERFACE_INFO,
    IP_PER_ADAPTER_INFO_W2KSP1, MIB_IPFORWARDROW,
};

fn status(code: u32) -> io::Result<()> {
    if code == NO_ERROR {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(code as i32))
    }
}

/// Text of a fixed size C string field.
fn c_text(ptr: *const u8, len: usize) -> String {
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(len);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn addr_of(s: &IP_ADDR_STRING) -> (Ipv4Addr, Ipv4Addr) {
    let ip = c_text(s.IpAddress.String.as_ptr().cast(), s.IpAddress.String.len());
    let mask = c_text(s.IpMask.String.as_ptr().cast(), s.IpMask.String.len());
    (
        ip.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
        mask.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
    )
}

/// Every entry of an `IP_ADDR_STRING` chain.
fn addr_chain(first: &IP_ADDR_STRING) -> impl Iterator<Item = &IP_ADDR_STRING> {
    let mut next: *const IP_ADDR_STRING = first;
    std::iter::from_fn(move || {
        if next.is_null() {
            return None;
        }
        let entry = unsafe { &*next };
        next = entry.Next;
        Some(entry)
    })
}

/// Network order `u32` the IP helper API expects.
fn net_order(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

fn from_net_order(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(addr.to_ne_bytes())
}

/// Buffer filled by a size-probing IP helper call, 8-byte aligned.
fn probe_buffer<F>(overflow: u32, mut call: F) -> io::Result<Vec<u64>>
where
    F: FnMut(*mut u64, &mut u32) -> u32,
{
    let mut size = 0u32;
    match call(ptr::null_mut(), &mut size) {
        code if code == overflow => {}
        ERROR_NO_DATA => return Ok(Vec::new()),
        code => return Err(io::Error::from_raw_os_error(code as i32)),
    }
    let mut buf = vec![0u64; (size as usize).div_ceil(8)];
    status(call(buf.as_mut_ptr(), &mut size))?;
    Ok(buf)
}

/// Raw `GetAdaptersInfo` list.
struct AdapterList {
    buf: Vec<u64>,
}

impl AdapterList {
    fn query() -> io::Result<Self> {
        let buf = probe_buffer(ERROR_BUFFER_OVERFLOW, |p, size| unsafe {
            GetAdaptersInfo(p.cast(), size)
        })?;
        Ok(Self { buf })
    }

    fn iter(&self) -> impl Iterator<Item = &IP_ADAPTER_INFO> {
        let mut next: *const IP_ADAPTER_INFO = if self.buf.is_empty() {
            ptr::null()
        } else {
            self.buf.as_ptr().cast()
        };
        std::iter::from_fn(move || {
            if next.is_null() {
                return None;
            }
            let entry = unsafe { &*next };
            next = entry.Next;
            Some(entry)
        })
    }

    fn find(&self, index: u32) -> Option<&IP_ADAPTER_INFO> {
        self.iter().find(|a| a.Index == index)
    }
}

fn adapter_info(a: &IP_ADAPTER_INFO) -> AdapterInfo {
    AdapterInfo {
        index: a.Index,
        name: c_text(a.AdapterName.as_ptr().cast(), a.AdapterName.len()),
        dhcp_enabled: a.DhcpEnabled != 0,
        addresses: addr_chain(&a.IpAddressList).map(addr_of).collect(),
        wins: (a.HaveWins != 0)
            .then(|| (addr_of(&a.PrimaryWinsServer).0, addr_of(&a.SecondaryWinsServer).0)),
    }
}

/// Snapshot of every adapter. Failures are logged and give an empty list.
pub fn adapter_info_list() -> Vec<AdapterInfo> {
    match AdapterList::query() {
        Ok(list) => list.iter().map(adapter_info).collect(),
        Err(e) => {
            log::info!("GetAdaptersInfo failed: {e}");
            Vec::new()
        }
    }
}

/// DNS servers configured on the adapter.
pub fn adapter_dns_servers(index: u32) -> Vec<Ipv4Addr> {
    let buf = match probe_buffer(ERROR_BUFFER_OVERFLOW, |p, size| unsafe {
        GetPerAdapterInfo(index, p.cast(), size)
    }) {
        Ok(buf) if !buf.is_empty() => buf,
        Ok(_) => return Vec::new(),
        Err(e) => {
            log::info!("GetPerAdapterInfo failed: {e}");
            return Vec::new();
        }
    };
    let info = unsafe { &*(buf.as_ptr() as *const IP_PER_ADAPTER_INFO_W2KSP1) };
    addr_chain(&info.DnsServerList)
        .map(|s| addr_of(s).0)
        .filter(|ip| !ip.is_unspecified())
        .collect()
}

/// Index of the adapter named `\DEVICE\TCPIP_<guid>`, falling back to the
/// adapter list.
pub fn adapter_index(guid: &str) -> Option<u32> {
    let by_name = encode_utf16(&format!("\\DEVICE\\TCPIP_{guid}")).ok().and_then(|name| {
        let mut index = 0u32;
        let code = unsafe { GetAdapterIndex(name.as_ptr(), &mut index) };
        (code == NO_ERROR).then_some(index)
    });
    by_name.or_else(|| {
        crate::adapter::find_by_name(&adapter_info_list(), guid).map(|a| a.index)
    })
}

fn interface_map(index: u32) -> io::Result<Option<IP_ADAPTER_INDEX_MAP>> {
    let buf = probe_buffer(ERROR_INSUFFICIENT_BUFFER, |p, size| unsafe {
        GetInterfaceInfo(p.cast(), size)
    })?;
    if buf.is_empty() {
        return Ok(None);
    }
    let info = buf.as_ptr() as *const IP_INTERFACE_INFO;
    let count = unsafe { (*info).NumAdapters }.max(0) as usize;
    let first = unsafe { ptr::addr_of!((*info).Adapter) } as *const IP_ADAPTER_INDEX_MAP;
    Ok((0..count)
        .map(|i| unsafe { *first.add(i) })
        .find(|map| map.Index == index))
}

fn with_interface(index: u32, f: impl FnOnce(&IP_ADAPTER_INDEX_MAP) -> u32) -> io::Result<()> {
    match interface_map(index)? {
        Some(map) => status(f(&map)),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no interface with index {index}"),
        )),
    }
}

pub fn release_dhcp(index: u32) -> io::Result<()> {
    with_interface(index, |map| unsafe { IpReleaseAddress(map) })
}

pub fn renew_dhcp(index: u32) -> io::Result<()> {
    with_interface(index, |map| unsafe { IpRenewAddress(map) })
}

pub fn flush_arp(index: u32) -> io::Result<()> {
    status(unsafe { FlushIpNetTable(index) })
}

/// Add a temporary address, returns its context for [`delete_ip_address`].
pub fn add_ip_address(ip: Ipv4Addr, netmask: Ipv4Addr, index: u32) -> io::Result<u32> {
    let mut context = 0u32;
    let mut instance = 0u32;
    status(unsafe {
        AddIPAddress(
            net_order(ip),
            net_order(netmask),
            index,
            &mut context,
            &mut instance,
        )
    })?;
    Ok(context)
}

pub fn delete_ip_address(context: u32) -> io::Result<()> {
    status(unsafe { DeleteIPAddress(context) })
}

/// Remove addresses left behind by an earlier [`add_ip_address`].
pub fn delete_temp_addresses(index: u32) {
    let list = match AdapterList::query() {
        Ok(list) => list,
        Err(e) => {
            log::info!("GetAdaptersInfo failed: {e}");
            return;
        }
    };
    let Some(adapter) = list.find(index) else {
        return;
    };
    for entry in addr_chain(&adapter.IpAddressList) {
        let (ip, mask) = addr_of(entry);
        match delete_ip_address(entry.Context) {
            Ok(()) => log::info!("Successfully deleted previously set dynamic IP/netmask: {ip}/{mask}"),
            Err(e) if !(ip.is_unspecified() && mask.is_unspecified()) => log::info!(
                "NOTE: could not delete previously set dynamic IP/netmask: {ip}/{mask} ({e})"
            ),
            Err(_) => {}
        }
    }
}

/// Interface index and next hop of the route to `0.0.0.0`.
pub fn best_route_to_any() -> io::Result<Option<(u32, Ipv4Addr)>> {
    let mut row: MIB_IPFORWARDROW = unsafe { std::mem::zeroed() };
    status(unsafe { GetBestRoute(0, 0, &mut row) })?;
    let gateway = from_net_order(row.dwForwardNextHop);
    Ok((!gateway.is_unspecified()).then_some((row.dwForwardIfIndex, gateway)))
}
