//! TAP-Windows adapters: registry discovery, `DeviceIoControl`
//! configuration and overlapped I/O.

pub(crate) mod ffi;
pub(crate) mod iphlp;
pub(crate) mod registry;
mod tap;

pub use tap::TapDevice;

use crate::adapter::{self, AdapterRegistry, DhcpStatus, ResolvedAdapter};
use crate::dhcp;
use crate::error::{Error, Result};
use crate::netsh::{AdapterState, Netsh, NetshFlags};
use crate::options::IpAssignMethod;
use crate::platform::{Addressing, Backend, DeviceContext};
use crate::tap_protocol::{device_path, DriverVersion};
use crate::validate::{self, DeviceKind, Topology};
use scopeguard::{guard, ScopeGuard};
use std::io;
use std::net::Ipv4Addr;

/// Adaptive assignment falls back to netsh after this many standby polls
/// and gives up after twice as many.
pub const ADAPTIVE_TRY_NETSH: u32 = 20;

const IPAPI_HINT: &str = "I am having trouble using the Windows 'IP helper API' to \
                          automatically set the IP address -- consider using other IP \
                          assignment methods (not 'ipapi')";

fn fatal(e: Error) -> Error {
    log::error!("{e}");
    e
}

fn driver_error(request: &'static str, source: io::Error) -> Error {
    fatal(Error::Driver { request, source })
}

#[derive(Default)]
pub struct WindowsBackend {
    tap: Option<TapDevice>,
    guid: String,
    adapter_index: Option<u32>,
    /// Netmask given to the adapter itself; a /30 for point-to-point tun.
    adapter_netmask: Option<Ipv4Addr>,
    post_open_mtu: Option<u32>,
    version: Option<DriverVersion>,
    ipapi_context: Option<u32>,
}

impl std::fmt::Debug for WindowsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsBackend")
            .field("open", &self.tap.is_some())
            .field("guid", &self.guid)
            .field("adapter_index", &self.adapter_index)
            .field("adapter_netmask", &self.adapter_netmask)
            .finish()
    }
}

impl WindowsBackend {
    /// IP helper index of the adapter, `None` when it could not be found.
    pub fn adapter_index(&self) -> Option<u32> {
        self.adapter_index
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// MTU the driver reported right after opening.
    pub fn post_open_mtu(&self) -> Option<u32> {
        self.post_open_mtu
    }

    pub fn driver_version(&self) -> Option<DriverVersion> {
        self.version
    }

    /// The opened adapter, for issuing and completing overlapped I/O and
    /// waiting on its events.
    pub fn tap(&mut self) -> Option<&mut TapDevice> {
        self.tap.as_mut()
    }

    /// Driver status text.
    pub fn info(&self) -> Option<String> {
        self.tap.as_ref().and_then(|tap| tap.info().ok())
    }

    /// Drain the driver debug log into our log.
    pub fn show_debug(&self) {
        if let Some(tap) = &self.tap {
            while let Some(line) = tap.log_line() {
                log::debug!("TAP-Win32: {line}");
            }
        }
    }

    fn forget_adapter(&mut self) {
        self.guid.clear();
        self.adapter_index = None;
        self.adapter_netmask = None;
        self.post_open_mtu = None;
        self.version = None;
        self.ipapi_context = None;
    }

    /// Probe or resolve the adapter and open it.
    fn open_adapter(
        &self,
        registry: &AdapterRegistry,
        node: Option<&str>,
    ) -> Result<(TapDevice, ResolvedAdapter, String)> {
        registry.require_adapters()?;
        if let Some(node) = node {
            let adapter = registry.device_guid(node).ok_or_else(|| {
                fatal(Error::Adapter(format!("TAP-Win32 adapter '{node}' not found")))
            })?;
            let path = device_path(&adapter.guid);
            let tap = TapDevice::open(&path).map_err(|source| {
                fatal(Error::Open {
                    path: path.clone(),
                    source,
                })
            })?;
            return Ok((tap, adapter, path));
        }
        let mut n = 0;
        loop {
            let Some(adapter) = registry.unspecified_device_guid(n) else {
                return Err(fatal(Error::Exhausted(
                    "All TAP-Win32 adapters on this system are currently in use".into(),
                )));
            };
            let path = device_path(&adapter.guid);
            match TapDevice::open(&path) {
                Ok(tap) => return Ok((tap, adapter, path)),
                Err(e) => log::info!("CreateFile failed on TAP device: {path}: {e}"),
            }
            n += 1;
        }
    }

    fn assign_address(
        &mut self,
        ctx: &DeviceContext<'_>,
        actual_name: &str,
        addr: &Addressing,
    ) -> Result<()> {
        match ctx.options.ip_assign() {
            IpAssignMethod::Manual => {
                let netmask = self.adapter_netmask.unwrap_or(addr.remote_netmask);
                log::info!(
                    "******** NOTE:  Please manually set the IP/netmask of '{actual_name}' to \
                     {}/{netmask} (if it is not already set)",
                    addr.local
                );
                Ok(())
            }
            IpAssignMethod::Netsh => self.netsh_ifconfig(
                ctx,
                actual_name,
                NetshFlags {
                    test_first: false,
                    ip_netmask: true,
                    options: true,
                },
            ),
            _ => Ok(()),
        }
    }

    /// Apply address and name servers with netsh.
    fn netsh_ifconfig(
        &self,
        ctx: &DeviceContext<'_>,
        actual_name: &str,
        flags: NetshFlags,
    ) -> Result<()> {
        let (Some(addr), Some(netmask)) = (ctx.addresses, self.adapter_netmask) else {
            return Ok(());
        };
        let state = if flags.test_first {
            adapter_state(actual_name)
        } else {
            None
        };
        let dhcp = ctx.options.dhcp();
        let steps = crate::netsh::plan_ifconfig(
            actual_name,
            addr.local,
            netmask,
            &dhcp.dns,
            &dhcp.wins,
            state.as_ref(),
            flags,
        );
        Netsh::new(ctx.commands.clone()).run(&steps)
    }

    fn dhcp_status(&self) -> DhcpStatus {
        adapter::dhcp_status(&iphlp::adapter_info_list(), self.adapter_index)
    }

    fn dhcp_release(&self) {
        let Some(index) = self.adapter_index else {
            return;
        };
        match iphlp::release_dhcp(index) {
            Ok(()) => log::info!("TAP: DHCP address released"),
            Err(e) => log::warn!(
                "NOTE: Release of DHCP-assigned IP address lease on TAP-Win32 adapter failed: {e}"
            ),
        }
    }

    fn dhcp_renew(&self) {
        let Some(index) = self.adapter_index else {
            return;
        };
        match iphlp::renew_dhcp(index) {
            Ok(()) => log::info!("TAP: DHCP address renewal succeeded"),
            Err(e) => log::warn!(
                "WARNING: Failed to renew DHCP IP address lease on TAP-Win32 adapter: {e}"
            ),
        }
    }

    /// Driver side of the tun emulation.
    fn configure_tun(&self, tap: &TapDevice, ctx: &DeviceContext<'_>) -> Result<()> {
        let Some(addr) = ctx.addresses else {
            return Err(fatal(Error::Config(
                "a tun device on Windows also requires ifconfig parameters".into(),
            )));
        };
        if ctx.topology == Topology::Subnet {
            let netmask = addr.remote_netmask;
            let network = Ipv4Addr::from(u32::from(addr.local) & u32::from(netmask));
            let result = tap.set_tun_subnet(addr.local, netmask);
            let status = if result.is_ok() { "SUCCEEDED" } else { "FAILED" };
            log::info!(
                "Set TAP-Win32 TUN subnet mode network/local/netmask = {network}/{}/{netmask} [{status}]",
                addr.local
            );
            result.map_err(|e| driver_error("TAP_IOCTL_CONFIG_TUN", e))
        } else {
            tap.set_point_to_point(addr.local, addr.remote_netmask)
                .map_err(|e| driver_error("TAP_IOCTL_CONFIG_POINT_TO_POINT", e))
        }
    }

    /// Let the driver answer DHCP requests with our address.
    fn configure_dhcp_masq(&self, tap: &TapDevice, ctx: &DeviceContext<'_>) -> Result<()> {
        let (Some(addr), Some(netmask)) = (ctx.addresses, self.adapter_netmask) else {
            return Ok(());
        };
        let options = ctx.options;
        let server = dhcp::masquerade_server(
            ctx.kind,
            ctx.topology,
            addr.local,
            addr.remote_netmask,
            netmask,
            options.dhcp_masq_offset(),
            options.dhcp_masq_custom_offset(),
        )?;
        let lease = u32::try_from(options.dhcp_lease_time().as_secs()).unwrap_or(u32::MAX);
        tap.set_dhcp_masq(crate::tap_protocol::dhcp_masq_payload(
            addr.local, netmask, server, lease,
        ))
        .map_err(|e| driver_error("TAP_IOCTL_CONFIG_DHCP_MASQ", e))?;
        log::info!(
            "Notified TAP-Win32 driver to set a DHCP IP/netmask of {}/{netmask} on interface {} \
             [DHCP-serv: {server}, lease-time: {lease}]",
            addr.local,
            self.guid
        );

        if options.dhcp().is_set() {
            match dhcp::build_dhcp_options(options.dhcp()) {
                Ok(stream) => {
                    log::debug!("DHCP option string: {}", hex(&stream));
                    tap.set_dhcp_options(&stream)
                        .map_err(|e| driver_error("TAP_IOCTL_CONFIG_DHCP_SET_OPT", e))?;
                }
                Err(_) => log::warn!("DHCP option string not set due to error"),
            }
        }
        Ok(())
    }

    /// Set a temporary address through the IP helper API.
    fn configure_ipapi(&mut self, ctx: &DeviceContext<'_>) -> Result<()> {
        let (Some(addr), Some(netmask)) = (ctx.addresses, self.adapter_netmask) else {
            return Ok(());
        };
        let Some(index) = self.adapter_index else {
            return Err(fatal(Error::Adapter(format!(
                "unable to get adapter index for interface {} -- {IPAPI_HINT}",
                self.guid
            ))));
        };
        if self.dhcp_status() == DhcpStatus::Disabled {
            log::warn!(
                "NOTE: You have selected 'ipapi' IP assignment, which has a better chance of \
                 working correctly if the TAP-Win32 TCP/IP properties are set to 'Obtain an IP \
                 address automatically'"
            );
        }
        iphlp::delete_temp_addresses(index);
        match iphlp::add_ip_address(addr.local, netmask, index) {
            Ok(context) => {
                log::info!(
                    "Succeeded in adding a temporary IP/netmask of {}/{netmask} to interface {} \
                     using the Win32 IP Helper API",
                    addr.local,
                    self.guid
                );
                self.ipapi_context = Some(context);
                Ok(())
            }
            Err(e) => Err(fatal(Error::Adapter(format!(
                "AddIPAddress {}/{netmask} failed on interface {}, index={index}: {e} -- {IPAPI_HINT}",
                addr.local, self.guid
            )))),
        }
    }
}

/// Netmask the adapter gets for the computed addresses.
pub(crate) fn adapter_netmask(ctx: &DeviceContext<'_>) -> Result<Option<Ipv4Addr>> {
    let Some(addr) = ctx.addresses else {
        return Ok(None);
    };
    if ctx.kind == DeviceKind::Tun && addr.point_to_point {
        validate::verify_tight_point_to_point(addr.local, addr.remote_netmask)?;
        Ok(Some(Ipv4Addr::new(255, 255, 255, 252)))
    } else {
        Ok(Some(addr.remote_netmask))
    }
}

/// Live address and name servers of the adapter called `name`.
fn adapter_state(name: &str) -> Option<AdapterState> {
    let index = adapter_index_flexible(name)?;
    let list = iphlp::adapter_info_list();
    let info = adapter::find_by_index(&list, index)?;
    Some(AdapterState {
        address: info.first_address(),
        dns: iphlp::adapter_dns_servers(index),
        wins: info
            .wins
            .map(|(primary, secondary)| {
                [primary, secondary]
                    .into_iter()
                    .filter(|ip| !ip.is_unspecified())
                    .collect()
            })
            .unwrap_or_default(),
    })
}

/// Index of an adapter given by GUID or by connection name.
pub fn adapter_index_flexible(name: &str) -> Option<u32> {
    let index = iphlp::adapter_index(name).or_else(|| {
        let registry = registry::snapshot().ok()?;
        let guid = registry.name_to_guid(name)?;
        iphlp::adapter_index(guid)
    });
    if index.is_none() {
        log::info!("NOTE: could not get adapter index for name/GUID '{name}'");
    }
    index
}

/// Name netsh should use for the adapter selected by `node`.
pub fn netsh_id(node: Option<&str>) -> Result<String> {
    registry::snapshot()?.netsh_id(node)
}

/// Log every TAP adapter and the registry inconsistencies found.
pub fn show_adapters() -> Result<()> {
    registry::snapshot()?.diagnose().log();
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Backend for WindowsBackend {
    fn ipv6_supported(&self) -> bool {
        false
    }

    fn open(&mut self, ctx: &DeviceContext<'_>, name: &str, node: Option<&str>) -> Result<String> {
        if !matches!(ctx.kind, DeviceKind::Tun | DeviceKind::Tap) {
            return Err(fatal(Error::Config(format!(
                "Unknown virtual device type: '{name}'"
            ))));
        }
        let netmask = adapter_netmask(ctx)?;
        let registry = registry::snapshot()?;
        let (tap, adapter, path) = self.open_adapter(&registry, node)?;
        // Any failure below leaves the backend as if nothing was opened.
        let mut this = guard(self, |this| this.forget_adapter());
        log::info!("TAP-WIN32 device [{}] opened: {path}", adapter.actual_name);

        this.guid = adapter.guid.clone();
        this.adapter_netmask = netmask;
        this.adapter_index = iphlp::adapter_index(&adapter.guid);
        if this.adapter_index.is_none() {
            log::info!("NOTE: could not get adapter index for {}", adapter.guid);
        }

        let version = tap.version();
        log::info!("TAP-Win32 Driver Version {version}");
        version.check()?;
        this.version = Some(version);

        if let Ok(mtu) = tap.mtu() {
            log::debug!("TAP-Win32 MTU={mtu}");
            this.post_open_mtu = Some(mtu);
        }

        let options = ctx.options;
        let method = options.ip_assign();
        let mut dhcp_masq = false;
        let mut dhcp_masq_post = false;
        if ctx.addresses.is_some() {
            match method {
                IpAssignMethod::DhcpMasquerade => {
                    if this.dhcp_status() == DhcpStatus::Disabled {
                        Netsh::new(ctx.commands.clone()).enable_dhcp(&adapter.actual_name)?;
                    }
                    dhcp_masq = true;
                    dhcp_masq_post = true;
                }
                IpAssignMethod::Adaptive => {
                    if this.dhcp_status() != DhcpStatus::Enabled {
                        this.netsh_ifconfig(
                            ctx,
                            &adapter.actual_name,
                            NetshFlags {
                                test_first: true,
                                ip_netmask: true,
                                options: true,
                            },
                        )?;
                    } else {
                        dhcp_masq = true;
                    }
                }
                _ => {}
            }
        }

        if ctx.kind == DeviceKind::Tun {
            this.configure_tun(&tap, ctx)?;
        }
        if dhcp_masq {
            this.configure_dhcp_masq(&tap, ctx)?;
        }

        if tap.set_status(true).is_err() {
            log::warn!(
                "WARNING: The TAP-Win32 driver rejected a TAP_IOCTL_SET_MEDIA_STATUS \
                 DeviceIoControl call."
            );
        }

        let sleep = options.tap_sleep();
        if !sleep.is_zero() {
            log::info!("Sleeping for {} seconds...", sleep.as_secs());
            std::thread::sleep(sleep);
        }

        if let Some(index) = this.adapter_index {
            match iphlp::flush_arp(index) {
                Ok(()) => log::info!("Successful ARP Flush on interface [{index}] {}", this.guid),
                Err(e) => log::debug!(
                    "NOTE: FlushIpNetTable failed on interface [{index}] {}: {e}",
                    this.guid
                ),
            }
        }

        if dhcp_masq_post && this.dhcp_status() == DhcpStatus::Disabled {
            log::warn!(
                "WARNING: You have selected 'dynamic' IP assignment, which will not work \
                 unless the TAP-Win32 TCP/IP properties are set to 'Obtain an IP address \
                 automatically'"
            );
        }
        if options.dhcp_pre_release() {
            this.dhcp_release();
        }
        if options.dhcp_renew() {
            this.dhcp_renew();
        }

        if method == IpAssignMethod::IpApi {
            this.configure_ipapi(ctx)?;
        }

        let this = ScopeGuard::into_inner(this);
        this.tap = Some(tap);
        Ok(adapter.actual_name)
    }

    fn is_open(&self) -> bool {
        self.tap.is_some()
    }

    fn configure_address(&mut self, ctx: &DeviceContext<'_>, actual_name: &str) -> Result<()> {
        if let Some(addr) = ctx.addresses {
            self.assign_address(ctx, actual_name, addr)?;
        }
        if ctx.options.register_dns() {
            if let Err(e) = Netsh::new(ctx.commands.clone()).register_dns_in_background() {
                log::warn!("WARNING: could not start DNS registration: {e}");
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.tap {
            Some(tap) => tap.try_read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.tap {
            Some(tap) => tap.try_write(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn close(&mut self, ctx: &DeviceContext<'_>, _actual_name: &str, _configured: bool) {
        if let Some(context) = self.ipapi_context.take() {
            if let Err(e) = iphlp::delete_ip_address(context) {
                log::warn!("Warning: DeleteIPAddress[{context}] failed on TAP-Win32 adapter: {e}");
            }
        }
        if ctx.options.releases_lease_on_close() {
            self.dhcp_release();
        }
        if let Some(mut tap) = self.tap.take() {
            if let Err(e) = tap.cancel_io() {
                log::warn!("Warning: CancelIO failed on TAP-Win32 adapter: {e}");
            }
        }
        self.forget_adapter();
    }

    /// Adaptive assignment: after [`ADAPTIVE_TRY_NETSH`] polls without an
    /// address try netsh, after twice as many give up.
    fn standby(&mut self, ctx: &DeviceContext<'_>, actual_name: &str, iteration: u32) -> Result<bool> {
        if ctx.options.ip_assign() != IpAssignMethod::Adaptive {
            return Ok(true);
        }
        if iteration == ADAPTIVE_TRY_NETSH {
            log::info!("NOTE: now trying netsh (this may take some time)");
            self.netsh_ifconfig(
                ctx,
                actual_name,
                NetshFlags {
                    test_first: true,
                    ip_netmask: true,
                    options: true,
                },
            )?;
            Ok(true)
        } else {
            Ok(iteration < ADAPTIVE_TRY_NETSH * 2)
        }
    }

    /// Has the adapter picked up its address yet?
    fn is_up(&self, ctx: &DeviceContext<'_>) -> bool {
        let expected = match (ctx.addresses, self.adapter_netmask) {
            (Some(addr), Some(netmask)) => Some((addr.local, netmask)),
            _ => None,
        };
        adapter::is_adapter_up(&iphlp::adapter_info_list(), self.adapter_index, expected)
    }
}
