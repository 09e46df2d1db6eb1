//! Immutable per-device options.

use crate::error::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

/// Lease handed out by the DHCP masquerade server when nothing else is set.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(31_536_000);
pub const MIN_LEASE_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_TXQUEUELEN: u32 = 100;
/// Most entries accepted per DHCP server list.
pub const MAX_DHCP_ADDRS: usize = 4;

/// How a Windows adapter gets its address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IpAssignMethod {
    /// Print instructions, touch nothing.
    Manual,
    /// Run `netsh interface ip set address`.
    Netsh,
    /// Add a temporary address through the IP helper API.
    IpApi,
    /// The driver answers DHCP requests itself.
    DhcpMasquerade,
    /// Netsh while the adapter is not in DHCP mode, masquerade otherwise.
    #[default]
    Adaptive,
}

impl IpAssignMethod {
    pub const ALL: [IpAssignMethod; 5] = [
        IpAssignMethod::Manual,
        IpAssignMethod::Netsh,
        IpAssignMethod::IpApi,
        IpAssignMethod::DhcpMasquerade,
        IpAssignMethod::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IpAssignMethod::Manual => "manual",
            IpAssignMethod::Netsh => "netsh",
            IpAssignMethod::IpApi => "ipapi",
            IpAssignMethod::DhcpMasquerade => "dynamic",
            IpAssignMethod::Adaptive => "adaptive",
        }
    }

    /// Whether the driver's DHCP server hands out the address, right away
    /// or as the first adaptive attempt.
    pub fn uses_masquerade(&self) -> bool {
        matches!(self, IpAssignMethod::DhcpMasquerade | IpAssignMethod::Adaptive)
    }

    /// All method names in brackets, for help output.
    pub fn names() -> String {
        Self::ALL
            .iter()
            .map(|m| format!("[{}]", m.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for IpAssignMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpAssignMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                Error::Config(format!(
                    "bad ip assignment method '{s}', must be one of: {}",
                    Self::names()
                ))
            })
    }
}

/// NetBIOS node type carried in DHCP option 46.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetbiosNodeType {
    Broadcast = 1,
    PeerToPeer = 2,
    Mixed = 4,
    Hybrid = 8,
}

impl TryFrom<u8> for NetbiosNodeType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(NetbiosNodeType::Broadcast),
            2 => Ok(NetbiosNodeType::PeerToPeer),
            4 => Ok(NetbiosNodeType::Mixed),
            8 => Ok(NetbiosNodeType::Hybrid),
            other => Err(Error::Config(format!(
                "NetBIOS node type {other} must be one of 1, 2, 4 or 8"
            ))),
        }
    }
}

/// DHCP options pushed to the adapter by the masquerade server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DhcpOptionSet {
    pub domain: Option<String>,
    pub netbios_scope: Option<String>,
    pub netbios_node_type: Option<NetbiosNodeType>,
    pub dns: Vec<Ipv4Addr>,
    pub wins: Vec<Ipv4Addr>,
    pub ntp: Vec<Ipv4Addr>,
    pub nbdd: Vec<Ipv4Addr>,
    pub disable_nbt: bool,
}

impl DhcpOptionSet {
    /// True when at least one option would be sent.
    pub fn is_set(&self) -> bool {
        self.domain.is_some()
            || self.netbios_scope.is_some()
            || self.netbios_node_type.is_some()
            || !self.dns.is_empty()
            || !self.wins.is_empty()
            || !self.ntp.is_empty()
            || !self.nbdd.is_empty()
            || self.disable_nbt
    }
}

/// Options of one device. Built once with [`TunTapOptions::builder`] and
/// never changed afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunTapOptions {
    ip_assign: IpAssignMethod,
    dhcp_masq_offset: Option<i32>,
    dhcp_lease_time: Duration,
    dhcp_renew: bool,
    dhcp_pre_release: bool,
    dhcp_release: bool,
    dhcp: DhcpOptionSet,
    register_dns: bool,
    txqueuelen: u32,
    tap_sleep: Duration,
    use_iproute: bool,
    strict_warnings: bool,
}

impl Default for TunTapOptions {
    fn default() -> Self {
        Self {
            ip_assign: IpAssignMethod::default(),
            dhcp_masq_offset: None,
            dhcp_lease_time: DEFAULT_LEASE_TIME,
            dhcp_renew: false,
            dhcp_pre_release: false,
            dhcp_release: false,
            dhcp: DhcpOptionSet::default(),
            register_dns: false,
            txqueuelen: DEFAULT_TXQUEUELEN,
            tap_sleep: Duration::ZERO,
            use_iproute: true,
            strict_warnings: true,
        }
    }
}

impl TunTapOptions {
    pub fn builder() -> TunTapOptionsBuilder {
        TunTapOptionsBuilder::default()
    }

    pub fn ip_assign(&self) -> IpAssignMethod {
        self.ip_assign
    }
    /// Offset of the masquerade DHCP server inside the subnet, zero when
    /// none was configured.
    pub fn dhcp_masq_offset(&self) -> i32 {
        self.dhcp_masq_offset.unwrap_or(0)
    }
    pub fn dhcp_masq_custom_offset(&self) -> bool {
        self.dhcp_masq_offset.is_some()
    }
    pub fn dhcp_lease_time(&self) -> Duration {
        self.dhcp_lease_time
    }
    pub fn dhcp_renew(&self) -> bool {
        self.dhcp_renew
    }
    pub fn dhcp_pre_release(&self) -> bool {
        self.dhcp_pre_release
    }
    pub fn dhcp_release(&self) -> bool {
        self.dhcp_release
    }
    /// Release the masquerade lease when the device is closed.
    pub fn releases_lease_on_close(&self) -> bool {
        self.dhcp_release && self.ip_assign.uses_masquerade()
    }
    pub fn dhcp(&self) -> &DhcpOptionSet {
        &self.dhcp
    }
    /// Windows: flush and re-register DNS once the adapter is configured.
    pub fn register_dns(&self) -> bool {
        self.register_dns
    }
    pub fn txqueuelen(&self) -> u32 {
        self.txqueuelen
    }
    pub fn tap_sleep(&self) -> Duration {
        self.tap_sleep
    }
    /// Linux: `ip` rather than `ifconfig`.
    pub fn use_iproute(&self) -> bool {
        self.use_iproute
    }
    pub fn strict_warnings(&self) -> bool {
        self.strict_warnings
    }
}

#[derive(Debug, Default)]
pub struct TunTapOptionsBuilder {
    options: TunTapOptions,
    error: Option<Error>,
}

impl TunTapOptionsBuilder {
    pub fn ip_assign(mut self, method: IpAssignMethod) -> Self {
        self.options.ip_assign = method;
        self
    }
    pub fn dhcp_masq_offset(mut self, offset: i32) -> Self {
        if !(-255..=255).contains(&offset) {
            self.fail(format!(
                "DHCP masquerade offset {offset} must be > -256 and < 256"
            ));
        }
        self.options.dhcp_masq_offset = Some(offset);
        self
    }
    pub fn dhcp_lease_time(mut self, lease: Duration) -> Self {
        if lease < MIN_LEASE_TIME || lease.as_secs() > u64::from(u32::MAX) {
            self.fail(format!(
                "DHCP lease time {}s must be at least {}s",
                lease.as_secs(),
                MIN_LEASE_TIME.as_secs()
            ));
        }
        self.options.dhcp_lease_time = lease;
        self
    }
    pub fn dhcp_renew(mut self, on: bool) -> Self {
        self.options.dhcp_renew = on;
        self
    }
    pub fn dhcp_pre_release(mut self, on: bool) -> Self {
        self.options.dhcp_pre_release = on;
        self
    }
    pub fn dhcp_release(mut self, on: bool) -> Self {
        self.options.dhcp_release = on;
        self
    }
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.options.dhcp.domain = Some(domain.into());
        self
    }
    pub fn netbios_scope(mut self, scope: impl Into<String>) -> Self {
        self.options.dhcp.netbios_scope = Some(scope.into());
        self
    }
    pub fn netbios_node_type(mut self, node_type: NetbiosNodeType) -> Self {
        self.options.dhcp.netbios_node_type = Some(node_type);
        self
    }
    pub fn dns(mut self, addr: Ipv4Addr) -> Self {
        self.push_addr("dns", addr, |d| &mut d.dns);
        self
    }
    pub fn wins(mut self, addr: Ipv4Addr) -> Self {
        self.push_addr("wins", addr, |d| &mut d.wins);
        self
    }
    pub fn ntp(mut self, addr: Ipv4Addr) -> Self {
        self.push_addr("ntp", addr, |d| &mut d.ntp);
        self
    }
    pub fn nbdd(mut self, addr: Ipv4Addr) -> Self {
        self.push_addr("nbdd", addr, |d| &mut d.nbdd);
        self
    }
    pub fn disable_nbt(mut self, on: bool) -> Self {
        self.options.dhcp.disable_nbt = on;
        self
    }
    pub fn register_dns(mut self, on: bool) -> Self {
        self.options.register_dns = on;
        self
    }
    pub fn txqueuelen(mut self, len: u32) -> Self {
        if len == 0 {
            self.fail("txqueuelen must be positive".into());
        }
        self.options.txqueuelen = len;
        self
    }
    pub fn tap_sleep(mut self, delay: Duration) -> Self {
        if delay > Duration::from_secs(255) {
            self.fail("tap sleep must be at most 255 seconds".into());
        }
        self.options.tap_sleep = delay;
        self
    }
    pub fn use_iproute(mut self, on: bool) -> Self {
        self.options.use_iproute = on;
        self
    }
    /// Emit address sanity and clash warnings.
    pub fn strict_warnings(mut self, on: bool) -> Self {
        self.options.strict_warnings = on;
        self
    }

    pub fn build(self) -> Result<TunTapOptions> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let o = &self.options;
        if o.dhcp.is_set() && !o.ip_assign.uses_masquerade() {
            return Err(Error::Config(format!(
                "DHCP options require ip assignment method '{}' or '{}'",
                IpAssignMethod::DhcpMasquerade,
                IpAssignMethod::Adaptive
            )));
        }
        Ok(self.options)
    }

    fn push_addr(
        &mut self,
        what: &str,
        addr: Ipv4Addr,
        list: impl FnOnce(&mut DhcpOptionSet) -> &mut Vec<Ipv4Addr>,
    ) {
        let list = list(&mut self.options.dhcp);
        if list.len() >= MAX_DHCP_ADDRS {
            self.fail(format!(
                "too many {what} addresses, at most {MAX_DHCP_ADDRS} are allowed"
            ));
            return;
        }
        list.push(addr);
    }

    fn fail(&mut self, msg: String) {
        if self.error.is_none() {
            self.error = Some(Error::Config(msg));
        }
    }
}
