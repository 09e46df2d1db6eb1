//! Virtual adapter discovery on Windows.
//!
//! The registry walks and IP helper queries live in the Windows backend;
//! this module holds the snapshots they produce and every lookup performed
//! on them, so the matching rules are the same (and testable) everywhere.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// A TAP adapter found under the network adapter class key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterRegistryEntry {
    pub guid: String,
}

/// A connection shown in the network connections control panel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PanelConnectionEntry {
    pub guid: String,
    pub name: String,
}

/// Adapter GUID plus the name scripts and `netsh` refer to it by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedAdapter {
    pub guid: String,
    /// Control panel name, or the GUID when the adapter has none.
    pub actual_name: String,
}

/// Findings of [`AdapterRegistry::diagnose`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterReport {
    /// `(panel name, guid)` per linked adapter, `None` for unlinked ones.
    pub listing: Vec<(Option<String>, String)>,
    pub duplicate_guids: bool,
    pub duplicate_panel_links: bool,
    pub missing_panel_links: bool,
}

impl AdapterReport {
    pub fn log(&self) {
        log::info!("Available TAP-WIN32 adapters [name, GUID]:");
        for (name, guid) in &self.listing {
            match name {
                Some(name) => log::info!("'{name}' {guid}"),
                None => log::info!("[NULL] {guid}"),
            }
        }
        if self.duplicate_guids {
            log::warn!("WARNING: Some TAP-Win32 adapters have duplicate GUIDs");
        }
        if self.duplicate_panel_links {
            log::warn!(
                "WARNING: Some TAP-Win32 adapters have duplicate links from the Network \
                 Connections control panel"
            );
        }
        if self.missing_panel_links {
            log::warn!(
                "WARNING: Some TAP-Win32 adapters have no link from the Network Connections \
                 control panel"
            );
        }
    }
}

/// One snapshot of both registry walks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterRegistry {
    pub adapters: Vec<AdapterRegistryEntry>,
    pub panels: Vec<PanelConnectionEntry>,
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<AdapterRegistryEntry>, panels: Vec<PanelConnectionEntry>) -> Self {
        Self { adapters, panels }
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Fail unless at least one adapter is installed.
    pub fn require_adapters(&self) -> Result<()> {
        if self.adapters.is_empty() {
            let e = Error::Adapter(
                "There are no TAP-Win32 adapters on this system. Install the TAP driver \
                 and add a virtual ethernet adapter."
                    .into(),
            );
            log::error!("{e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn is_tap_adapter(&self, guid: &str) -> bool {
        self.adapters.iter().any(|a| a.guid == guid)
    }

    pub fn guid_to_name(&self, guid: &str) -> Option<&str> {
        self.panels
            .iter()
            .find(|p| p.guid == guid)
            .map(|p| p.name.as_str())
    }

    /// GUID of the TAP adapter whose control panel name is `name`.
    pub fn name_to_guid(&self, name: &str) -> Option<&str> {
        self.panels
            .iter()
            .find(|p| p.name == name && self.is_tap_adapter(&p.guid))
            .map(|p| p.guid.as_str())
    }

    fn resolved(&self, guid: &str) -> ResolvedAdapter {
        ResolvedAdapter {
            guid: guid.to_string(),
            actual_name: self.guid_to_name(guid).unwrap_or(guid).to_string(),
        }
    }

    /// Resolve a device node given either as a GUID or as a control panel name.
    pub fn device_guid(&self, node: &str) -> Option<ResolvedAdapter> {
        if self.adapters.is_empty() {
            return None;
        }
        if self.is_tap_adapter(node) {
            return Some(self.resolved(node));
        }
        self.name_to_guid(node).map(|guid| self.resolved(guid))
    }

    /// The `n`th adapter in registry order.
    pub fn unspecified_device_guid(&self, n: usize) -> Option<ResolvedAdapter> {
        self.adapters.get(n).map(|a| self.resolved(&a.guid))
    }

    /// Name `netsh` should use for the adapter selected by `node`.
    ///
    /// Without a node the choice is only made when exactly one adapter
    /// exists.
    pub fn netsh_id(&self, node: Option<&str>) -> Result<String> {
        self.require_adapters()?;
        let found = match node {
            Some(node) => self.device_guid(node),
            None => {
                if self.adapters.len() > 1 {
                    return Err(Error::Ambiguous(
                        "more than one TAP-Win32 adapter exists, name one explicitly".into(),
                    ));
                }
                self.unspecified_device_guid(0)
            }
        };
        found.map(|a| a.actual_name).ok_or_else(|| {
            Error::Adapter(format!(
                "TAP-Win32 adapter '{}' not found",
                node.unwrap_or_default()
            ))
        })
    }

    pub fn diagnose(&self) -> AdapterReport {
        let mut report = AdapterReport::default();
        for adapter in &self.adapters {
            let links: Vec<&PanelConnectionEntry> =
                self.panels.iter().filter(|p| p.guid == adapter.guid).collect();
            for link in &links {
                report
                    .listing
                    .push((Some(link.name.clone()), adapter.guid.clone()));
            }
            match links.len() {
                0 => {
                    report.missing_panel_links = true;
                    report.listing.push((None, adapter.guid.clone()));
                }
                1 => {}
                _ => report.duplicate_panel_links = true,
            }
        }
        for (i, a) in self.adapters.iter().enumerate() {
            if self.adapters[i + 1..].iter().any(|b| b.guid == a.guid) {
                report.duplicate_guids = true;
            }
        }
        report
    }
}

/// DHCP mode of an adapter as reported by the IP helper API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DhcpStatus {
    #[default]
    Undefined,
    Enabled,
    Disabled,
}

/// What the IP helper API reports for one adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    pub index: u32,
    /// Internal adapter name, the GUID for TAP adapters.
    pub name: String,
    pub dhcp_enabled: bool,
    /// Assigned `(address, netmask)` pairs in adapter order.
    pub addresses: Vec<(Ipv4Addr, Ipv4Addr)>,
    /// Primary and secondary WINS server when the adapter has WINS.
    pub wins: Option<(Ipv4Addr, Ipv4Addr)>,
}

impl AdapterInfo {
    /// Is `ip` inside one of the adapter subnets? Returns the longest
    /// matching netmask.
    pub fn subnet_containing(&self, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        let ip = u32::from(ip);
        self.addresses
            .iter()
            .filter(|(a, m)| !a.is_unspecified() && !m.is_unspecified())
            .filter(|(a, m)| ip & u32::from(*m) == u32::from(*a) & u32::from(*m))
            .map(|(_, m)| *m)
            .max_by_key(|m| u32::from(*m))
    }

    pub fn first_address(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.addresses.first().copied()
    }
}

pub fn find_by_index(list: &[AdapterInfo], index: u32) -> Option<&AdapterInfo> {
    list.iter().find(|a| a.index == index)
}

pub fn find_by_name<'a>(list: &'a [AdapterInfo], name: &str) -> Option<&'a AdapterInfo> {
    list.iter().find(|a| a.name == name)
}

pub fn dhcp_status(list: &[AdapterInfo], index: Option<u32>) -> DhcpStatus {
    match index.and_then(|i| find_by_index(list, i)) {
        Some(a) if a.dhcp_enabled => DhcpStatus::Enabled,
        Some(_) => DhcpStatus::Disabled,
        None => DhcpStatus::Undefined,
    }
}

/// Has the adapter picked up its address yet?
///
/// With an expected address the adapter must carry exactly that pair;
/// otherwise any address counts. An adapter that cannot be found (for
/// example because it is bridged) counts as up.
pub fn is_adapter_up(
    list: &[AdapterInfo],
    index: Option<u32>,
    expected: Option<(Ipv4Addr, Ipv4Addr)>,
) -> bool {
    let Some(info) = index.and_then(|i| find_by_index(list, i)) else {
        return true;
    };
    info.addresses.iter().any(|(ip, mask)| match expected {
        Some((l, m)) => *ip == l && *mask == m,
        None => !ip.is_unspecified() && !mask.is_unspecified(),
    })
}

/// Adapter whose subnet contains `ip` with the longest netmask.
///
/// Returns the index, that netmask, and how many adapters tie for it.
pub fn adapter_index_of_ip(list: &[AdapterInfo], ip: Ipv4Addr) -> Option<(u32, Ipv4Addr, usize)> {
    let mut best: Option<(u32, Ipv4Addr, usize)> = None;
    for info in list {
        let Some(mask) = info.subnet_containing(ip) else {
            continue;
        };
        let better = match best {
            Some((_, m, _)) => u32::from(mask) > u32::from(m),
            None => true,
        };
        if better {
            best = Some((info.index, mask, 1));
        } else if let Some((_, m, count)) = &mut best {
            if *m == mask {
                *count += 1;
            }
        }
    }
    log::debug!("IP locate: ip={ip} result={best:?}");
    best
}

#[cfg(test)]
mod test {
    use super::*;

    const A: &str = "{11111111-0000-0000-0000-000000000001}";
    const B: &str = "{22222222-0000-0000-0000-000000000002}";

    fn registry(adapters: &[&str], panels: &[(&str, &str)]) -> AdapterRegistry {
        AdapterRegistry::new(
            adapters
                .iter()
                .map(|g| AdapterRegistryEntry { guid: g.to_string() })
                .collect(),
            panels
                .iter()
                .map(|(g, n)| PanelConnectionEntry {
                    guid: g.to_string(),
                    name: n.to_string(),
                })
                .collect(),
        )
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn resolve_by_guid_or_name() {
        let reg = registry(&[A, B], &[(A, "vpn0"), (B, "vpn1"), ("{other}", "Ethernet")]);
        let r = reg.device_guid(B).unwrap();
        assert_eq!(r.actual_name, "vpn1");
        let r = reg.device_guid("vpn0").unwrap();
        assert_eq!(r.guid, A);
        // Panel entries of non-TAP adapters are ignored.
        assert!(reg.device_guid("Ethernet").is_none());
        assert!(registry(&[], &[(A, "vpn0")]).device_guid("vpn0").is_none());
    }

    #[test]
    fn unspecified_walks_registry_order() {
        let reg = registry(&[A, B], &[(B, "vpn1")]);
        assert_eq!(reg.unspecified_device_guid(0).unwrap().actual_name, A);
        assert_eq!(reg.unspecified_device_guid(1).unwrap().actual_name, "vpn1");
        assert!(reg.unspecified_device_guid(2).is_none());
    }

    #[test]
    fn netsh_id_needs_one_candidate() {
        let reg = registry(&[A, B], &[(A, "vpn0")]);
        assert!(matches!(reg.netsh_id(None), Err(Error::Ambiguous(_))));
        assert_eq!(reg.netsh_id(Some(A)).unwrap(), "vpn0");
        assert_eq!(reg.netsh_id(Some(B)).unwrap(), B);
        assert!(reg.netsh_id(Some("missing")).is_err());
        let single = registry(&[A], &[(A, "vpn0")]);
        assert_eq!(single.netsh_id(None).unwrap(), "vpn0");
        assert!(registry(&[], &[]).netsh_id(None).is_err());
    }

    #[test]
    fn diagnostics() {
        let reg = registry(&[A, B, A], &[(A, "vpn0"), (A, "copy")]);
        let report = reg.diagnose();
        assert!(report.duplicate_guids);
        assert!(report.duplicate_panel_links);
        assert!(report.missing_panel_links);
        assert!(report.listing.contains(&(None, B.to_string())));
        let clean = registry(&[A], &[(A, "vpn0")]).diagnose();
        assert_eq!(clean.listing, vec![(Some("vpn0".to_string()), A.to_string())]);
        assert!(!clean.duplicate_guids && !clean.missing_panel_links);
    }

    fn infos() -> Vec<AdapterInfo> {
        vec![
            AdapterInfo {
                index: 3,
                name: "{lan}".into(),
                dhcp_enabled: true,
                addresses: vec![(ip("10.0.0.5"), ip("255.0.0.0"))],
                wins: None,
            },
            AdapterInfo {
                index: 7,
                name: A.into(),
                dhcp_enabled: false,
                addresses: vec![(ip("10.8.0.2"), ip("255.255.255.0"))],
                wins: None,
            },
        ]
    }

    #[test]
    fn adapter_queries() {
        let list = infos();
        assert_eq!(dhcp_status(&list, Some(3)), DhcpStatus::Enabled);
        assert_eq!(dhcp_status(&list, Some(7)), DhcpStatus::Disabled);
        assert_eq!(dhcp_status(&list, None), DhcpStatus::Undefined);
        assert_eq!(find_by_name(&list, A).map(|a| a.index), Some(7));

        assert!(is_adapter_up(
            &list,
            Some(7),
            Some((ip("10.8.0.2"), ip("255.255.255.0")))
        ));
        assert!(!is_adapter_up(
            &list,
            Some(7),
            Some((ip("10.8.0.3"), ip("255.255.255.0")))
        ));
        assert!(is_adapter_up(&list, Some(99), None));

        assert_eq!(
            adapter_index_of_ip(&list, ip("10.8.0.9")),
            Some((7, ip("255.255.255.0"), 1))
        );
        assert_eq!(
            adapter_index_of_ip(&list, ip("10.9.0.1")),
            Some((3, ip("255.0.0.0"), 1))
        );
        assert_eq!(adapter_index_of_ip(&list, ip("192.168.1.1")), None);
    }
}
