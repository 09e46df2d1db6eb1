//! DHCP masquerade support: the option stream handed to the TAP driver and
//! the address its built-in DHCP server answers from.

use crate::error::{Error, Result};
use crate::options::DhcpOptionSet;
use crate::validate::{DeviceKind, Topology};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// Size of the option buffer passed to the driver.
pub const DHCP_OPTIONS_CAPACITY: usize = 256;

const OPT_DNS: u8 = 6;
const OPT_DOMAIN: u8 = 15;
const OPT_NTP: u8 = 42;
const OPT_VENDOR: u8 = 43;
const OPT_WINS: u8 = 44;
const OPT_NBDD: u8 = 45;
const OPT_NETBIOS_NODE_TYPE: u8 = 46;
const OPT_NETBIOS_SCOPE: u8 = 47;

/// Microsoft vendor option 1, value 2: disable NetBIOS over TCP/IP.
const DISABLE_NBT: [u8; 8] = [OPT_VENDOR, 6, 0x01, 4, 0, 0, 0, 0x02];

/// Bounded writer of DHCP `tag, length, value` triples.
///
/// A write that does not fit, or whose payload length is outside `1..=255`,
/// fails without touching the buffer.
#[derive(Debug)]
pub struct DhcpOptionWriter {
    buf: BytesMut,
    capacity: usize,
}

impl Default for DhcpOptionWriter {
    fn default() -> Self {
        Self::with_capacity(DHCP_OPTIONS_CAPACITY)
    }
}

impl DhcpOptionWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn reserve(&self, what: &str, n: usize) -> Result<()> {
        if self.buf.len() + n > self.capacity {
            return Err(fail(format!("{what}: buffer overflow building DHCP options")));
        }
        Ok(())
    }

    pub fn write_u8(&mut self, tag: u8, value: u8) -> Result<()> {
        self.reserve("write_u8", 3)?;
        self.buf.put_slice(&[tag, 1, value]);
        Ok(())
    }

    /// Write a list of addresses in network order. An empty list writes nothing.
    pub fn write_addrs(&mut self, tag: u8, addrs: &[Ipv4Addr]) -> Result<()> {
        if addrs.is_empty() {
            return Ok(());
        }
        let size = addrs.len() * 4;
        self.reserve("write_addrs", 2 + size)?;
        if size > 255 {
            return Err(fail(format!(
                "write_addrs: size ({size}) must be > 0 and <= 255"
            )));
        }
        self.buf.put_u8(tag);
        self.buf.put_u8(size as u8);
        for addr in addrs {
            self.buf.put_u32(u32::from(*addr));
        }
        Ok(())
    }

    pub fn write_str(&mut self, tag: u8, s: &str) -> Result<()> {
        let len = s.len();
        self.reserve("write_str", 2 + len)?;
        if len < 1 || len > 255 {
            return Err(fail(format!(
                "write_str: string '{s}' must be > 0 bytes and <= 255 bytes"
            )));
        }
        self.buf.put_u8(tag);
        self.buf.put_u8(len as u8);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    pub fn write_disable_nbt(&mut self) -> Result<()> {
        self.reserve("write_disable_nbt", DISABLE_NBT.len())?;
        self.buf.put_slice(&DISABLE_NBT);
        Ok(())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

fn fail(msg: String) -> Error {
    log::warn!("{msg}");
    Error::DhcpOptions(msg)
}

/// Encode `set` in the fixed tag order used by the driver. Encoding stops at
/// the first option that cannot be written.
pub fn build_dhcp_options(set: &DhcpOptionSet) -> Result<Bytes> {
    let mut w = DhcpOptionWriter::default();
    write_options(&mut w, set)?;
    Ok(w.finish())
}

pub fn write_options(w: &mut DhcpOptionWriter, set: &DhcpOptionSet) -> Result<()> {
    if let Some(domain) = &set.domain {
        w.write_str(OPT_DOMAIN, domain)?;
    }
    if let Some(scope) = &set.netbios_scope {
        w.write_str(OPT_NETBIOS_SCOPE, scope)?;
    }
    if let Some(node_type) = set.netbios_node_type {
        w.write_u8(OPT_NETBIOS_NODE_TYPE, node_type as u8)?;
    }
    w.write_addrs(OPT_DNS, &set.dns)?;
    w.write_addrs(OPT_WINS, &set.wins)?;
    w.write_addrs(OPT_NTP, &set.ntp)?;
    w.write_addrs(OPT_NBDD, &set.nbdd)?;
    if set.disable_nbt {
        w.write_disable_nbt()?;
    }
    Ok(())
}

/// Address the driver's DHCP server answers from.
///
/// Tun devices use the peer (point-to-point) or the address just below the
/// subnet broadcast; the offset only applies to tap devices, where a
/// negative offset counts down from the broadcast address and a positive one
/// up from the network address.
pub fn masquerade_server(
    kind: DeviceKind,
    topology: Topology,
    local: Ipv4Addr,
    remote_netmask: Ipv4Addr,
    adapter_netmask: Ipv4Addr,
    offset: i32,
    custom_offset: bool,
) -> Result<Ipv4Addr> {
    let l = u32::from(local);
    match kind {
        DeviceKind::Tun => {
            if custom_offset {
                log::warn!(
                    "WARNING: because you are using '--dev tun' mode, the DHCP masquerade \
                     offset parameter is ignored"
                );
            }
            if topology == Topology::Subnet {
                let inv = !u32::from(remote_netmask);
                Ok(if inv != 0 {
                    Ipv4Addr::from((l | inv).wrapping_sub(1))
                } else {
                    Ipv4Addr::UNSPECIFIED
                })
            } else {
                Ok(remote_netmask)
            }
        }
        DeviceKind::Tap => {
            let mask = u32::from(adapter_netmask);
            let base = if offset < 0 { l | !mask } else { l & mask };
            let dsa = base.wrapping_add_signed(offset);
            let server = Ipv4Addr::from(dsa);
            if dsa == l {
                let e = Error::Topology(format!(
                    "There is a clash between the ifconfig local address and the internal \
                     DHCP server address -- both are set to {server} -- choose a different \
                     DHCP masquerade offset"
                ));
                log::error!("{e}");
                return Err(e);
            }
            if l & mask != dsa & mask {
                let e = Error::Topology(
                    "DHCP masquerade offset is outside of the ifconfig subnet".into(),
                );
                log::error!("{e}");
                return Err(e);
            }
            Ok(server)
        }
        other => Err(Error::Config(format!(
            "DHCP masquerade is not available for {other} devices"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::NetbiosNodeType;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn dns_servers_encoding() {
        let set = DhcpOptionSet {
            dns: vec![ip("8.8.8.8"), ip("8.8.4.4")],
            ..Default::default()
        };
        let out = build_dhcp_options(&set).unwrap();
        assert_eq!(&out[..], &[6, 8, 8, 8, 8, 8, 8, 8, 4, 4]);
    }

    #[test]
    fn long_domain_fails_untouched() {
        let mut w = DhcpOptionWriter::with_capacity(1024);
        w.write_addrs(OPT_DNS, &[ip("10.0.0.1")]).unwrap();
        let before = w.as_bytes().to_vec();
        let domain = "a".repeat(256);
        assert!(matches!(
            w.write_str(OPT_DOMAIN, &domain),
            Err(Error::DhcpOptions(_))
        ));
        assert_eq!(w.as_bytes(), &before[..]);

        let set = DhcpOptionSet {
            domain: Some(domain),
            ..Default::default()
        };
        assert!(build_dhcp_options(&set).is_err());
    }

    #[test]
    fn empty_string_rejected() {
        let mut w = DhcpOptionWriter::default();
        assert!(w.write_str(OPT_DOMAIN, "").is_err());
        assert!(w.is_empty());
    }

    #[test]
    fn overflow_rejected() {
        let mut w = DhcpOptionWriter::with_capacity(5);
        w.write_u8(OPT_NETBIOS_NODE_TYPE, 8).unwrap();
        assert!(w.write_u8(OPT_NETBIOS_NODE_TYPE, 8).is_err());
        assert_eq!(w.len(), 3);
    }

    #[test]
    fn full_order() {
        let set = DhcpOptionSet {
            domain: Some("vpn".into()),
            netbios_scope: Some("s".into()),
            netbios_node_type: Some(NetbiosNodeType::Hybrid),
            dns: vec![ip("10.8.0.1")],
            wins: vec![ip("10.8.0.2")],
            ntp: vec![ip("10.8.0.3")],
            nbdd: vec![ip("10.8.0.4")],
            disable_nbt: true,
        };
        let out = build_dhcp_options(&set).unwrap();
        let expected: Vec<u8> = [
            &[15, 3, b'v', b'p', b'n'][..],
            &[47, 1, b's'],
            &[46, 1, 8],
            &[6, 4, 10, 8, 0, 1],
            &[44, 4, 10, 8, 0, 2],
            &[42, 4, 10, 8, 0, 3],
            &[45, 4, 10, 8, 0, 4],
            &[43, 6, 1, 4, 0, 0, 0, 2],
        ]
        .concat();
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn tun_server_address() {
        let s = masquerade_server(
            DeviceKind::Tun,
            Topology::Net30,
            ip("10.8.0.6"),
            ip("10.8.0.5"),
            ip("255.255.255.252"),
            0,
            false,
        )
        .unwrap();
        assert_eq!(s, ip("10.8.0.5"));
        let s = masquerade_server(
            DeviceKind::Tun,
            Topology::Subnet,
            ip("10.8.0.2"),
            ip("255.255.255.0"),
            ip("255.255.255.0"),
            0,
            false,
        )
        .unwrap();
        assert_eq!(s, ip("10.8.0.254"));
    }

    #[test]
    fn tap_server_address() {
        let mask = ip("255.255.255.0");
        let local = ip("192.168.50.10");
        let s = masquerade_server(DeviceKind::Tap, Topology::Net30, local, mask, mask, 0, false)
            .unwrap();
        assert_eq!(s, ip("192.168.50.0"));
        let s = masquerade_server(DeviceKind::Tap, Topology::Net30, local, mask, mask, -1, true)
            .unwrap();
        assert_eq!(s, ip("192.168.50.254"));
        let clash =
            masquerade_server(DeviceKind::Tap, Topology::Net30, local, mask, mask, 10, true);
        assert!(matches!(clash, Err(Error::Topology(_))));
        let outside =
            masquerade_server(DeviceKind::Tap, Topology::Net30, local, mask, mask, 255, true)
                .unwrap();
        assert_eq!(outside, ip("192.168.50.255"));
        let outside =
            masquerade_server(DeviceKind::Tap, Topology::Net30, local, mask, mask, -256, true);
        assert!(outside.is_err());
    }
}
