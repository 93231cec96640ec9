//! VRRP wire format: parsing, serialization, and checksums.
//!
//! RFC 5798 §5.1 (VRRPv3) and RFC 3768 §5.1 (VRRPv2). Both framings are
//! accepted on receive and can be produced on send; VRRPv2 is IPv4-only and
//! its Adver_Int field is whole seconds, so it is converted to/from this
//! crate's uniform centisecond representation at the wire boundary.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  | Virtual Rtr ID|   Priority    | Count IP Addrs|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |(rsvd) |     Max Adver Int     |          Checksum             |   (v3)
//! |   Auth Type   |   Adver Int   |          Checksum             |   (v2)
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       IP Address(es)                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Authentication Data (v2 only, 8 bytes)        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::types::{VRRP_PROTOCOL, VRRP_VERSION_V2, VRRP_VERSION_V3};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const VRRP_TYPE_ADVERTISEMENT: u8 = 1;
const V2_AUTH_DATA_LEN: usize = 8;

/// A parsed or to-be-sent VRRP advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrrpPacket {
    /// 2 (RFC 3768) or 3 (RFC 5798).
    pub version: u8,
    pub vrid: u8,
    /// 0 = resigning master, 1..=254 = priority, 255 = address owner.
    pub priority: u8,
    pub count_ip: u8,
    /// Advertisement interval, always expressed in centiseconds regardless
    /// of wire version.
    pub max_advert_int: u16,
    pub checksum: u16,
    pub ip_addresses: Vec<IpAddr>,
}

impl VrrpPacket {
    /// Build a VRRPv3 advertisement (IPv4 or IPv6).
    pub fn new_v3(vrid: u8, priority: u8, advert_interval_cs: u16, ips: Vec<IpAddr>) -> Self {
        Self {
            version: VRRP_VERSION_V3,
            vrid,
            priority,
            count_ip: ips.len() as u8,
            max_advert_int: advert_interval_cs,
            checksum: 0,
            ip_addresses: ips,
        }
    }

    /// Build a VRRPv2 advertisement (IPv4 only per RFC 3768).
    pub fn new_v2(vrid: u8, priority: u8, advert_interval_cs: u16, ips: Vec<Ipv4Addr>) -> Self {
        Self {
            version: VRRP_VERSION_V2,
            vrid,
            priority,
            count_ip: ips.len() as u8,
            max_advert_int: advert_interval_cs,
            checksum: 0,
            ip_addresses: ips.into_iter().map(IpAddr::V4).collect(),
        }
    }

    pub fn is_resignation(&self) -> bool {
        self.priority == crate::types::VRRP_PRIORITY_RESIGN
    }

    /// Parse a packet, auto-detecting v2 vs v3 from the version nibble.
    pub fn parse(data: &[u8]) -> Result<Self, &'static str> {
        if data.len() < 8 {
            return Err("packet too short");
        }

        let version_type = data[0];
        let version = version_type >> 4;
        let pkt_type = version_type & 0x0F;

        if pkt_type != VRRP_TYPE_ADVERTISEMENT {
            return Err("invalid packet type");
        }

        match version {
            VRRP_VERSION_V3 => Self::parse_v3(data),
            VRRP_VERSION_V2 => Self::parse_v2(data),
            _ => Err("unsupported VRRP version"),
        }
    }

    fn parse_v3(data: &[u8]) -> Result<Self, &'static str> {
        let vrid = data[1];
        let priority = data[2];
        let count_ip = data[3];
        let max_advert_int = u16::from_be_bytes([data[4] & 0x0F, data[5]]);
        let checksum = u16::from_be_bytes([data[6], data[7]]);

        let ip_addresses = parse_addresses(&data[8..], count_ip)?;

        Ok(Self {
            version: VRRP_VERSION_V3,
            vrid,
            priority,
            count_ip,
            max_advert_int,
            checksum,
            ip_addresses,
        })
    }

    fn parse_v2(data: &[u8]) -> Result<Self, &'static str> {
        let vrid = data[1];
        let priority = data[2];
        let count_ip = data[3];
        // byte[4] is Auth Type, ignored: authentication is deprecated by
        // RFC 3768 errata and not part of this crate's trust model.
        let advert_int_s = data[5];
        let checksum = u16::from_be_bytes([data[6], data[7]]);

        let addr_bytes = count_ip as usize * 4;
        let body = &data[8..];
        if body.len() < addr_bytes {
            return Err("truncated IPv4 address list");
        }
        let ip_addresses = parse_addresses(&body[..addr_bytes], count_ip)?;
        // Trailing 8 bytes of (unused) auth data are accepted if present
        // but not required; some senders omit them.

        Ok(Self {
            version: VRRP_VERSION_V2,
            vrid,
            priority,
            count_ip,
            max_advert_int: advert_int_s as u16 * 100,
            checksum,
            ip_addresses,
        })
    }

    /// Serialize to wire bytes (checksum field taken as-is; call
    /// `set_checksum` first to fill it in for a real send).
    pub fn to_bytes(&self) -> Bytes {
        match self.version {
            VRRP_VERSION_V2 => self.to_bytes_v2(),
            _ => self.to_bytes_v3(),
        }
    }

    fn to_bytes_v3(&self) -> Bytes {
        let ip_len = address_payload_len(&self.ip_addresses);
        let mut buf = BytesMut::with_capacity(8 + ip_len);

        buf.put_u8((VRRP_VERSION_V3 << 4) | VRRP_TYPE_ADVERTISEMENT);
        buf.put_u8(self.vrid);
        buf.put_u8(self.priority);
        buf.put_u8(self.count_ip);
        buf.put_u16(self.max_advert_int & 0x0FFF);
        buf.put_u16(self.checksum);
        put_addresses(&mut buf, &self.ip_addresses);

        buf.freeze()
    }

    fn to_bytes_v2(&self) -> Bytes {
        let ip_len = self.count_ip as usize * 4;
        let mut buf = BytesMut::with_capacity(8 + ip_len + V2_AUTH_DATA_LEN);

        buf.put_u8((VRRP_VERSION_V2 << 4) | VRRP_TYPE_ADVERTISEMENT);
        buf.put_u8(self.vrid);
        buf.put_u8(self.priority);
        buf.put_u8(self.count_ip);
        buf.put_u8(0); // Auth Type: none
        buf.put_u8((self.max_advert_int / 100).min(255) as u8);
        buf.put_u16(self.checksum);
        put_addresses(&mut buf, &self.ip_addresses);
        buf.put_slice(&[0u8; V2_AUTH_DATA_LEN]);

        buf.freeze()
    }

    /// RFC 1071 ones-complement checksum. VRRPv3 covers an IP
    /// pseudo-header plus the VRRP message (RFC 5798 §5.2.8); VRRPv2
    /// covers the VRRP message alone (RFC 3768 §5.3.8).
    pub fn calculate_checksum(&self, src_ip: IpAddr, dst_ip: IpAddr) -> u16 {
        let packet_bytes = self.to_bytes();
        let mut sum: u32 = match self.version {
            VRRP_VERSION_V2 => 0,
            _ => pseudo_header_sum(src_ip, dst_ip, packet_bytes.len()),
        };

        let mut i = 0;
        while i < packet_bytes.len() {
            if i == 6 {
                // checksum field itself is treated as zero
                i += 2;
                continue;
            }
            let word = if i + 1 < packet_bytes.len() {
                u16::from_be_bytes([packet_bytes[i], packet_bytes[i + 1]])
            } else {
                u16::from_be_bytes([packet_bytes[i], 0])
            };
            sum += word as u32;
            i += 2;
        }

        fold_checksum(sum)
    }

    pub fn set_checksum(&mut self, src_ip: IpAddr, dst_ip: IpAddr) {
        self.checksum = self.calculate_checksum(src_ip, dst_ip);
    }

    pub fn verify_checksum(&self, src_ip: IpAddr, dst_ip: IpAddr) -> bool {
        self.calculate_checksum(src_ip, dst_ip) == self.checksum
    }
}

fn address_payload_len(addresses: &[IpAddr]) -> usize {
    match addresses.first() {
        Some(IpAddr::V4(_)) => addresses.len() * 4,
        Some(IpAddr::V6(_)) => addresses.len() * 16,
        None => 0,
    }
}

fn put_addresses(buf: &mut BytesMut, addresses: &[IpAddr]) {
    for ip in addresses {
        match ip {
            IpAddr::V4(addr) => buf.put_slice(&addr.octets()),
            IpAddr::V6(addr) => buf.put_slice(&addr.octets()),
        }
    }
}

fn parse_addresses(body: &[u8], count_ip: u8) -> Result<Vec<IpAddr>, &'static str> {
    let mut ip_addresses = Vec::with_capacity(count_ip as usize);
    let expected_v4 = count_ip as usize * 4;
    let expected_v6 = count_ip as usize * 16;

    if body.len() >= expected_v4 && (count_ip == 0 || body.len() < expected_v6) {
        let mut offset = 0;
        for _ in 0..count_ip {
            let addr = Ipv4Addr::new(
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            );
            ip_addresses.push(IpAddr::V4(addr));
            offset += 4;
        }
    } else if body.len() >= expected_v6 {
        let mut offset = 0;
        for _ in 0..count_ip {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[offset..offset + 16]);
            ip_addresses.push(IpAddr::V6(Ipv6Addr::from(octets)));
            offset += 16;
        }
    } else {
        return Err("truncated address list");
    }

    Ok(ip_addresses)
}

fn pseudo_header_sum(src_ip: IpAddr, dst_ip: IpAddr, vrrp_len: usize) -> u32 {
    let mut sum: u32 = 0;
    match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let s = src.octets();
            let d = dst.octets();
            sum += u16::from_be_bytes([s[0], s[1]]) as u32;
            sum += u16::from_be_bytes([s[2], s[3]]) as u32;
            sum += u16::from_be_bytes([d[0], d[1]]) as u32;
            sum += u16::from_be_bytes([d[2], d[3]]) as u32;
            sum += VRRP_PROTOCOL as u32;
            sum += vrrp_len as u32;
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let s = src.octets();
            let d = dst.octets();
            for i in (0..16).step_by(2) {
                sum += u16::from_be_bytes([s[i], s[i + 1]]) as u32;
                sum += u16::from_be_bytes([d[i], d[i + 1]]) as u32;
            }
            sum += vrrp_len as u32;
            sum += VRRP_PROTOCOL as u32;
        }
        _ => {}
    }
    sum
}

fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v3_roundtrip_ipv4() {
        let ips = vec!["192.168.1.1".parse().unwrap(), "192.168.1.2".parse().unwrap()];
        let mut packet = VrrpPacket::new_v3(1, 100, 100, ips.clone());

        let src: IpAddr = "10.0.0.1".parse().unwrap();
        let dst: IpAddr = "224.0.0.18".parse().unwrap();
        packet.set_checksum(src, dst);

        let bytes = packet.to_bytes();
        let parsed = VrrpPacket::parse(&bytes).unwrap();

        assert_eq!(parsed.vrid, 1);
        assert_eq!(parsed.priority, 100);
        assert_eq!(parsed.max_advert_int, 100);
        assert_eq!(parsed.ip_addresses, ips);
        assert!(parsed.verify_checksum(src, dst));
    }

    #[test]
    fn v3_roundtrip_ipv6() {
        let ips = vec!["fe80::1".parse().unwrap()];
        let mut packet = VrrpPacket::new_v3(7, 200, 300, ips.clone());
        let src: IpAddr = "fe80::10".parse().unwrap();
        let dst: IpAddr = "ff02::12".parse().unwrap();
        packet.set_checksum(src, dst);

        let bytes = packet.to_bytes();
        let parsed = VrrpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.ip_addresses, ips);
        assert!(parsed.verify_checksum(src, dst));
    }

    #[test]
    fn v2_roundtrip_converts_seconds_to_centiseconds() {
        let ips = vec!["192.168.1.1".parse::<Ipv4Addr>().unwrap()];
        let mut packet = VrrpPacket::new_v2(5, 100, 100, ips);
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        let dst: IpAddr = "224.0.0.18".parse().unwrap();
        packet.set_checksum(src, dst);

        let bytes = packet.to_bytes();
        let parsed = VrrpPacket::parse(&bytes).unwrap();

        assert_eq!(parsed.version, VRRP_VERSION_V2);
        assert_eq!(parsed.max_advert_int, 100); // 1s -> 100cs
        assert!(parsed.verify_checksum(src, dst));
    }

    #[test]
    fn rejects_wrong_packet_type() {
        let mut bytes = vec![0u8; 8];
        bytes[0] = (VRRP_VERSION_V3 << 4) | 2; // type 2 is invalid
        assert!(VrrpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_short_packet() {
        assert!(VrrpPacket::parse(&[1, 2, 3]).is_err());
    }

    #[test]
    fn resignation_priority_is_detected() {
        let packet = VrrpPacket::new_v3(1, 0, 100, vec!["10.0.0.1".parse().unwrap()]);
        assert!(packet.is_resignation());
    }
}
