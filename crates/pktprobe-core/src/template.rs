//! # Probe Packet Template
//!
//! Precomputed Ethernet II / IPv4 / UDP header image followed by the probe
//! payload. The image is built once per TX role with `smoltcp` wire reprs;
//! each transmission copies it into a fresh buffer, patches the mutable
//! fields and appends the Ethernet frame-check sequence.
//!
//! ## Probe layout
//!
//! ```text
//!  0..14   Ethernet header
//! 14..34   IPv4 header (TTL 64, checksum filled)
//! 34..42   UDP header (checksum 0)
//! 42..46   probe_index   u32 LE
//! 46..50   magic         u32 LE  0x12345678
//! 50..58   send_cycle    u64 LE
//! 58..len  zero padding
//! len..+4  FCS (CRC-32, appended per instantiation)
//! ```

use std::net::Ipv4Addr;

use serde::Deserialize;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Packet,
    Ipv4Repr, UdpPacket, UdpRepr,
};

use crate::error::{BufferError, ConfigError};
use crate::port::PacketBuffer;

pub const PROBE_MAGIC: u32 = 0x1234_5678;
pub const ETH_FCS_LEN: usize = 4;

const ETH_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;

pub const PROBE_INDEX_OFFSET: usize = ETH_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN;
pub const PROBE_MAGIC_OFFSET: usize = PROBE_INDEX_OFFSET + 4;
pub const PROBE_CYCLE_OFFSET: usize = PROBE_MAGIC_OFFSET + 4;
pub const PROBE_HEADER_LEN: usize = PROBE_CYCLE_OFFSET + 8;

/// Ethernet minimum frame length without FCS.
pub const MIN_PKT_LEN: usize = 60;
/// Ethernet maximum frame length without FCS.
pub const MAX_PKT_LEN: usize = 1514;

const IP_TTL: u8 = 64;

/// Packet length on the wire, FCS included.
pub fn wire_size(pkt_len: usize) -> usize {
    pkt_len + ETH_FCS_LEN
}

/// Parses `aa:bb:cc:dd:ee:ff`.
pub fn parse_mac(s: &str) -> Result<[u8; 6], ConfigError> {
    let invalid = || ConfigError::InvalidMac(s.to_string());
    let mut mac = [0u8; 6];
    let mut parts = s.trim().split(':');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.is_empty() || part.len() > 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(mac)
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Addresses and size of the generated probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketConfig {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub pkt_len: usize,
}

impl Default for PacketConfig {
    fn default() -> Self {
        PacketConfig {
            src_mac: [0x12, 0, 0, 0, 0, 0],
            dst_mac: [0x21, 0, 0, 0, 0, 0],
            src_ip: Ipv4Addr::new(192, 168, 0, 12),
            dst_ip: Ipv4Addr::new(192, 168, 0, 21),
            src_port: 1024,
            dst_port: 1024,
            pkt_len: MIN_PKT_LEN,
        }
    }
}

/// TOML form of [`PacketConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PacketConfigInput {
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub src_ip: Option<Ipv4Addr>,
    pub dst_ip: Option<Ipv4Addr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub pkt_len: Option<usize>,
}

impl PacketConfigInput {
    pub fn resolve(self) -> Result<PacketConfig, ConfigError> {
        let defaults = PacketConfig::default();
        let pkt_len = self.pkt_len.unwrap_or(defaults.pkt_len);
        if !(MIN_PKT_LEN..=MAX_PKT_LEN).contains(&pkt_len) {
            return Err(ConfigError::InvalidPacketLength {
                len: pkt_len,
                min: MIN_PKT_LEN,
                max: MAX_PKT_LEN,
            });
        }
        Ok(PacketConfig {
            src_mac: self
                .src_mac
                .as_deref()
                .map(parse_mac)
                .transpose()?
                .unwrap_or(defaults.src_mac),
            dst_mac: self
                .dst_mac
                .as_deref()
                .map(parse_mac)
                .transpose()?
                .unwrap_or(defaults.dst_mac),
            src_ip: self.src_ip.unwrap_or(defaults.src_ip),
            dst_ip: self.dst_ip.unwrap_or(defaults.dst_ip),
            src_port: self.src_port.unwrap_or(defaults.src_port),
            dst_port: self.dst_port.unwrap_or(defaults.dst_port),
            pkt_len,
        })
    }
}

// ─── Template ───────────────────────────────────────────────────────────────

/// Fields recovered from a received probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeView {
    pub index: u32,
    pub send_cycle: u64,
}

/// Immutable probe header image.
#[derive(Debug, Clone)]
pub struct ProbeTemplate {
    image: Box<[u8]>,
    protocol: IpProtocol,
}

impl ProbeTemplate {
    pub fn build(cfg: &PacketConfig) -> Result<Self, ConfigError> {
        if !(MIN_PKT_LEN..=MAX_PKT_LEN).contains(&cfg.pkt_len) {
            return Err(ConfigError::InvalidPacketLength {
                len: cfg.pkt_len,
                min: MIN_PKT_LEN,
                max: MAX_PKT_LEN,
            });
        }
        let mut image = vec![0u8; cfg.pkt_len];

        let eth_repr = EthernetRepr {
            src_addr: EthernetAddress(cfg.src_mac),
            dst_addr: EthernetAddress(cfg.dst_mac),
            ethertype: EthernetProtocol::Ipv4,
        };
        let mut eth_frame = EthernetFrame::new_unchecked(&mut image[..]);
        eth_repr.emit(&mut eth_frame);

        let udp_payload_len = cfg.pkt_len - PROBE_INDEX_OFFSET;
        let ip_repr = Ipv4Repr {
            src_addr: cfg.src_ip.into(),
            dst_addr: cfg.dst_ip.into(),
            next_header: IpProtocol::Udp,
            payload_len: UDP_HDR_LEN + udp_payload_len,
            hop_limit: IP_TTL,
        };
        let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
        ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

        // The payload changes per packet, so the UDP checksum stays zero.
        let udp_repr = UdpRepr {
            src_port: cfg.src_port,
            dst_port: cfg.dst_port,
        };
        let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
        udp_repr.emit(
            &mut udp_packet,
            &ip_repr.src_addr.into(),
            &ip_repr.dst_addr.into(),
            udp_payload_len,
            |buf| buf.fill(0),
            &ChecksumCapabilities::ignored(),
        );

        image[PROBE_MAGIC_OFFSET..PROBE_CYCLE_OFFSET].copy_from_slice(&PROBE_MAGIC.to_le_bytes());

        Ok(ProbeTemplate {
            image: image.into_boxed_slice(),
            protocol: IpProtocol::Udp,
        })
    }

    pub fn wire_size(&self) -> usize {
        wire_size(self.image.len())
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Writes one probe into `buf`: header image, index, send cycle, FCS.
    /// Every write is bounds-checked against the buffer's declared length.
    pub fn instantiate(
        &self,
        buf: &mut PacketBuffer,
        index: u32,
        send_cycle: u64,
    ) -> Result<(), BufferError> {
        let pkt_len = self.image.len();
        buf.set_len(self.wire_size())?;
        buf.copy_in(0, &self.image)?;
        buf.copy_in(PROBE_INDEX_OFFSET, &index.to_le_bytes())?;
        buf.copy_in(PROBE_CYCLE_OFFSET, &send_cycle.to_le_bytes())?;
        let fcs = crc32(&buf.as_slice()[..pkt_len]);
        buf.copy_in(pkt_len, &fcs.to_le_bytes())
    }

    /// Recognises a probe: IPv4, the configured transport, and the magic tag
    /// at its fixed offset. Anything else is plain traffic.
    pub fn classify(&self, bytes: &[u8]) -> Option<ProbeView> {
        if bytes.len() < PROBE_HEADER_LEN {
            return None;
        }
        let frame = EthernetFrame::new_checked(bytes).ok()?;
        if frame.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }
        let ip = Ipv4Packet::new_checked(frame.payload()).ok()?;
        if ip.next_header() != self.protocol {
            return None;
        }
        if read_u32(bytes, PROBE_MAGIC_OFFSET)? != PROBE_MAGIC {
            return None;
        }
        Some(ProbeView {
            index: read_u32(bytes, PROBE_INDEX_OFFSET)?,
            send_cycle: u64::from_le_bytes(
                bytes
                    .get(PROBE_CYCLE_OFFSET..PROBE_HEADER_LEN)?
                    .try_into()
                    .ok()?,
            ),
        })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(offset..offset + 4)?.try_into().ok()?))
}

// ─── FCS ────────────────────────────────────────────────────────────────────

const CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// IEEE 802.3 CRC-32.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in bytes {
        crc = CRC32_TABLE[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ProbeTemplate {
        ProbeTemplate::build(&PacketConfig::default()).unwrap()
    }

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn parse_mac_accepts_and_rejects() {
        assert_eq!(
            parse_mac("12:00:ab:CD:0:ff").unwrap(),
            [0x12, 0x00, 0xab, 0xcd, 0x00, 0xff]
        );
        for bad in ["", "12:00:00:00:00", "12:00:00:00:00:00:00", "zz:00:00:00:00:00", "123:0:0:0:0:0"] {
            assert!(parse_mac(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn image_headers() {
        let t = template();
        let img = t.image();
        assert_eq!(img.len(), 60);
        assert_eq!(t.wire_size(), 64);
        assert_eq!(&img[12..14], &[0x08, 0x00]);
        // IPv4, IHL 5, TTL 64, UDP.
        assert_eq!(img[14], 0x45);
        assert_eq!(img[22], 64);
        assert_eq!(img[23], 17);
        // total_length = 60 - 14
        assert_eq!(u16::from_be_bytes([img[16], img[17]]), 46);
        assert_eq!(&img[26..30], &[192, 168, 0, 12]);
        assert_eq!(&img[30..34], &[192, 168, 0, 21]);
        // UDP ports and length
        assert_eq!(u16::from_be_bytes([img[34], img[35]]), 1024);
        assert_eq!(u16::from_be_bytes([img[38], img[39]]), 26);
        assert_eq!(&img[40..42], &[0, 0]);
    }

    #[test]
    fn ipv4_checksum_verifies() {
        let t = template();
        let ip = Ipv4Packet::new_checked(&t.image()[ETH_HDR_LEN..]).unwrap();
        assert!(ip.verify_checksum());
    }

    #[test]
    fn instantiate_then_classify() {
        let t = template();
        let mut buf = PacketBuffer::with_capacity(128);
        t.instantiate(&mut buf, 42, 0xDEAD_BEEF).unwrap();
        assert_eq!(buf.len(), 64);

        let view = t.classify(buf.as_slice()).unwrap();
        assert_eq!(view, ProbeView { index: 42, send_cycle: 0xDEAD_BEEF });

        let fcs = crc32(&buf.as_slice()[..60]);
        assert_eq!(&buf.as_slice()[60..64], &fcs.to_le_bytes());
    }

    #[test]
    fn instantiate_into_short_buffer_fails() {
        let t = template();
        let mut buf = PacketBuffer::with_capacity(60);
        assert!(matches!(
            t.instantiate(&mut buf, 1, 1),
            Err(BufferError::LengthExceedsCapacity { len: 64, capacity: 60 })
        ));
    }

    #[test]
    fn classify_rejects_wrong_magic_and_protocol() {
        let t = template();
        let mut buf = PacketBuffer::with_capacity(64);
        t.instantiate(&mut buf, 1, 1).unwrap();

        let mut bytes = buf.as_slice().to_vec();
        bytes[PROBE_MAGIC_OFFSET] ^= 0xFF;
        assert!(t.classify(&bytes).is_none());

        let mut bytes = buf.as_slice().to_vec();
        bytes[23] = 6; // TCP
        assert!(t.classify(&bytes).is_none());

        let mut bytes = buf.as_slice().to_vec();
        bytes[12] = 0x86;
        bytes[13] = 0xDD;
        assert!(t.classify(&bytes).is_none());

        assert!(t.classify(&buf.as_slice()[..40]).is_none());
    }

    #[test]
    fn packet_length_bounds() {
        let cfg = PacketConfig {
            pkt_len: 59,
            ..PacketConfig::default()
        };
        assert!(ProbeTemplate::build(&cfg).is_err());

        let input = PacketConfigInput {
            pkt_len: Some(2000),
            ..Default::default()
        };
        assert!(input.resolve().is_err());
    }

    #[test]
    fn larger_packets_are_padded() {
        let cfg = PacketConfig {
            pkt_len: 128,
            ..PacketConfig::default()
        };
        let t = ProbeTemplate::build(&cfg).unwrap();
        assert_eq!(t.wire_size(), 132);
        assert!(t.image()[PROBE_HEADER_LEN..].iter().all(|&b| b == 0));
    }
}
