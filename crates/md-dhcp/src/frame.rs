//! Ethernet II / IPv4 / UDP framing for replies that must bypass the IP
//! stack (client has no usable address yet and did not ask for broadcast).

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::hwaddr::MacAddr;
use crate::packet::{CLIENT_PORT, SERVER_PORT};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
const ETH_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const IPPROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit in one IPv4 datagram")]
    PayloadTooLarge(usize),
}

/// RFC 1071 one's-complement checksum over `data`, seeded with `initial`.
fn ones_complement_sum(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn ipv4_checksum(header: &[u8]) -> u16 {
    fold(ones_complement_sum(header, 0))
}

/// UDP checksum including the IPv4 pseudo-header. A computed zero is sent
/// as 0xffff, since zero on the wire means "no checksum".
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = IPPROTO_UDP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = ones_complement_sum(segment, ones_complement_sum(&pseudo, 0));
    match fold(sum) {
        0 => 0xffff,
        c => c,
    }
}

/// Build a complete frame carrying `payload` from the DHCP server port to
/// the client port.
pub fn build_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let ip_len = IPV4_HEADER_LEN + udp_len;
    let total_len =
        u16::try_from(ip_len).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + ip_len);

    // Ethernet II
    frame.extend_from_slice(&dst_mac.octets());
    frame.extend_from_slice(&src_mac.octets());
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    // IPv4
    let ip_start = frame.len();
    frame.push(0x45);
    frame.push(0x00);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]); // identification
    frame.extend_from_slice(&FLAG_DONT_FRAGMENT.to_be_bytes());
    frame.push(DEFAULT_TTL);
    frame.push(IPPROTO_UDP);
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&src_ip.octets());
    frame.extend_from_slice(&dst_ip.octets());
    let ip_cksum = ipv4_checksum(&frame[ip_start..]);
    frame[ip_start + 10..ip_start + 12].copy_from_slice(&ip_cksum.to_be_bytes());

    // UDP
    let udp_start = frame.len();
    frame.extend_from_slice(&SERVER_PORT.to_be_bytes());
    frame.extend_from_slice(&CLIENT_PORT.to_be_bytes());
    frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(payload);
    let udp_cksum = udp_checksum(src_ip, dst_ip, &frame[udp_start..]);
    frame[udp_start + 6..udp_start + 8].copy_from_slice(&udp_cksum.to_be_bytes());

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_checksum_known_header() {
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let cksum = ipv4_checksum(&header);
        assert_eq!(cksum, 0xb861);

        let mut with_cksum = header;
        with_cksum[10..12].copy_from_slice(&cksum.to_be_bytes());
        assert_eq!(ipv4_checksum(&with_cksum), 0);
    }

    #[test]
    fn test_odd_length_checksum_pads_with_zero() {
        assert_eq!(
            fold(ones_complement_sum(&[0x01, 0x02, 0x03], 0)),
            fold(ones_complement_sum(&[0x01, 0x02, 0x03, 0x00], 0))
        );
    }

    #[test]
    fn test_frame_layout() {
        let src_mac = MacAddr([0x02, 0, 0, 0, 0, 1]);
        let dst_mac = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        let src_ip = Ipv4Addr::new(192, 168, 0, 1);
        let dst_ip = Ipv4Addr::new(192, 168, 0, 10);
        let payload = vec![0x5a; 300];

        let frame = build_frame(src_mac, dst_mac, src_ip, dst_ip, &payload).unwrap();
        assert_eq!(frame.len(), 14 + 20 + 8 + 300);

        assert_eq!(&frame[0..6], &dst_mac.octets());
        assert_eq!(&frame[6..12], &src_mac.octets());
        assert_eq!(&frame[12..14], &[0x08, 0x00]);

        let ip = &frame[14..34];
        assert_eq!(ip[0], 0x45);
        assert_eq!(u16::from_be_bytes([ip[2], ip[3]]), 328);
        assert_eq!(u16::from_be_bytes([ip[6], ip[7]]) & 0x4000, 0x4000);
        assert_eq!(ip[8], 64);
        assert_eq!(ip[9], 17);
        assert_eq!(&ip[12..16], &src_ip.octets());
        assert_eq!(&ip[16..20], &dst_ip.octets());
        assert_eq!(ipv4_checksum(ip), 0);

        let udp = &frame[34..];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 67);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 68);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]), 308);
        assert_ne!(u16::from_be_bytes([udp[6], udp[7]]), 0);
        assert_eq!(&udp[8..], payload.as_slice());

        // Verifying over pseudo-header + segment with the checksum in place
        // folds to zero.
        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&src_ip.octets());
        pseudo.extend_from_slice(&dst_ip.octets());
        pseudo.extend_from_slice(&[0, 17]);
        pseudo.extend_from_slice(&308u16.to_be_bytes());
        assert_eq!(fold(ones_complement_sum(udp, ones_complement_sum(&pseudo, 0))), 0);
    }

    #[test]
    fn test_oversized_payload() {
        let payload = vec![0; 70_000];
        assert_eq!(
            build_frame(
                MacAddr::ZERO,
                MacAddr::ZERO,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                &payload
            ),
            Err(FrameError::PayloadTooLarge(70_000))
        );
    }
}
