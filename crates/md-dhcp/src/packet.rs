//! DHCPv4 message codec (RFC 2131 fixed header + RFC 2132 options)

use std::net::Ipv4Addr;
use thiserror::Error;

use crate::hwaddr::MacAddr;
use crate::options::{self, DhcpOption, MessageType, OPT_MSG_TYPE, OPT_SERVER_ID};

/// DHCP magic cookie
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const FIXED_HEADER_LEN: usize = 236;
const MIN_PACKET_LEN: usize = FIXED_HEADER_LEN + MAGIC_COOKIE.len();
const BOOTP_MIN_LEN: usize = 300;
const BROADCAST_FLAG: u16 = 0x8000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes (minimum 240)")]
    TooShort(usize),
    #[error("invalid magic cookie")]
    InvalidMagic,
    #[error("hardware address length {0} exceeds chaddr")]
    BadHardwareLength(u8),
    #[error("option {0} runs past the end of the packet")]
    TruncatedOption(u8),
}

#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

fn ipv4_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

impl DhcpPacket {
    /// Decode a datagram.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < MIN_PACKET_LEN {
            return Err(PacketError::TooShort(data.len()));
        }
        if data[FIXED_HEADER_LEN..MIN_PACKET_LEN] != MAGIC_COOKIE {
            return Err(PacketError::InvalidMagic);
        }
        if data[2] as usize > 16 {
            return Err(PacketError::BadHardwareLength(data[2]));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        let options = options::parse_options(&data[MIN_PACKET_LEN..])?;

        Ok(DhcpPacket {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: ipv4_at(data, 12),
            yiaddr: ipv4_at(data, 16),
            siaddr: ipv4_at(data, 20),
            giaddr: ipv4_at(data, 24),
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Encode, padded to the BOOTP minimum of 300 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(576);

        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
        buf.extend_from_slice(&MAGIC_COOKIE);

        options::encode_options(&self.options, &mut buf);

        if buf.len() < BOOTP_MIN_LEN {
            buf.resize(BOOTP_MIN_LEN, 0);
        }
        buf
    }

    /// Client hardware address (first six octets of chaddr).
    pub fn hw_addr(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        MacAddr(mac)
    }

    pub fn get_option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|o| o.code == code)
    }

    /// Replace an existing option with the same code, or append it.
    pub fn update_option(&mut self, option: DhcpOption) {
        match self.options.iter_mut().find(|o| o.code == option.code) {
            Some(existing) => *existing = option,
            None => self.options.push(option),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.get_option(OPT_MSG_TYPE)?.as_u8()?)
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_SERVER_ID)?.as_ipv4()
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    pub fn set_broadcast(&mut self, broadcast: bool) {
        if broadcast {
            self.flags |= BROADCAST_FLAG;
        } else {
            self.flags &= !BROADCAST_FLAG;
        }
    }

    /// Reply skeleton correlated to this request.
    ///
    /// Echoes xid, hardware type/length/address, flags and giaddr; the
    /// message type is the first option. ciaddr is echoed only for ACK
    /// (RFC 2131 §4.3.1 Table 3).
    pub fn new_reply(&self, msg_type: MessageType) -> DhcpPacket {
        let ciaddr = if msg_type == MessageType::Ack {
            self.ciaddr
        } else {
            Ipv4Addr::UNSPECIFIED
        };

        DhcpPacket {
            op: BOOTREPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![DhcpOption::msg_type(msg_type)],
        }
    }

    /// A bare BOOTREQUEST carrying only a message type, for building
    /// requests in tests and tools.
    pub fn new_request(msg_type: MessageType, mac: MacAddr, xid: u32) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac.octets());

        DhcpPacket {
            op: BOOTREQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![DhcpOption::msg_type(msg_type)],
        }
    }
}
