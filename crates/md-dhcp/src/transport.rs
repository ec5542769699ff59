//! Reply delivery: pick where a reply goes, then put it on the wire.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::frame::{self, FrameError};
use crate::hwaddr::MacAddr;
use crate::interface::Interface;
use crate::options::MessageType;
use crate::packet::{CLIENT_PORT, DhcpPacket, SERVER_PORT};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame construction failed: {0}")]
    Frame(#[from] FrameError),
}

/// Where a reply is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Unicast(SocketAddrV4),
    Broadcast(SocketAddrV4),
    /// Straight onto the link, addressed to the client's hardware address.
    RawEthernet { dst_mac: MacAddr, dst_ip: Ipv4Addr },
}

impl Delivery {
    fn broadcast() -> Self {
        Delivery::Broadcast(SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT))
    }
}

/// Decide how `reply` reaches the client that sent `request`.
///
/// Relay first, then NAK broadcast, then a client that already owns an
/// address, then the broadcast flag. Anything left has no usable IP yet
/// and gets a raw frame.
pub fn select_delivery(request: &DhcpPacket, reply: &DhcpPacket) -> Delivery {
    if !request.giaddr.is_unspecified() {
        return Delivery::Unicast(SocketAddrV4::new(request.giaddr, SERVER_PORT));
    }
    if reply.message_type() == Some(MessageType::Nak) {
        return Delivery::broadcast();
    }
    if !request.ciaddr.is_unspecified() {
        return Delivery::Unicast(SocketAddrV4::new(request.ciaddr, CLIENT_PORT));
    }
    if request.is_broadcast() {
        return Delivery::broadcast();
    }
    Delivery::RawEthernet {
        dst_mac: request.hw_addr(),
        dst_ip: reply.yiaddr,
    }
}

/// AF_PACKET sender bound to one interface.
pub struct RawSender {
    socket: Arc<Socket>,
    ifindex: i32,
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
}

impl RawSender {
    /// Open a packet socket on `interface`. Frames carry `src_ip` (the
    /// server identifier, or 0.0.0.0) as their source address.
    pub fn open(interface: &Interface, src_ip: Ipv4Addr) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::PACKET, Type::RAW, None)?;

        let src_mac = interface.hw_addr.unwrap_or_else(|| {
            warn!(
                "Interface {} has no hardware address, raw replies will use {}",
                interface.name,
                MacAddr::ZERO
            );
            MacAddr::ZERO
        });

        Ok(Self {
            socket: Arc::new(socket),
            ifindex: interface.index,
            src_mac,
            src_ip,
        })
    }

    pub async fn send(
        &self,
        dst_mac: MacAddr,
        dst_ip: Ipv4Addr,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let frame = frame::build_frame(self.src_mac, dst_mac, self.src_ip, dst_ip, payload)?;
        let addr = link_addr(self.ifindex, dst_mac);
        let socket = self.socket.clone();

        tokio::task::spawn_blocking(move || socket.send_to(&frame, &addr))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }
}

fn link_addr(ifindex: i32, dst: MacAddr) -> SockAddr {
    // SAFETY: sockaddr_storage is large and aligned enough for any
    // sockaddr, and all-zero is a valid bit pattern for both types.
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        let sll = &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_ll>();
        sll.sll_family = libc::AF_PACKET as libc::c_ushort;
        sll.sll_protocol = (libc::ETH_P_IP as u16).to_be();
        sll.sll_ifindex = ifindex;
        sll.sll_halen = 6;
        sll.sll_addr[..6].copy_from_slice(&dst.octets());
        SockAddr::new(
            storage,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    }
}

/// Outbound side of the server: the shared UDP socket plus, when an
/// interface is configured, the raw sender.
pub struct Transport {
    socket: Arc<UdpSocket>,
    raw: Option<RawSender>,
}

impl Transport {
    pub fn new(socket: Arc<UdpSocket>, raw: Option<RawSender>) -> Self {
        Self { socket, raw }
    }

    pub async fn send(&self, delivery: Delivery, reply: &DhcpPacket) -> Result<(), TransportError> {
        let bytes = reply.to_bytes();
        match delivery {
            Delivery::Unicast(addr) | Delivery::Broadcast(addr) => {
                debug!("Sending {} bytes to {}", bytes.len(), addr);
                self.socket.send_to(&bytes, SocketAddr::V4(addr)).await?;
            }
            Delivery::RawEthernet { dst_mac, dst_ip } => match &self.raw {
                Some(raw) => {
                    debug!("Sending {} byte raw frame to {} ({})", bytes.len(), dst_mac, dst_ip);
                    raw.send(dst_mac, dst_ip, &bytes).await?;
                }
                None => {
                    warn!("No interface configured for raw delivery to {}, broadcasting", dst_mac);
                    let addr = SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT);
                    self.socket.send_to(&bytes, SocketAddr::V4(addr)).await?;
                }
            },
        }
        Ok(())
    }
}
