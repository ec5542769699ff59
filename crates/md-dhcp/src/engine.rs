//! Per-exchange protocol logic: DISCOVER → OFFER, REQUEST → ACK.

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{debug, info};

use crate::lease_store::{LeaseError, LeaseStore};
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket};

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("opcode {0} is not BOOTREQUEST")]
    Opcode(u8),
    #[error("request carries no message type")]
    MissingMessageType,
    #[error("unsupported message type {0}")]
    UnsupportedMessage(MessageType),
    #[error("request is addressed to server {0}")]
    ForeignServer(Ipv4Addr),
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl ExchangeError {
    /// Protocol-rule violations are routine traffic on a shared segment;
    /// everything else means this server failed a client.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, ExchangeError::Lease(_))
    }
}

/// Request and reply message types for an exchange, or why there is none.
pub fn transition(request: &DhcpPacket) -> Result<(MessageType, MessageType), ExchangeError> {
    if request.op != BOOTREQUEST {
        return Err(ExchangeError::Opcode(request.op));
    }
    match request.message_type() {
        Some(MessageType::Discover) => Ok((MessageType::Discover, MessageType::Offer)),
        Some(MessageType::Request) => Ok((MessageType::Request, MessageType::Ack)),
        Some(other) => Err(ExchangeError::UnsupportedMessage(other)),
        None => Err(ExchangeError::MissingMessageType),
    }
}

/// Run one exchange against the lease store and return the reply to send.
///
/// A request naming a different server identifier is dropped before any
/// lease state is touched. With no configured identifier the check is
/// skipped and option 54 is left out of the reply.
pub fn handle_exchange(
    request: &DhcpPacket,
    store: &LeaseStore,
    server_id: Option<Ipv4Addr>,
) -> Result<DhcpPacket, ExchangeError> {
    let (request_type, msg_type) = transition(request)?;
    let mac = request.hw_addr();

    if let (Some(ours), Some(theirs)) = (server_id, request.server_id()) {
        if ours != theirs {
            debug!("{} from {} for different server {}", request_type, mac, theirs);
            return Err(ExchangeError::ForeignServer(theirs));
        }
    }

    info!("{} from {}", request_type, mac);

    let pool_index = store.classify(mac);
    let assignment = store.assign_or_extend(mac, pool_index)?;
    let pool = store
        .pool(pool_index)
        .ok_or(LeaseError::UnknownPool(pool_index))?;

    let mut reply = request.new_reply(msg_type);
    reply.yiaddr = assignment.ip;
    reply.update_option(DhcpOption::lease_time(
        u32::try_from(assignment.lease_time.as_secs()).unwrap_or(u32::MAX),
    ));
    reply.update_option(DhcpOption::subnet_mask(pool.netmask));
    if let Some(router) = pool.router {
        reply.update_option(DhcpOption::router(router));
    }
    if let Some(dns) = pool.dns {
        reply.update_option(DhcpOption::dns_server(dns));
    }
    if let Some(id) = server_id {
        reply.siaddr = id;
        reply.update_option(DhcpOption::server_id(id));
    }

    info!(
        "{} {} to {} ({} pool, {}s)",
        msg_type,
        assignment.ip,
        mac,
        pool.role,
        assignment.lease_time.as_secs()
    );
    Ok(reply)
}
