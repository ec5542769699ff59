use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::SharedDhcpState;
use crate::engine;
use crate::interface::Interface;
use crate::packet::{DhcpPacket, SERVER_PORT};
use crate::transport::{self, RawSender, Transport};

const MAX_DATAGRAM: usize = 1 << 16;

/// Running DHCP server: one receive loop plus a task per exchange.
pub struct DhcpServer {
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
    task: JoinHandle<std::io::Result<()>>,
}

/// Stops the receive loop. In-flight exchanges are not awaited.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

impl DhcpServer {
    /// Bind 0.0.0.0:67 (on the configured interface, if any) and start
    /// serving.
    pub async fn start(state: SharedDhcpState) -> Result<Self> {
        Self::start_on(state, SocketAddr::from((Ipv4Addr::UNSPECIFIED, SERVER_PORT))).await
    }

    pub async fn start_on(state: SharedDhcpState, addr: SocketAddr) -> Result<Self> {
        let (interface_name, server_id) = {
            let s = state.read().await;
            (s.config.interface.clone(), s.server_id)
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind DHCP socket on {addr}"))?;

        let raw = if interface_name.is_empty() {
            None
        } else {
            let interface = Interface::lookup(&interface_name)?;
            #[cfg(target_os = "linux")]
            socket.bind_device(Some(interface_name.as_bytes()))?;
            info!("DHCP bound to interface {} (index {})", interface.name, interface.index);

            let raw = RawSender::open(&interface, server_id.unwrap_or(Ipv4Addr::UNSPECIFIED))
                .with_context(|| format!("failed to open packet socket on {interface_name}"))?;
            Some(raw)
        };

        socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);
        let local_addr = socket.local_addr()?;
        let transport = Arc::new(Transport::new(socket.clone(), raw));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(receive_loop(socket, state, transport, rx));

        info!("DHCP server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown: ShutdownHandle(Arc::new(tx)),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Resolve when the receive loop ends: `Ok` after a shutdown, the read
    /// error otherwise.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .context("DHCP receive loop panicked")?
            .context("DHCP receive failed")
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    state: SharedDhcpState,
    transport: Arc<Transport>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.changed() => {
                info!("DHCP server stopping");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => received?,
        };

        let request = match DhcpPacket::parse(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                debug!("Invalid DHCP packet from {}: {}", src, e);
                continue;
            }
        };

        tokio::spawn(run_exchange(request, state.clone(), transport.clone()));
    }
}

async fn run_exchange(request: DhcpPacket, state: SharedDhcpState, transport: Arc<Transport>) {
    // Held until the lease is committed; reconfiguration waits for it.
    let guard = state.read_owned().await;

    // Lease assignment syncs the log to disk.
    let outcome = tokio::task::spawn_blocking(move || {
        let reply = engine::handle_exchange(&request, &guard.store, guard.server_id);
        (request, reply)
    })
    .await;

    let (request, reply) = match outcome {
        Ok((request, Ok(reply))) => (request, reply),
        Ok((request, Err(e))) if e.is_protocol_violation() => {
            debug!("Dropping request from {}: {}", request.hw_addr(), e);
            return;
        }
        Ok((request, Err(e))) => {
            warn!("DHCP exchange for {} failed: {}", request.hw_addr(), e);
            return;
        }
        Err(e) => {
            warn!("DHCP exchange task failed: {}", e);
            return;
        }
    };

    let delivery = transport::select_delivery(&request, &reply);
    if let Err(e) = transport.send(delivery, &reply).await {
        warn!("Failed to deliver reply to {} via {:?}: {}", request.hw_addr(), delivery, e);
    }
}
