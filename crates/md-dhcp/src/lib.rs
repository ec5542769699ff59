pub mod allocator;
pub mod config;
pub mod engine;
pub mod frame;
pub mod hwaddr;
pub mod interface;
pub mod lease_store;
pub mod options;
pub mod packet;
pub mod server;
pub mod transport;

pub use config::{DhcpConfig, Pool, Role};
pub use hwaddr::MacAddr;
pub use lease_store::{Lease, LeaseStore};
pub use server::DhcpServer;

use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Lease(#[from] lease_store::LeaseError),
}

/// Live server state. The store is swapped wholesale on reconfiguration;
/// exchanges already holding the old `Arc` finish against it.
pub struct DhcpState {
    pub config: DhcpConfig,
    pub store: Arc<LeaseStore>,
    pub server_id: Option<Ipv4Addr>,
}

impl DhcpState {
    pub fn from_config(config: DhcpConfig) -> Result<Self, SetupError> {
        let server_id = config.server_ip()?;
        let store = LeaseStore::open(config.pools()?, &config.lease_file)?;
        Ok(Self {
            config,
            store: Arc::new(store),
            server_id,
        })
    }

    /// Validate `config`, replay the lease log under its pools and swap the
    /// result in. On error nothing changes.
    pub fn reconfigure(&mut self, config: DhcpConfig) -> Result<(), SetupError> {
        let next = Self::from_config(config)?;
        info!(
            "DHCP pools reconfigured ({} leases replayed)",
            next.store.len()
        );
        *self = next;
        Ok(())
    }
}

pub type SharedDhcpState = Arc<RwLock<DhcpState>>;
