use md_dhcp::SharedDhcpState;
use std::path::PathBuf;

/// Shared application state for all API routes.
#[derive(Clone)]
pub struct ApiState {
    pub dhcp: SharedDhcpState,
    /// Path to minidhcp.yaml; every accepted change is written back here.
    pub config_path: PathBuf,
}
