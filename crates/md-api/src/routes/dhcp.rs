use std::net::Ipv4Addr;
use std::time::SystemTime;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use md_dhcp::config::MatchPolicy;
use md_dhcp::{DhcpState, MacAddr, Role};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::state::ApiState;

const RCODE_SUCCESS: &str = "QS000000";
const RCODE_FAILURE: &str = "QS999999";

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/config", post(set_config))
        .route("/range", post(set_range))
        .route("/staticroute", post(set_static_route))
        .route("/lease", get(get_lease_log).post(get_lease_log))
        .route("/leases", get(get_leases))
}

/// Every request body wraps its payload in `rdata`.
#[derive(Deserialize)]
struct Envelope<T> {
    rdata: T,
}

#[derive(Deserialize)]
struct ServiceSettings {
    #[serde(rename = "netInterface", default)]
    net_interface: Option<String>,
    #[serde(default)]
    allocate: Option<MatchPolicy>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpRange {
    #[serde(default)]
    name: String,
    ip_range: String,
    #[serde(default)]
    lease_time: String,
    #[serde(default)]
    ip_mask: String,
    #[serde(rename = "Gateway", default)]
    gateway: String,
    #[serde(default)]
    dns: String,
}

#[derive(Deserialize)]
struct StaticRoute {
    mac: String,
    ip: String,
}

struct ApiError(String);

impl<E: std::fmt::Display> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!("DHCP API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"rcode": RCODE_FAILURE, "rmsg": self.0})),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn success(rdata: Value) -> ApiResult {
    Ok(Json(json!({"rcode": RCODE_SUCCESS, "rmsg": "success", "rdata": rdata})))
}

async fn set_config(
    State(state): State<ApiState>,
    body: Result<Json<Envelope<ServiceSettings>>, JsonRejection>,
) -> ApiResult {
    let Json(Envelope { rdata }) = body?;

    let mut dhcp = state.dhcp.write().await;
    let mut config = dhcp.config.clone();
    if let Some(interface) = rdata.net_interface {
        info!("DHCP interface set to {:?} (applies on restart)", interface);
        config.interface = interface;
    }
    if let Some(policy) = rdata.allocate {
        config.allocate = policy;
    }
    config.save(&state.config_path)?;
    dhcp.config = config;
    success(json!("success"))
}

/// Apply one or more pool definitions. Entries are matched to pools by
/// name; anything unrecognised updates the guest pool.
async fn set_range(
    State(state): State<ApiState>,
    body: Result<Json<Envelope<Vec<IpRange>>>, JsonRejection>,
) -> ApiResult {
    let Json(Envelope { rdata }) = body?;

    let mut dhcp = state.dhcp.write().await;
    let mut config = dhcp.config.clone();

    for range in rdata {
        let role = range.name.parse().unwrap_or(Role::Guest);
        let Some((start, stop)) = range.ip_range.split_once('-') else {
            return Err(ApiError(format!(
                "ipRange {:?} must be <start>-<stop>",
                range.ip_range
            )));
        };

        let subnet = config.subnet_mut(role);
        subnet.ip_start = start.trim().to_string();
        subnet.ip_stop = stop.trim().to_string();
        if !range.ip_mask.trim().is_empty() {
            subnet.netmask = range.ip_mask.trim().to_string();
        }
        subnet.router = range.gateway.trim().to_string();
        subnet.dns = range.dns.trim().to_string();
        if !range.lease_time.trim().is_empty() {
            subnet.lease_time = range.lease_time.trim().to_string();
        }
    }

    let next = DhcpState::from_config(config)?;
    next.config.save(&state.config_path)?;
    info!("DHCP pools reconfigured ({} leases replayed)", next.store.len());
    *dhcp = next;
    success(json!("success"))
}

async fn set_static_route(
    State(state): State<ApiState>,
    body: Result<Json<Envelope<Vec<StaticRoute>>>, JsonRejection>,
) -> ApiResult {
    let Json(Envelope { rdata }) = body?;
    let Some(route) = rdata.first() else {
        return Err(ApiError("static route list is empty".to_string()));
    };

    let mac: MacAddr = route.mac.trim().parse()?;
    let ip: Ipv4Addr = route.ip.trim().parse()?;

    let mut dhcp = state.dhcp.write().await;
    let mut config = dhcp.config.clone();
    config.static_route = format!("{mac} {ip}");
    config.save(&state.config_path)?;
    dhcp.config = config;
    success(json!("success"))
}

/// Raw lease log, one `mac ip expiry role` line per record.
async fn get_lease_log(State(state): State<ApiState>) -> ApiResult {
    let store = state.dhcp.read().await.store.clone();
    let content = store.raw_log()?;
    success(json!(content))
}

async fn get_leases(State(state): State<ApiState>) -> ApiResult {
    let store = state.dhcp.read().await.store.clone();
    let now = SystemTime::now();
    let leases: Vec<Value> = store
        .records()
        .iter()
        .map(|l| {
            json!({
                "mac": l.mac.to_string(),
                "ip": l.ip.to_string(),
                "expiry": l.expiry,
                "remaining": l.remaining_secs(now),
                "role": l.role,
            })
        })
        .collect();
    success(json!(leases))
}
