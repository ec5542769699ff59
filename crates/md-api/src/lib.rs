pub mod routes;
pub mod state;

use axum::Router;
use state::ApiState;
use tower_http::trace::TraceLayer;

/// Build the admin router with all `/dhcp/*` routes.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .nest("/dhcp", routes::dhcp::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
