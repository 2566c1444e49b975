pub mod signal;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub use signal::{ConnectionMap, GATEWAY_DEVICE_ID};

#[derive(Clone, Default)]
pub struct AppState {
    pub connections: ConnectionMap,
}

impl axum::extract::FromRef<AppState> for ConnectionMap {
    fn from_ref(state: &AppState) -> Self {
        state.connections.clone()
    }
}

#[derive(Serialize)]
struct Health {
    registered_devices: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let registered_devices = state.connections.read().await.len();
    Json(Health { registered_devices })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Camlink Gateway Online" }))
        .route("/health", get(health))
        .route("/ws", get(signal::ws_handler))
        .with_state(state)
}

/// Serves the gateway on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
