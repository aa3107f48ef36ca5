//! HTTP surface
//!
//! | Method | Path           | Purpose                                  |
//! |--------|----------------|------------------------------------------|
//! | POST   | `/api/flash`   | start a run, optionally streaming events |
//! | GET    | `/api/devices` | list candidate target devices            |
//! | GET    | `/api/health`  | liveness and version                     |

pub mod error;
pub mod handlers;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/flash", post(handlers::flash))
        .route("/devices", get(handlers::devices))
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the process receives Ctrl-C
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}
