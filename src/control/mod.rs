//! Control surface: Axum HTTP server for status and operator commands.
//!
//! Read-only endpoints expose health, the risk snapshot, recent
//! opportunities and the audit history. The two write endpoints
//! (`POST /settings`, `POST /reset-halt`) require a bearer token.

pub mod routes;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub use routes::{AppState, ControlState};

/// Start the control server in a background task. It stops when the
/// shutdown flag flips.
pub fn spawn_control(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(port, error = %e, "Failed to bind control port");
                return;
            }
        };
        info!(port, "Control server listening on http://localhost:{port}");

        let stop = async move {
            let _ = shutdown.changed().await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
            error!(error = %e, "Control server error");
        }
    })
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .route("/opportunities", get(routes::opportunities))
        .route("/audit", get(routes::audit))
        .route("/audit/report", get(routes::audit_report))
        .route("/settings", post(routes::update_settings))
        .route("/reset-halt", post(routes::reset_halt))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
