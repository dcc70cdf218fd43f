//! REST API implementation
//!
//! Exposes the schedule's state and operator actions (acknowledge, purge,
//! silence, check now) plus ad-hoc expression evaluation over HTTP.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};

/// HTTP API server
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serve until `cancel` fires
    pub async fn serve(self, addr: &str, cancel: CancellationToken) -> Result<()> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = create_router(self.state)
            .layer(TraceLayer::new_for_http())
            .layer(cors);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("bind {addr}: {e}")))?;

        info!("HTTP server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| Error::internal(e.to_string()))?;

        Ok(())
    }
}
