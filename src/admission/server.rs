//! HTTP server fronted by the rate limit middleware.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::RateLimitLayer;
use crate::error::Result;
use crate::ratelimit::Store;

/// HTTP server exposing a limited endpoint plus unlimited health and admin
/// routes.
pub struct HttpServer<St: Store + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The store shared by the middleware and the admin routes
    store: Arc<St>,
    layer: RateLimitLayer<St>,
}

impl<St: Store + 'static> HttpServer<St> {
    /// Create a new server. The admin routes act on the layer's store.
    pub fn new(addr: SocketAddr, layer: RateLimitLayer<St>) -> Self {
        Self {
            addr,
            store: layer.store().clone(),
            layer,
        }
    }

    /// Build the application router.
    pub fn router(&self) -> Router {
        let limited = Router::new()
            .route("/", get(admitted))
            .layer(self.layer.clone());

        let open = Router::new()
            .route("/health", get(health))
            .route("/admin/reset", post(reset::<St>))
            .with_state(self.store.clone());

        limited.merge(open)
    }

    /// Start the server and run until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

async fn admitted() -> Json<serde_json::Value> {
    Json(json!({ "status": "admitted" }))
}

async fn health() -> &'static str {
    "OK"
}

async fn reset<St: Store>(State(store): State<Arc<St>>) -> Response {
    match store.reset().await {
        Ok(()) => {
            info!("Rate limit state reset");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!(error = %err, "Rate limit reset failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
