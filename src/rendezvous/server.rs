//! Signaling HTTP server
//!
//! | Method | Path               | Response                                       |
//! |--------|--------------------|------------------------------------------------|
//! | POST   | `/offer`           | `{status:"ok"}` or 400 `{error}`               |
//! | GET    | `/offer/{peer_id}` | `{sdp, timestamp}` or 404 `{error}`            |
//! | GET    | `/peers`           | `{peers:[...]}`                                |
//! | OPTIONS| any                | empty 200 with CORS headers                    |
//! | *      | anything else      | plain-text banner, also for a wrong method     |
//!
//! Every response carries permissive CORS headers. The surface is public
//! and unauthenticated.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::Result;

use super::{OfferRequest, OfferResponse, PeersResponse, RendezvousStore};

/// Body served for any unrouted path
pub const BANNER: &str = "OpenMind Signaling Server";

type AppState = Arc<RendezvousStore>;

// ─────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────

/// Build the signaling router over `store`
pub fn router(store: Arc<RendezvousStore>) -> Router {
    // tower-http answers every OPTIONS request itself with an empty 200
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/offer", post(publish_offer))
        .route("/offer/{peer_id}", get(fetch_offer))
        .route("/peers", get(list_peers))
        .fallback(banner)
        .method_not_allowed_fallback(banner)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(store)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn publish_offer(State(store): State<AppState>, body: Bytes) -> Response {
    let request: OfferRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "Rejected malformed offer");
            return error_response(StatusCode::BAD_REQUEST, format!("invalid offer: {}", e));
        }
    };

    if request.peer_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "peerId cannot be empty");
    }

    store.publish(&request.peer_id, request.sdp);
    debug!(peer_id = %request.peer_id, "Offer stored");

    Json(json!({ "status": "ok" })).into_response()
}

async fn fetch_offer(State(store): State<AppState>, Path(peer_id): Path<String>) -> Response {
    match store.fetch(&peer_id) {
        Ok(record) => Json(OfferResponse {
            sdp: record.descriptor,
            timestamp: record.timestamp.timestamp_millis(),
        })
        .into_response(),
        Err(e) if e.is_not_found() => error_response(StatusCode::NOT_FOUND, "peer not found"),
        Err(e) => {
            warn!(peer_id = %peer_id, error = %e.format_for_log(), "Fetch failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn list_peers(State(store): State<AppState>) -> Json<PeersResponse> {
    Json(PeersResponse {
        peers: store.list_active(),
    })
}

async fn banner() -> &'static str {
    BANNER
}

// ─────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────

/// Signaling server with a background sweep of expired records
pub struct SignalServer {
    store: Arc<RendezvousStore>,
    purge_interval: Duration,
}

impl SignalServer {
    pub fn new(store: Arc<RendezvousStore>, purge_interval: Duration) -> Self {
        Self {
            store,
            purge_interval,
        }
    }

    pub fn store(&self) -> &Arc<RendezvousStore> {
        &self.store
    }

    /// Serve on `listener` until `shutdown` resolves
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            ttl_secs = self.store.ttl().as_secs(),
            "Signaling server listening"
        );

        let purge_task = tokio::spawn(purge_loop(Arc::clone(&self.store), self.purge_interval));

        let result = axum::serve(listener, router(Arc::clone(&self.store)))
            .with_graceful_shutdown(shutdown)
            .await;

        purge_task.abort();
        info!("Signaling server stopped");

        result.map_err(Into::into)
    }
}

async fn purge_loop(store: Arc<RendezvousStore>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let evicted = store.purge();
        if evicted > 0 {
            debug!(evicted, remaining = store.stored_count(), "Purged expired records");
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
