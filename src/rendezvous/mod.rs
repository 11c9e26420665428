//! Rendezvous: ephemeral descriptor exchange between peers
//!
//! - [`RendezvousStore`]: in-memory TTL store
//! - [`SignalServer`]: the store served over HTTP
//! - [`RendezvousClient`]: HTTP client for a remote signaling server
//! - [`PeerDirectory`]: discovery on top of any [`Rendezvous`]

mod client;
mod directory;
mod server;
mod store;

use serde::{Deserialize, Serialize};

pub use client::RendezvousClient;
pub use directory::PeerDirectory;
pub use server::{router, SignalServer, BANNER};
pub use store::{PeerRecord, Rendezvous, RendezvousStore, SharedRendezvous, DEFAULT_TTL};

// ─────────────────────────────────────────────────────────────────
// HTTP wire types
// ─────────────────────────────────────────────────────────────────

/// `POST /offer` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    pub peer_id: String,
    pub sdp: serde_json::Value,
}

/// `GET /offer/{peerId}` success body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferResponse {
    pub sdp: serde_json::Value,

    /// Publish time, milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// `GET /peers` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<String>,
}
