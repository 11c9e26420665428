//! Peer directory: who is currently reachable through the rendezvous service

use tracing::{debug, warn};

use crate::protocol::signal::is_slot_key;

use super::SharedRendezvous;

pub struct PeerDirectory {
    rendezvous: SharedRendezvous,
}

impl PeerDirectory {
    pub fn new(rendezvous: SharedRendezvous) -> Self {
        Self { rendezvous }
    }

    /// Active peer ids other than `self_id`, sorted.
    ///
    /// Never fails: an unreachable rendezvous service reads as "no peers".
    pub async fn discover(&self, self_id: &str) -> Vec<String> {
        let keys = match self.rendezvous.list_active().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e.format_for_log(), "Peer discovery failed, treating as no peers");
                return Vec::new();
            }
        };

        let mut peers: Vec<String> = keys
            .into_iter()
            .filter(|key| key != self_id && !is_slot_key(key))
            .collect();
        peers.sort();

        debug!(count = peers.len(), "Discovered peers");
        peers
    }
}
