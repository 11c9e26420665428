//! Channel registry: which open channel serves which conversation
//!
//! Owned and passed around by the caller; there is no process-wide
//! "active connection".

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::StreamMultiplexer;

#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, StreamMultiplexer>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conversation` to `mux`, closing any channel it replaces
    pub fn insert(&self, conversation: impl Into<String>, mux: StreamMultiplexer) {
        let conversation = conversation.into();
        if let Some(previous) = self.channels.write().insert(conversation.clone(), mux) {
            debug!(conversation = %conversation, peer = %previous.peer_id(), "Replacing channel");
            previous.close();
        }
    }

    /// The open channel for `conversation`. A closed one is forgotten.
    pub fn get(&self, conversation: &str) -> Option<StreamMultiplexer> {
        let mux = self.channels.read().get(conversation).cloned()?;
        if mux.is_open() {
            return Some(mux);
        }
        self.channels.write().remove(conversation);
        None
    }

    /// Close and forget the channel for `conversation`
    pub fn close(&self, conversation: &str) -> bool {
        match self.channels.write().remove(conversation) {
            Some(mux) => {
                mux.close();
                true
            }
            None => false,
        }
    }

    /// Forget every channel that is no longer open
    pub fn prune_closed(&self) -> usize {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|_, mux| mux.is_open());
        before - channels.len()
    }

    pub fn close_all(&self) {
        for (_, mux) in self.channels.write().drain() {
            mux.close();
        }
    }

    pub fn conversations(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}
