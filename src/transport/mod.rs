//! Transport: turns two exchanged descriptors into an ordered channel
//!
//! A [`Transport`] is single-use. The initiator creates its descriptor
//! first and applies the responder's answer; the responder applies the
//! offer before creating its answer. Either side then calls
//! [`Transport::open`] to obtain a [`Channel`].

mod tcp;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::Frame;

pub use tcp::{TcpTransport, TcpTransportConfig, TcpTransportFactory};

// ─────────────────────────────────────────────────────────────────
// Transport trait
// ─────────────────────────────────────────────────────────────────

/// Which side of a handshake a transport plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Descriptor-producing connection primitive
#[async_trait]
pub trait Transport: Send {
    /// Produce the local descriptor to publish
    async fn create_local_descriptor(&mut self) -> Result<serde_json::Value>;

    /// Accept the descriptor published by the other side
    async fn apply_remote_descriptor(&mut self, descriptor: serde_json::Value) -> Result<()>;

    /// Complete connectivity; resolves once the channel is usable
    async fn open(&mut self) -> Result<Channel>;
}

/// Creates a fresh transport per negotiation attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self, role: Role) -> Box<dyn Transport>;
}

// ─────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────

/// Inbound activity on a channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Frame),
    Closed { reason: String },
}

/// An open, ordered, bidirectional frame path to one peer.
///
/// Dropping the outbound sender closes the channel from this side.
#[derive(Debug)]
pub struct Channel {
    peer_id: String,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<TransportEvent>,
}

impl Channel {
    pub fn from_parts(
        peer_id: impl Into<String>,
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            outbound,
            inbound,
        }
    }

    /// The remote peer's id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn into_parts(self) -> (String, mpsc::Sender<Frame>, mpsc::Receiver<TransportEvent>) {
        (self.peer_id, self.outbound, self.inbound)
    }

    /// Two in-process channels wired back to back.
    ///
    /// Closing one side delivers `Closed` to the other. Must be called
    /// inside a tokio runtime.
    pub fn pair(a: &str, b: &str, capacity: usize) -> (Channel, Channel) {
        let (a_out, a_to_b) = mpsc::channel(capacity);
        let (b_out, b_to_a) = mpsc::channel(capacity);
        let (a_in_tx, a_in) = mpsc::channel(capacity);
        let (b_in_tx, b_in) = mpsc::channel(capacity);

        tokio::spawn(forward(a_to_b, b_in_tx, a.to_string()));
        tokio::spawn(forward(b_to_a, a_in_tx, b.to_string()));

        (
            Channel::from_parts(b, a_out, a_in),
            Channel::from_parts(a, b_out, b_in),
        )
    }
}

async fn forward(
    mut frames: mpsc::Receiver<Frame>,
    events: mpsc::Sender<TransportEvent>,
    from: String,
) {
    while let Some(frame) = frames.recv().await {
        if events.send(TransportEvent::Message(frame)).await.is_err() {
            return;
        }
    }
    let _ = events
        .send(TransportEvent::Closed {
            reason: format!("{} closed the channel", from),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (alice, bob) = Channel::pair("alice", "bob", 8);
        assert_eq!(alice.peer_id(), "bob");
        assert_eq!(bob.peer_id(), "alice");

        let (_, alice_out, _alice_in) = alice.into_parts();
        let (_, _bob_out, mut bob_in) = bob.into_parts();

        for t in ["p", "i", "n"] {
            alice_out.send(Frame::token("r1", t)).await.unwrap();
        }
        for t in ["p", "i", "n"] {
            assert_eq!(
                bob_in.recv().await,
                Some(TransportEvent::Message(Frame::token("r1", t)))
            );
        }
    }

    #[tokio::test]
    async fn test_pair_close_is_observed() {
        let (alice, bob) = Channel::pair("alice", "bob", 8);
        let (_, _bob_out, mut bob_in) = bob.into_parts();
        drop(alice);

        assert!(matches!(bob_in.recv().await, Some(TransportEvent::Closed { .. })));
    }
}
