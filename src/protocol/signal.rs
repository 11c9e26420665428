//! Signaling envelopes and rendezvous slot keys
//!
//! The rendezvous service stores one opaque value per key. Negotiation
//! wraps the transport descriptor in a [`SignalEnvelope`] and writes it
//! under a slot key derived from the ordered pair of participants, so
//! both sides agree on the key no matter who initiates.
//!
//! ```text
//! presence:  "<peer-id>"             -> {kind: presence, from, descriptor: {name}}
//! offer:     "<lo>~<hi>~offer"       -> {kind: offer,  session, from, to, descriptor}
//! answer:    "<lo>~<hi>~answer"      -> {kind: answer, session, from, to, descriptor}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Separates the parts of a slot key; never valid inside a peer id
pub const SLOT_SEPARATOR: char = '~';

// ─────────────────────────────────────────────────────────────────
// Slot keys
// ─────────────────────────────────────────────────────────────────

/// Which half of a handshake a slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Offer,
    Answer,
}

impl SlotKind {
    fn as_str(&self) -> &'static str {
        match self {
            SlotKind::Offer => "offer",
            SlotKind::Answer => "answer",
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical slot key for the pair `(a, b)`; symmetric in its arguments
pub fn slot_key(a: &str, b: &str, kind: SlotKind) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}{sep}{hi}{sep}{kind}", sep = SLOT_SEPARATOR)
}

/// Whether a rendezvous key is a negotiation slot rather than a peer id
pub fn is_slot_key(key: &str) -> bool {
    key.contains(SLOT_SEPARATOR)
}

/// Split a slot key into its ordered participants and kind
pub fn parse_slot_key(key: &str) -> Option<(&str, &str, SlotKind)> {
    let mut parts = key.split(SLOT_SEPARATOR);
    let lo = parts.next()?;
    let hi = parts.next()?;
    let kind = match parts.next()? {
        "offer" => SlotKind::Offer,
        "answer" => SlotKind::Answer,
        _ => return None,
    };
    if parts.next().is_some() || lo.is_empty() || hi.is_empty() || lo > hi {
        return None;
    }
    Some((lo, hi, kind))
}

/// Reject ids that would collide with slot keys
pub fn validate_peer_id(peer_id: &str) -> Result<()> {
    if peer_id.trim().is_empty() {
        return Err(Error::malformed("peer id cannot be empty"));
    }
    if is_slot_key(peer_id) {
        return Err(Error::malformed(format!(
            "peer id '{}' must not contain '{}'",
            peer_id, SLOT_SEPARATOR
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Presence,
    Offer,
    Answer,
}

/// What the negotiator publishes as the rendezvous `sdp` value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub kind: SignalKind,

    /// Correlates an answer with the offer it responds to
    pub session: Uuid,

    pub from: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Transport descriptor, carried untouched
    #[serde(default)]
    pub descriptor: serde_json::Value,
}

impl SignalEnvelope {
    pub fn presence(from: impl Into<String>, descriptor: serde_json::Value) -> Self {
        Self {
            kind: SignalKind::Presence,
            session: Uuid::nil(),
            from: from.into(),
            to: None,
            descriptor,
        }
    }

    pub fn offer(
        session: Uuid,
        from: impl Into<String>,
        to: impl Into<String>,
        descriptor: serde_json::Value,
    ) -> Self {
        Self {
            kind: SignalKind::Offer,
            session,
            from: from.into(),
            to: Some(to.into()),
            descriptor,
        }
    }

    pub fn answer(
        session: Uuid,
        from: impl Into<String>,
        to: impl Into<String>,
        descriptor: serde_json::Value,
    ) -> Self {
        Self {
            kind: SignalKind::Answer,
            session,
            from: from.into(),
            to: Some(to.into()),
            descriptor,
        }
    }

    /// Whether this envelope is addressed to `peer_id`
    pub fn is_for(&self, peer_id: &str) -> bool {
        self.to.as_deref() == Some(peer_id)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::Internal(format!("envelope encode: {}", e)))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::malformed(format!("signal envelope: {}", e)))
    }
}
