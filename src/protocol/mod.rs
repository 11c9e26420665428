//! Wire protocol
//!
//! Frames carried over an open channel, the signaling envelopes published
//! to the rendezvous service, and the channel protocol version.

mod frames;
pub mod signal;
mod version;

pub use frames::Frame;
pub use signal::{SignalEnvelope, SignalKind, SlotKind};
pub use version::{ProtocolVersion, PROTOCOL_VERSION};
