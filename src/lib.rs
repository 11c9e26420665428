//! OpenMind Peer
//!
//! Peer-to-peer signaling and token streaming. A donor peer owns a local
//! model daemon and publishes its presence on a rendezvous service; an
//! asking peer discovers it, negotiates a direct channel through the same
//! rendezvous, and streams generations over that channel.
//!
//! - [`rendezvous`]: TTL record store, HTTP server and client, discovery
//! - [`negotiator`]: offer/answer handshake that yields a [`transport::Channel`]
//! - [`stream`]: request/response multiplexing over an open channel
//! - [`donor`]: serving side, backed by an [`backend::InferenceBackend`]

pub mod backend;
pub mod cli;
pub mod config;
pub mod context;
pub mod donor;
pub mod error;
pub mod identity;
pub mod logging;
pub mod negotiator;
pub mod protocol;
pub mod rendezvous;
pub mod stream;
pub mod transport;
pub mod version;

pub use error::{Error, Result};
