//! Donor side: the peer that owns a model daemon and serves other peers
//!
//! [`DonorService`] keeps the presence record fresh and answers offers;
//! each resulting channel is handed to [`serve_channel`].

mod responder;
mod service;

pub use responder::{serve_channel, ServeSummary};
pub use service::{DonorConfig, DonorService};
