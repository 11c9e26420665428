//! Generation streaming over open channels
//!
//! - [`StreamMultiplexer`]: requesting side, many sessions per channel
//! - [`ChannelRegistry`]: caller-owned conversation → channel map
//! - [`GenerationSession`]: per-request state

mod multiplexer;
mod registry;
mod session;

pub use multiplexer::{ChannelState, GenerationHandle, StreamMultiplexer};
pub use registry::ChannelRegistry;
pub use session::{GenerationSession, SessionState};
