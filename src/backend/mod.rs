//! Backend module for token generation
//!
//! This module provides the abstraction the donor side generates through,
//! plus a real Ollama implementation and a scripted mock.

mod mock;
mod ollama;
mod traits;

pub use mock::{MockBackend, MockConfig};
pub use ollama::{OllamaBackend, OllamaConfig};
pub use traits::*;
