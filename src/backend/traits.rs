//! Backend trait definitions
//!
//! Defines the InferenceBackend trait the donor side streams from.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

// ─────────────────────────────────────────────────────────────────
// Requests & Health
// ─────────────────────────────────────────────────────────────────

/// One generation as received from a requesting peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub request_id: String,
    pub model: String,
    pub prompt: String,
}

/// Health status of a backend
#[derive(Debug, Clone)]
pub struct BackendHealth {
    /// Whether the backend is reachable and answering
    pub operational: bool,

    /// Models the backend can serve right now
    pub models: Vec<String>,

    /// Any error message
    pub error: Option<String>,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self {
            operational: true,
            models: Vec::new(),
            error: None,
        }
    }
}

impl BackendHealth {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            operational: false,
            models: Vec::new(),
            error: Some(error.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// InferenceBackend Trait
// ─────────────────────────────────────────────────────────────────

/// A token-producing inference engine
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name (e.g., "ollama", "mock")
    fn name(&self) -> &'static str;

    async fn health_check(&self) -> Result<BackendHealth>;

    /// Stream the output of `request` into `tokens`, returning once
    /// generation has finished.
    ///
    /// A closed `tokens` receiver means the requester went away; the
    /// backend should stop and return `Ok(())`.
    async fn generate_stream(&self, request: &GenerateRequest, tokens: mpsc::Sender<String>) -> Result<()>;
}

/// Type alias for a shared backend reference
pub type SharedBackend = Arc<dyn InferenceBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_health_default() {
        let health = BackendHealth::default();
        assert!(health.operational);
        assert!(health.models.is_empty());
    }

    #[test]
    fn test_unavailable_health() {
        let health = BackendHealth::unavailable("connection refused");
        assert!(!health.operational);
        assert_eq!(health.error.as_deref(), Some("connection refused"));
    }
}
