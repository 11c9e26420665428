//! Mock backend for testing
//!
//! Provides a scripted implementation of InferenceBackend, used by unit
//! tests and by `serve --backend mock` for running a donor without Ollama.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::{BackendHealth, GenerateRequest, InferenceBackend};

// ─────────────────────────────────────────────────────────────────
// Mock Backend Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for mock backend behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Simulated latency per token (ms)
    pub token_latency_ms: u64,

    /// Fixed tokens to emit. When `None` the prompt is echoed back word
    /// by word.
    pub fixed_tokens: Option<Vec<String>>,

    /// Fail the generation after emitting this many tokens
    pub fail_after: Option<usize>,

    /// Report the backend as unhealthy
    pub unhealthy: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            token_latency_ms: 10,
            fixed_tokens: None,
            fail_after: None,
            unhealthy: false,
        }
    }
}

impl MockConfig {
    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fixed_tokens: Some(tokens.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock Backend
// ─────────────────────────────────────────────────────────────────

/// Mock implementation of InferenceBackend for testing
pub struct MockBackend {
    config: MockConfig,
    call_counts: RwLock<CallCounts>,
    last_request: RwLock<Option<GenerateRequest>>,
}

/// Track method call counts for verification
#[derive(Debug, Default)]
struct CallCounts {
    generate: u32,
    health_check: u32,
    tokens_sent: u32,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            call_counts: RwLock::new(CallCounts::default()),
            last_request: RwLock::new(None),
        }
    }

    pub fn generate_count(&self) -> u32 {
        self.call_counts.read().generate
    }

    pub fn health_check_count(&self) -> u32 {
        self.call_counts.read().health_check
    }

    /// Tokens actually accepted by requesters across all generations
    pub fn tokens_sent(&self) -> u32 {
        self.call_counts.read().tokens_sent
    }

    pub fn last_request(&self) -> Option<GenerateRequest> {
        self.last_request.read().clone()
    }

    fn script(&self, prompt: &str) -> Vec<String> {
        if let Some(tokens) = &self.config.fixed_tokens {
            return tokens.clone();
        }
        let mut tokens = vec!["echo:".to_string()];
        tokens.extend(prompt.split_whitespace().map(|w| format!(" {}", w)));
        tokens
    }

    async fn simulate_latency(&self) {
        if self.config.token_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.token_latency_ms)).await;
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn health_check(&self) -> Result<BackendHealth> {
        self.call_counts.write().health_check += 1;

        if self.config.unhealthy {
            return Ok(BackendHealth::unavailable("mock backend configured unhealthy"));
        }
        Ok(BackendHealth {
            operational: true,
            models: vec!["mock".to_string()],
            error: None,
        })
    }

    async fn generate_stream(&self, request: &GenerateRequest, tokens: mpsc::Sender<String>) -> Result<()> {
        self.call_counts.write().generate += 1;
        *self.last_request.write() = Some(request.clone());

        for (index, token) in self.script(&request.prompt).into_iter().enumerate() {
            if self.config.fail_after == Some(index) {
                return Err(Error::backend("mock", format!("scripted failure after {} tokens", index)));
            }

            self.simulate_latency().await;
            if tokens.send(token).await.is_err() {
                return Ok(());
            }
            self.call_counts.write().tokens_sent += 1;
        }

        if let Some(limit) = self.config.fail_after {
            return Err(Error::backend("mock", format!("scripted failure after {} tokens", limit)));
        }
        Ok(())
    }
}
