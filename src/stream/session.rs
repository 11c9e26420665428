//! Generation session state
//!
//! Tracks one in-flight request on the requesting side.

use std::time::Instant;

// ─────────────────────────────────────────────────────────────────
// Session State
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Sent, no token seen yet
    Pending,
    /// At least one token received
    Streaming,
    Complete,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Pending
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Streaming => "streaming",
            SessionState::Complete => "complete",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────
// Generation Session
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub request_id: String,
    pub prompt: String,
    pub model: String,

    /// Concatenation of every token received so far, in arrival order
    pub accumulated: String,

    pub state: SessionState,

    pub created_at: Instant,

    /// Tokens received
    pub tokens: u32,

    /// Failure message reported by the peer
    pub error: Option<String>,
}

impl GenerationSession {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: prompt.into(),
            model: model.into(),
            accumulated: String::new(),
            state: SessionState::Pending,
            created_at: Instant::now(),
            tokens: 0,
            error: None,
        }
    }

    /// Append a token. Returns false (and changes nothing) once terminal.
    pub fn push_token(&mut self, token: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Streaming;
        self.accumulated.push_str(token);
        self.tokens += 1;
        true
    }

    pub fn mark_complete(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Complete;
        }
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
            self.error = Some(message.into());
        }
    }

    pub fn mark_cancelled(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Cancelled;
        }
    }
}
