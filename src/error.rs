//! Error types for OpenMind Peer
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for CLI
//!
//! Rendezvous misses (`NotFound` / `Expired`) are ordinary outcomes and
//! are never fatal. Streaming failures are scoped to the request that
//! produced them and never affect other sessions or channels.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for peer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Rendezvous / connection errors (3xx)
    RendezvousNotFound = 300,
    RendezvousExpired = 301,
    RendezvousUnavailable = 302,
    NegotiationTimeout = 310,
    NegotiationFailed = 311,
    TransportFailed = 320,

    // Protocol errors (4xx)
    ProtocolMalformed = 400,

    // Streaming errors (5xx)
    ChannelClosed = 500,
    PeerError = 501,
    StreamTimeout = 502,
    StreamCancelled = 503,
    BackendFailed = 510,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E300")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // ─────────────────────────────────────────────────────────────
    // Rendezvous & Negotiation Errors
    // ─────────────────────────────────────────────────────────────

    /// No record for this key (absent, or never published)
    #[error("Peer not found: {peer_id}")]
    NotFound { peer_id: String },

    /// Record existed but its TTL lapsed
    #[error("Peer record expired: {peer_id}")]
    Expired { peer_id: String },

    /// The rendezvous service could not be reached or answered unexpectedly
    #[error("Rendezvous service at {url} unavailable: {message}")]
    RendezvousUnavailable { url: String, message: String },

    /// The remote peer never answered within the negotiation deadline
    #[error("Peer {peer_id} did not answer within {timeout_ms}ms")]
    NegotiationTimeout { peer_id: String, timeout_ms: u64 },

    /// Negotiation aborted by a transport-level failure
    #[error("Negotiation with {peer_id} failed: {source}")]
    NegotiationFailed {
        peer_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Transport-level failure (connect, handshake, framing)
    #[error("Transport error: {message}")]
    Transport { message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    // ─────────────────────────────────────────────────────────────
    // Streaming Errors
    // ─────────────────────────────────────────────────────────────

    /// Operation attempted on a channel that is not open
    #[error("Channel to {peer_id} is closed")]
    ChannelClosed { peer_id: String },

    /// The remote peer reported a generation failure
    #[error("Peer reported failure for request {request_id}: {message}")]
    PeerError { request_id: String, message: String },

    /// Local deadline elapsed while awaiting a terminal frame
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    /// The request was cancelled locally
    #[error("Request {request_id} was cancelled")]
    Cancelled { request_id: String },

    /// The local inference engine failed
    #[error("Backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Http(_) => ErrorCode::RendezvousUnavailable,

            Error::NotFound { .. } => ErrorCode::RendezvousNotFound,
            Error::Expired { .. } => ErrorCode::RendezvousExpired,
            Error::RendezvousUnavailable { .. } => ErrorCode::RendezvousUnavailable,
            Error::NegotiationTimeout { .. } => ErrorCode::NegotiationTimeout,
            Error::NegotiationFailed { .. } => ErrorCode::NegotiationFailed,
            Error::Transport { .. } => ErrorCode::TransportFailed,

            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,

            Error::ChannelClosed { .. } => ErrorCode::ChannelClosed,
            Error::PeerError { .. } => ErrorCode::PeerError,
            Error::Timeout { .. } => ErrorCode::StreamTimeout,
            Error::Cancelled { .. } => ErrorCode::StreamCancelled,
            Error::Backend { .. } => ErrorCode::BackendFailed,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// A rendezvous miss; expired records are reported the same as absent ones
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::Expired { .. })
    }

    /// Whether the caller may reasonably retry (possibly with another peer)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::Expired { .. }
                | Error::RendezvousUnavailable { .. }
                | Error::Http(_)
                | Error::NegotiationTimeout { .. }
                | Error::NegotiationFailed { .. }
                | Error::Transport { .. }
                | Error::ChannelClosed { .. }
                | Error::Timeout { .. }
                | Error::Io(_)
        )
    }

    /// Whether the process should exit
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'openmind-peer config init' to create a default configuration file.",
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'openmind-peer config validate' to see details.",
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values.",
            ),
            Error::NotFound { .. } | Error::Expired { .. } => Some(
                "The peer may have gone offline. Run 'openmind-peer peers' to see who is available.",
            ),
            Error::RendezvousUnavailable { .. } | Error::Http(_) => Some(
                "Check your network connection and the [signaling] url in your configuration.",
            ),
            Error::NegotiationTimeout { .. } => Some(
                "The peer did not answer. Try another peer or raise [negotiation] deadline_ms.",
            ),
            Error::NegotiationFailed { .. } | Error::Transport { .. } => Some(
                "The peer could not be reached directly. Check [transport] advertise_host on the donor.",
            ),
            Error::Timeout { .. } => Some(
                "The peer is slow to answer. Raise [stream] request_timeout_secs or try a smaller model.",
            ),
            Error::Backend { .. } => Some(
                "Make sure Ollama is running ('ollama serve') and the model is pulled.",
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code().as_str(), self);

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found(peer_id: impl Into<String>) -> Self {
        Error::NotFound {
            peer_id: peer_id.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    pub fn channel_closed(peer_id: impl Into<String>) -> Self {
        Error::ChannelClosed {
            peer_id: peer_id.into(),
        }
    }

    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
