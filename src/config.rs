//! Configuration system for OpenMind Peer
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (OPENMIND_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Main peer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Peer identity
    pub peer: PeerSettings,

    /// Rendezvous service (client URL and server bind settings)
    pub signaling: SignalingSettings,

    /// Handshake polling and deadlines
    pub negotiation: NegotiationSettings,

    /// Direct peer transport
    pub transport: TransportSettings,

    /// Generation streaming defaults
    pub stream: StreamSettings,

    /// Local Ollama daemon (donor side)
    pub ollama: OllamaSettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// Data storage paths
    pub storage: StorageSettings,
}

/// Peer identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// Stable peer identifier (generated and persisted if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable name shown in logs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Rendezvous service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingSettings {
    /// Base URL of the rendezvous service
    pub url: String,

    /// Listen address when running `openmind-peer signal`
    pub bind_addr: String,

    /// Record time-to-live in seconds
    pub ttl_secs: u64,

    /// How often the server sweeps expired records
    pub purge_interval_secs: u64,

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,
}

/// Negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationSettings {
    /// Initial delay between answer polls in milliseconds
    pub poll_interval_ms: u64,

    /// Upper bound on the poll delay in milliseconds
    pub max_poll_interval_ms: u64,

    /// Give up waiting for an answer after this many milliseconds
    pub deadline_ms: u64,

    /// Donor: how often to scan for offers addressed to us
    pub offer_scan_interval_ms: u64,

    /// Donor: how often to refresh the presence record
    pub presence_refresh_secs: u64,
}

/// Direct transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Listen address for inbound channels (port 0 = auto-assign)
    pub bind_addr: String,

    /// Host advertised to peers in answer descriptors (defaults to the bind IP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,

    /// Connect / accept timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Maximum size of a single frame in bytes
    pub max_frame_bytes: u32,

    /// Outbound frame queue depth per channel
    pub queue_size: usize,
}

/// Generation streaming settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Model requested when the caller gives no hint
    pub default_model: String,

    /// Per-request timeout in seconds (0 = wait forever)
    pub request_timeout_secs: u64,
}

/// Ollama daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    /// Ollama base URL
    pub base_url: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

/// Storage path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base data directory (peer id lives here)
    pub data_dir: String,
}

// Default implementations

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8787".to_string(),
            bind_addr: "0.0.0.0:8787".to_string(),
            ttl_secs: 300,
            purge_interval_secs: 60,
            request_timeout_ms: 5000,
        }
    }
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            max_poll_interval_ms: 2000,
            deadline_ms: 30_000,
            offer_scan_interval_ms: 1000,
            presence_refresh_secs: 150,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            advertise_host: None,
            connect_timeout_ms: 10_000,
            max_frame_bytes: 16 * 1024 * 1024,
            queue_size: 64,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            default_model: "deepseek-r1:7b".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            timeout_secs: 600,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.openmind".to_string(),
        }
    }
}

impl StreamSettings {
    /// Per-request timeout, `None` when disabled
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

impl PeerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("openmind.toml"),
            dirs::config_dir()
                .map(|p| p.join("openmind").join("peer.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".openmind").join("peer.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/openmind/peer.toml"),
        ];

        for path in &search_paths {
            if path.is_file() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("OPENMIND_PEER_ID") {
            self.peer.id = Some(val);
        }
        if let Ok(val) = std::env::var("OPENMIND_PEER_NAME") {
            self.peer.name = Some(val);
        }

        if let Ok(val) = std::env::var("OPENMIND_SIGNALING_URL") {
            self.signaling.url = val;
        }
        if let Ok(val) = std::env::var("OPENMIND_SIGNALING_BIND") {
            self.signaling.bind_addr = val;
        }
        override_parsed("OPENMIND_TTL_SECS", &mut self.signaling.ttl_secs);

        override_parsed("OPENMIND_NEGOTIATION_DEADLINE_MS", &mut self.negotiation.deadline_ms);

        if let Ok(val) = std::env::var("OPENMIND_TRANSPORT_BIND") {
            self.transport.bind_addr = val;
        }
        if let Ok(val) = std::env::var("OPENMIND_ADVERTISE_HOST") {
            self.transport.advertise_host = Some(val);
        }

        if let Ok(val) = std::env::var("OPENMIND_MODEL") {
            self.stream.default_model = val;
        }
        override_parsed("OPENMIND_REQUEST_TIMEOUT_SECS", &mut self.stream.request_timeout_secs);

        if let Ok(val) = std::env::var("OPENMIND_OLLAMA_URL") {
            self.ollama.base_url = val;
        }

        if let Ok(val) = std::env::var("OPENMIND_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("OPENMIND_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("OPENMIND_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("OPENMIND_DATA_DIR") {
            self.storage.data_dir = val;
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.storage.data_dir = expand_path(&self.storage.data_dir);

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_http_url("signaling.url", &self.signaling.url)?;
        validate_http_url("ollama.base_url", &self.ollama.base_url)?;

        for (field, addr) in [
            ("signaling.bind_addr", &self.signaling.bind_addr),
            ("transport.bind_addr", &self.transport.bind_addr),
        ] {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(Error::config_field_invalid(
                    field,
                    format!("'{}' is not a valid socket address", addr),
                ));
            }
        }

        if self.signaling.ttl_secs == 0 {
            return Err(Error::config_field_invalid(
                "signaling.ttl_secs",
                "ttl_secs must be greater than 0",
            ));
        }

        let n = &self.negotiation;
        if n.poll_interval_ms == 0 || n.poll_interval_ms > n.max_poll_interval_ms {
            return Err(Error::config_field_invalid(
                "negotiation.poll_interval_ms",
                "poll_interval_ms must be between 1 and max_poll_interval_ms",
            ));
        }
        if n.deadline_ms == 0 {
            return Err(Error::config_field_invalid(
                "negotiation.deadline_ms",
                "deadline_ms must be greater than 0",
            ));
        }
        if n.presence_refresh_secs == 0 || n.presence_refresh_secs >= self.signaling.ttl_secs {
            return Err(Error::config_field_invalid(
                "negotiation.presence_refresh_secs",
                "presence_refresh_secs must be shorter than signaling.ttl_secs",
            ));
        }

        if self.transport.queue_size == 0 {
            return Err(Error::config_field_invalid(
                "transport.queue_size",
                "queue_size must be greater than 0",
            ));
        }

        if self.stream.default_model.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "stream.default_model",
                "default_model cannot be empty",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Get the data directory as a PathBuf
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }
}

fn override_parsed<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<()> {
    match url::Url::parse(value) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(()),
        _ => Err(Error::config_field_invalid(
            field,
            format!("'{}' must be an http:// or https:// URL", value),
        )),
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".openmind")
                .join("peer.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# OpenMind Peer Configuration

[peer]
# Stable peer identifier (generated and stored in data_dir if not set)
# id = "peer-abc12345"

[signaling]
# Rendezvous service used for discovery and handshakes
url = "http://localhost:8787"

# Listen address for 'openmind-peer signal'
bind_addr = "0.0.0.0:8787"

# Seconds a published record stays visible
ttl_secs = 300

# Seconds between sweeps of expired records
purge_interval_secs = 60

# HTTP request timeout in milliseconds
request_timeout_ms = 5000

[negotiation]
# Answer polling starts at poll_interval_ms and backs off to max_poll_interval_ms
poll_interval_ms = 250
max_poll_interval_ms = 2000

# Abandon a handshake after this many milliseconds
deadline_ms = 30000

# Donor: offer scan interval and presence refresh
offer_scan_interval_ms = 1000
presence_refresh_secs = 150

[transport]
# Listen address for inbound peer channels (port 0 = auto-assign)
bind_addr = "0.0.0.0:0"

# Host advertised to peers (defaults to the bind IP)
# advertise_host = "203.0.113.7"

connect_timeout_ms = 10000
max_frame_bytes = 16777216
queue_size = 64

[stream]
# Model requested when none is given
default_model = "deepseek-r1:7b"

# Per-request timeout in seconds (0 = wait forever)
request_timeout_secs = 300

[ollama]
base_url = "http://localhost:11434"
timeout_secs = 600

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.openmind/logs/peer.log"

max_file_size_mb = 100
max_files = 5
json_format = false

[storage]
data_dir = "~/.openmind"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = PeerConfig::default();
        assert_eq!(config.signaling.ttl_secs, 300);
        assert_eq!(config.stream.default_model, "deepseek-r1:7b");
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_config_parses_to_defaults() {
        let parsed: PeerConfig = toml::from_str(&generate_default_config()).unwrap();
        let defaults = PeerConfig::default();
        assert_eq!(parsed.signaling.url, defaults.signaling.url);
        assert_eq!(parsed.negotiation.deadline_ms, defaults.negotiation.deadline_ms);
        assert_eq!(parsed.transport.max_frame_bytes, defaults.transport.max_frame_bytes);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        env::set_var("OPENMIND_SIGNALING_URL", "https://signal.example.com");
        env::set_var("OPENMIND_NEGOTIATION_DEADLINE_MS", "1234");
        env::set_var("OPENMIND_MODEL", "llama3");

        let mut config = PeerConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.signaling.url, "https://signal.example.com");
        assert_eq!(config.negotiation.deadline_ms, 1234);
        assert_eq!(config.stream.default_model, "llama3");

        env::remove_var("OPENMIND_SIGNALING_URL");
        env::remove_var("OPENMIND_NEGOTIATION_DEADLINE_MS");
        env::remove_var("OPENMIND_MODEL");
    }

    #[test]
    fn test_validation_rejects_websocket_url() {
        let mut config = PeerConfig::default();
        config.signaling.url = "ws://signal.example.com".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[test]
    fn test_validation_rejects_bad_bind_addr() {
        let mut config = PeerConfig::default();
        config.transport.bind_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_presence_refresh_past_ttl() {
        let mut config = PeerConfig::default();
        config.negotiation.presence_refresh_secs = config.signaling.ttl_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_poll_bounds() {
        let mut config = PeerConfig::default();
        config.negotiation.poll_interval_ms = 5000;
        config.negotiation.max_poll_interval_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_timeout_zero_disables() {
        let mut stream = StreamSettings::default();
        assert_eq!(stream.request_timeout(), Some(Duration::from_secs(300)));
        stream.request_timeout_secs = 0;
        assert_eq!(stream.request_timeout(), None);
    }

    #[test]
    fn test_parse_partial_config_file() {
        let config: PeerConfig = toml::from_str(
            r#"
[peer]
id = "peer-test0001"

[signaling]
url = "https://signal.example.com"
ttl_secs = 60

[stream]
default_model = "llama3"
"#,
        )
        .unwrap();

        assert_eq!(config.peer.id.as_deref(), Some("peer-test0001"));
        assert_eq!(config.signaling.ttl_secs, 60);
        assert_eq!(config.signaling.bind_addr, "0.0.0.0:8787");
        assert_eq!(config.stream.default_model, "llama3");
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_path_expansion() {
        let mut config = PeerConfig::default();
        config.storage.data_dir = "~/openmind-data".to_string();
        config.expand_paths();
        assert!(!config.storage.data_dir.contains('~'));
    }
}
