//! Ollama backend
//!
//! Streams from a local Ollama daemon's `/api/generate` endpoint, which
//! answers with newline-delimited JSON chunks:
//!
//! ```text
//! {"response":"Hel","done":false}
//! {"response":"lo","done":false}
//! {"response":"","done":true}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use url::Url;

use crate::config::OllamaSettings;
use crate::error::{Error, Result};

use super::{BackendHealth, GenerateRequest, InferenceBackend};

const BACKEND_NAME: &str = "ollama";

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Daemon base URL, e.g. "http://localhost:11434"
    pub base_url: String,

    /// Whole-request timeout; generations can be long
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            timeout: Duration::from_secs(600),
        }
    }
}

impl From<&OllamaSettings> for OllamaConfig {
    fn from(settings: &OllamaSettings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Ollama API types
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// What one NDJSON line asks the caller to do
#[derive(Debug, PartialEq)]
enum ChunkAction {
    Token(String),
    Skip,
    Done,
}

fn parse_line(line: &[u8]) -> Result<ChunkAction> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(ChunkAction::Skip);
    }

    let chunk: GenerateChunk = serde_json::from_slice(line)
        .map_err(|e| Error::backend(BACKEND_NAME, format!("unreadable chunk: {}", e)))?;

    if let Some(message) = chunk.error {
        return Err(Error::backend(BACKEND_NAME, message));
    }
    if chunk.done {
        return Ok(ChunkAction::Done);
    }
    if chunk.response.is_empty() {
        Ok(ChunkAction::Skip)
    } else {
        Ok(ChunkAction::Token(chunk.response))
    }
}

// ─────────────────────────────────────────────────────────────────
// Ollama Backend
// ─────────────────────────────────────────────────────────────────

pub struct OllamaBackend {
    base_url: Url,
    client: Client,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::config_field_invalid("ollama.base_url", e.to_string()))?;
        let client = Client::builder().timeout(config.timeout).build()?;

        info!(base_url = %base_url, "Ollama backend created");
        Ok(Self { base_url, client })
    }

    /// `segments` appended to the base URL, keeping any path prefix it has
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::backend(BACKEND_NAME, format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Forward the tokens of an NDJSON body to `tokens`, reassembling lines
/// split across chunks. Ends at the first `done` line.
async fn relay_ndjson<S, B, E>(chunks: S, tokens: &mpsc::Sender<String>, request_id: &str) -> Result<()>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| Error::backend(BACKEND_NAME, format!("stream error: {}", e)))?;
        buffer.extend_from_slice(chunk.as_ref());

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            match parse_line(&line)? {
                ChunkAction::Token(token) => {
                    if tokens.send(token).await.is_err() {
                        trace!(request_id, "Requester gone, stopping");
                        return Ok(());
                    }
                }
                ChunkAction::Skip => {}
                ChunkAction::Done => return Ok(()),
            }
        }
    }

    // Final line without a trailing newline
    match parse_line(&buffer)? {
        ChunkAction::Done => Ok(()),
        ChunkAction::Token(token) => {
            let _ = tokens.send(token).await;
            Err(Error::backend(BACKEND_NAME, "stream ended before completion"))
        }
        ChunkAction::Skip => Err(Error::backend(BACKEND_NAME, "stream ended before completion")),
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn health_check(&self) -> Result<BackendHealth> {
        let response = match self.client.get(self.endpoint(&["api", "tags"])?).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => return Ok(BackendHealth::unavailable(format!("HTTP {}", resp.status()))),
            Err(e) => return Ok(BackendHealth::unavailable(e.to_string())),
        };

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| Error::backend(BACKEND_NAME, format!("unreadable /api/tags: {}", e)))?;

        Ok(BackendHealth {
            operational: true,
            models: tags.models.into_iter().map(|m| m.name).collect(),
            error: None,
        })
    }

    async fn generate_stream(&self, request: &GenerateRequest, tokens: mpsc::Sender<String>) -> Result<()> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            stream: true,
        };

        debug!(request_id = %request.request_id, model = %request.model, "Ollama generate");
        let response = self
            .client
            .post(self.endpoint(&["api", "generate"])?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::backend(BACKEND_NAME, format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::backend(BACKEND_NAME, format!("HTTP {}: {}", status, text.trim())));
        }

        relay_ndjson(response.bytes_stream(), &tokens, &request.request_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_line() {
        assert_eq!(
            parse_line(br#"{"model":"m","response":"Hel","done":false}"#).unwrap(),
            ChunkAction::Token("Hel".into())
        );
    }

    #[test]
    fn test_parse_done_line() {
        assert_eq!(
            parse_line(br#"{"response":"","done":true,"eval_count":12}"#).unwrap(),
            ChunkAction::Done
        );
    }

    #[test]
    fn test_parse_blank_and_empty_response() {
        assert_eq!(parse_line(b"  \r\n").unwrap(), ChunkAction::Skip);
        assert_eq!(parse_line(br#"{"response":"","done":false}"#).unwrap(), ChunkAction::Skip);
    }

    #[test]
    fn test_parse_error_line() {
        let err = parse_line(br#"{"error":"model 'nope' not found"}"#).unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_endpoint_join() {
        let backend = OllamaBackend::new(OllamaConfig::default()).unwrap();
        assert_eq!(
            backend.endpoint(&["api", "generate"]).unwrap().as_str(),
            "http://localhost:11434/api/generate"
        );
    }

    #[test]
    fn test_endpoint_keeps_path_prefix() {
        for base in ["http://gateway/ollama", "http://gateway/ollama/"] {
            let backend = OllamaBackend::new(OllamaConfig {
                base_url: base.into(),
                ..OllamaConfig::default()
            })
            .unwrap();
            assert_eq!(
                backend.endpoint(&["api", "generate"]).unwrap().as_str(),
                "http://gateway/ollama/api/generate"
            );
        }
    }

    async fn relay(chunks: Vec<&'static str>) -> (Result<()>, Vec<String>) {
        let (tx, mut rx) = mpsc::channel(64);
        let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        let outcome = relay_ndjson(stream, &tx, "r1").await;
        drop(tx);

        let mut seen = Vec::new();
        while let Some(token) = rx.recv().await {
            seen.push(token);
        }
        (outcome, seen)
    }

    #[tokio::test]
    async fn test_relay_reassembles_split_lines() {
        let (outcome, tokens) = relay(vec![
            "{\"response\":\"Hel\",\"do",
            "ne\":false}\n{\"response\":\"lo\",\"done\":false}\n{\"resp",
            "onse\":\"\",\"done\":true}\n",
        ])
        .await;

        outcome.unwrap();
        assert_eq!(tokens, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_relay_accepts_done_without_trailing_newline() {
        let (outcome, tokens) = relay(vec![
            "{\"response\":\"a\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}",
        ])
        .await;

        outcome.unwrap();
        assert_eq!(tokens, vec!["a"]);
    }

    #[tokio::test]
    async fn test_relay_stops_at_done() {
        let (outcome, tokens) = relay(vec![
            "{\"response\":\"a\",\"done\":false}\n{\"done\":true}\n{\"response\":\"after\",\"done\":false}\n",
        ])
        .await;

        outcome.unwrap();
        assert_eq!(tokens, vec!["a"]);
    }

    #[tokio::test]
    async fn test_relay_fails_when_stream_ends_early() {
        let (outcome, tokens) = relay(vec![
            "{\"response\":\"a\",\"done\":false}\n",
            "{\"response\":\"b\",\"done\":false}",
        ])
        .await;

        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("ended before completion"));
        assert_eq!(tokens, vec!["a", "b"]);

        let (outcome, _) = relay(vec!["{\"response\":\"a\",\"done\":false}\n"]).await;
        assert!(outcome.is_err());
    }

    /// Minimal daemon serving `/ollama/api/generate` as a chunked NDJSON body
    async fn serve_ndjson(chunks: Vec<&'static str>) -> String {
        use axum::body::Body;
        use axum::routing::post;

        let app = axum::Router::new().route(
            "/ollama/api/generate",
            post(move || {
                let chunks = chunks.clone();
                async move {
                    Body::from_stream(futures_util::stream::iter(
                        chunks.into_iter().map(Ok::<_, std::io::Error>),
                    ))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}/ollama", addr)
    }

    #[tokio::test]
    async fn test_generate_stream_over_http() {
        let base_url = serve_ndjson(vec![
            "{\"model\":\"m\",\"response\":\"Hi\",",
            "\"done\":false}\n{\"model\":\"m\",\"response\":\" there\",\"done\":false}\n",
            "{\"model\":\"m\",\"response\":\"\",\"done\":true}",
        ])
        .await;
        let backend = OllamaBackend::new(OllamaConfig {
            base_url,
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let request = GenerateRequest {
            request_id: "r1".into(),
            model: "m".into(),
            prompt: "hello".into(),
        };
        backend.generate_stream(&request, tx).await.unwrap();

        let mut text = String::new();
        while let Some(token) = rx.recv().await {
            text.push_str(&token);
        }
        assert_eq!(text, "Hi there");
    }

    #[tokio::test]
    async fn test_health_check_reports_unreachable_daemon() {
        let backend = OllamaBackend::new(OllamaConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        let health = backend.health_check().await.unwrap();
        assert!(!health.operational);
        assert!(health.error.is_some());
    }
}
