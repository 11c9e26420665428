//! HTTP client for a remote signaling server

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

use super::{OfferRequest, OfferResponse, PeerRecord, PeersResponse, Rendezvous};

/// Talks to the signaling server's `/offer` and `/peers` endpoints
pub struct RendezvousClient {
    base_url: Url,
    http: Client,
}

impl RendezvousClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::config_field_invalid("signaling.url", e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::config_field_invalid(
                "signaling.url",
                format!("'{}' cannot be used as a base URL", base_url),
            ));
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("openmind-peer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL with `segments` appended, each percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn unavailable(&self, message: impl Into<String>) -> Error {
        Error::RendezvousUnavailable {
            url: self.base_url.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Rendezvous for RendezvousClient {
    async fn publish(&self, peer_id: &str, descriptor: serde_json::Value) -> Result<()> {
        let body = OfferRequest {
            peer_id: peer_id.to_string(),
            sdp: descriptor,
        };

        let response = self
            .http
            .post(self.endpoint(&["offer"]))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("publish returned {}: {}", status, text)));
        }

        trace!(peer_id, "Published to rendezvous");
        Ok(())
    }

    async fn fetch(&self, peer_id: &str) -> Result<PeerRecord> {
        let response = self
            .http
            .get(self.endpoint(&["offer", peer_id]))
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(peer_id, "Rendezvous miss");
                Err(Error::not_found(peer_id))
            }
            status if status.is_success() => {
                let offer: OfferResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::malformed(format!("offer response: {}", e)))?;
                let timestamp = Utc
                    .timestamp_millis_opt(offer.timestamp)
                    .single()
                    .unwrap_or_else(Utc::now);

                Ok(PeerRecord {
                    peer_id: peer_id.to_string(),
                    descriptor: offer.sdp,
                    timestamp,
                })
            }
            status => Err(self.unavailable(format!("fetch returned {}", status))),
        }
    }

    async fn list_active(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.endpoint(&["peers"]))
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(format!("peers returned {}", status)));
        }

        let peers: PeersResponse = response
            .json()
            .await
            .map_err(|e| Error::malformed(format!("peers response: {}", e)))?;
        Ok(peers.peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> RendezvousClient {
        RendezvousClient::new(base, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_endpoint_joins_segments() {
        let c = client("http://localhost:8787");
        assert_eq!(c.endpoint(&["peers"]).as_str(), "http://localhost:8787/peers");
        assert_eq!(
            c.endpoint(&["offer", "peer-a~peer-b~offer"]).as_str(),
            "http://localhost:8787/offer/peer-a~peer-b~offer"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let c = client("https://signal.example.com/openmind/");
        assert_eq!(
            c.endpoint(&["offer", "alice"]).as_str(),
            "https://signal.example.com/openmind/offer/alice"
        );
    }

    #[test]
    fn test_endpoint_escapes_peer_id() {
        let c = client("http://localhost:8787");
        assert_eq!(
            c.endpoint(&["offer", "a/b c"]).as_str(),
            "http://localhost:8787/offer/a%2Fb%20c"
        );
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(RendezvousClient::new("not a url", Duration::from_secs(1)).is_err());
        assert!(RendezvousClient::new("mailto:someone@example.com", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        // Port 9 (discard) is closed on test machines
        let c = client("http://127.0.0.1:9");
        let err = c.list_active().await.unwrap_err();
        assert!(matches!(err, Error::RendezvousUnavailable { .. }));
        assert!(err.is_retryable());
    }
}
