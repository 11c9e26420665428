//! Donor service: keep a presence record alive and answer incoming offers

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::SharedBackend;
use crate::config::NegotiationSettings;
use crate::error::Result;
use crate::negotiator::{Negotiation, Negotiator};
use crate::protocol::SignalEnvelope;

use super::serve_channel;

/// Offers stay answerable at most this long; older session ids are forgotten
const ANSWERED_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct DonorConfig {
    /// How often the presence record is re-published
    pub presence_refresh: Duration,

    /// How often the rendezvous is scanned for offers addressed to us
    pub offer_scan_interval: Duration,

    /// Human-readable name advertised next to the peer id
    pub display_name: Option<String>,
}

impl Default for DonorConfig {
    fn default() -> Self {
        Self {
            presence_refresh: Duration::from_secs(150),
            offer_scan_interval: Duration::from_secs(1),
            display_name: None,
        }
    }
}

impl DonorConfig {
    pub fn from_settings(settings: &NegotiationSettings, display_name: Option<String>) -> Self {
        Self {
            presence_refresh: Duration::from_secs(settings.presence_refresh_secs),
            offer_scan_interval: Duration::from_millis(settings.offer_scan_interval_ms),
            display_name,
        }
    }
}

pub struct DonorService {
    negotiator: Arc<Negotiator>,
    backend: SharedBackend,
    config: DonorConfig,
    answered: HashMap<Uuid, Instant>,
}

impl DonorService {
    pub fn new(negotiator: Arc<Negotiator>, backend: SharedBackend, config: DonorConfig) -> Self {
        Self {
            negotiator,
            backend,
            config,
            answered: HashMap::new(),
        }
    }

    /// What other peers see when they look us up
    pub fn presence_descriptor(&self) -> serde_json::Value {
        json!({
            "name": self.config.display_name,
            "backend": self.backend.name(),
            "version": env!("CARGO_PKG_VERSION"),
        })
    }

    /// Publish the presence record once
    pub async fn announce(&self) -> Result<()> {
        self.negotiator.announce(self.presence_descriptor()).await
    }

    /// Answer every pending offer not seen before. Returns how many
    /// negotiations were started.
    pub async fn scan_once(&mut self) -> usize {
        let now = Instant::now();
        self.answered
            .retain(|_, seen| now.duration_since(*seen) < ANSWERED_RETENTION);

        let mut started = 0;
        for offer in self.negotiator.pending_offers().await {
            if self.answered.contains_key(&offer.session) {
                continue;
            }
            self.answered.insert(offer.session, now);
            started += 1;

            tokio::spawn(answer_and_serve(
                self.negotiator.clone(),
                self.backend.clone(),
                offer,
            ));
        }
        started
    }

    /// Run until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        match self.backend.health_check().await {
            Ok(health) if health.operational => {
                info!(backend = self.backend.name(), models = ?health.models, "Backend ready")
            }
            Ok(health) => warn!(
                backend = self.backend.name(),
                error = health.error.as_deref().unwrap_or("unknown"),
                "Backend not reachable, serving anyway"
            ),
            Err(e) => warn!(error = %e.format_for_log(), "Backend health check failed"),
        }

        info!(peer_id = %self.negotiator.local_id(), "Donor online");

        let mut presence = tokio::time::interval(self.config.presence_refresh);
        presence.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scan = tokio::time::interval(self.config.offer_scan_interval);
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Donor shutting down");
                    break;
                }
                _ = presence.tick() => {
                    if let Err(e) = self.announce().await {
                        warn!(error = %e.format_for_log(), "Presence refresh failed");
                    } else {
                        debug!("Presence refreshed");
                    }
                }
                _ = scan.tick() => {
                    let started = self.scan_once().await;
                    if started > 0 {
                        debug!(started, "Answering offers");
                    }
                }
            }
        }

        Ok(())
    }
}

async fn answer_and_serve(negotiator: Arc<Negotiator>, backend: SharedBackend, offer: SignalEnvelope) {
    let mut negotiation = Negotiation::responder(negotiator.local_id(), &offer);
    let channel = match negotiator.respond(&mut negotiation, offer).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                remote = %negotiation.remote_id(),
                session = %negotiation.session(),
                error = %e.format_for_log(),
                "Could not answer offer"
            );
            return;
        }
    };

    let summary = serve_channel(channel, backend).await;
    debug!(remote = %negotiation.remote_id(), summary = ?summary, "Served peer");
}
