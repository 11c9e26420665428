//! Session negotiation
//!
//! Drives the two-sided handshake that turns two processes into one open
//! channel, using the rendezvous service as the only shared medium.
//!
//! Initiator: `Created → DescriptorPublished → RemoteDescriptorFetched →
//! ChannelEstablishing → Open`.
//!
//! Responder: `Created → RemoteDescriptorFetched → DescriptorPublished →
//! ChannelEstablishing → Open`.
//!
//! Either may end in `Failed`. The initiator writes its offer under the
//! canonical offer slot for the pair and polls the answer slot with
//! exponential backoff until the caller's deadline.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::NegotiationSettings;
use crate::error::{Error, Result};
use crate::protocol::signal::{parse_slot_key, slot_key, validate_peer_id};
use crate::protocol::{SignalEnvelope, SignalKind, SlotKind};
use crate::rendezvous::SharedRendezvous;
use crate::transport::{Channel, Role, Transport, TransportFactory};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// First delay between answer polls
    pub poll_interval: Duration,

    /// Upper bound on the poll delay
    pub max_poll_interval: Duration,

    /// Give up waiting for an answer after this long
    pub deadline: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(2),
            deadline: Duration::from_secs(30),
        }
    }
}

impl From<&NegotiationSettings> for NegotiatorConfig {
    fn from(settings: &NegotiationSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            max_poll_interval: Duration::from_millis(settings.max_poll_interval_ms),
            deadline: Duration::from_millis(settings.deadline_ms),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Negotiation State
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Created,
    DescriptorPublished,
    RemoteDescriptorFetched,
    ChannelEstablishing,
    Open,
    Failed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// One handshake attempt
#[derive(Debug, Clone)]
pub struct Negotiation {
    role: Role,
    local_id: String,
    remote_id: String,
    session: Uuid,
    state: NegotiationState,
    transitions: Vec<NegotiationState>,
    error: Option<String>,
}

impl Negotiation {
    pub fn initiator(local_id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self::new(Role::Initiator, local_id.into(), remote_id.into(), Uuid::new_v4())
    }

    /// Responder side of the offer in `offer`
    pub fn responder(local_id: impl Into<String>, offer: &SignalEnvelope) -> Self {
        Self::new(Role::Responder, local_id.into(), offer.from.clone(), offer.session)
    }

    fn new(role: Role, local_id: String, remote_id: String, session: Uuid) -> Self {
        Self {
            role,
            local_id,
            remote_id,
            session,
            state: NegotiationState::Created,
            transitions: vec![NegotiationState::Created],
            error: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Every state visited, starting with `Created`
    pub fn transitions(&self) -> &[NegotiationState] {
        &self.transitions
    }

    /// Cause of failure, once `Failed`
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn advance(&mut self, next: NegotiationState) {
        trace!(
            role = %self.role,
            remote = %self.remote_id,
            from = %self.state,
            to = %next,
            "Negotiation transition"
        );
        self.state = next;
        self.transitions.push(next);
    }

    fn fail(&mut self, error: Error) -> Error {
        warn!(
            role = %self.role,
            remote = %self.remote_id,
            at = %self.state,
            error = %error.format_for_log(),
            "Negotiation failed"
        );
        self.error = Some(error.to_string());
        self.advance(NegotiationState::Failed);
        error
    }

    /// Fail with `cause` attached
    fn fail_with(&mut self, cause: Error) -> Error {
        let error = Error::NegotiationFailed {
            peer_id: self.remote_id.clone(),
            source: Box::new(cause),
        };
        self.fail(error)
    }
}

// ─────────────────────────────────────────────────────────────────
// Negotiator
// ─────────────────────────────────────────────────────────────────

pub struct Negotiator {
    local_id: String,
    rendezvous: SharedRendezvous,
    transports: Arc<dyn TransportFactory>,
    config: NegotiatorConfig,
}

impl Negotiator {
    pub fn new(
        local_id: impl Into<String>,
        rendezvous: SharedRendezvous,
        transports: Arc<dyn TransportFactory>,
        config: NegotiatorConfig,
    ) -> Result<Self> {
        let local_id = local_id.into();
        validate_peer_id(&local_id)?;

        Ok(Self {
            local_id,
            rendezvous,
            transports,
            config,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Open a channel to `remote_id` as initiator
    pub async fn connect(&self, remote_id: &str) -> Result<Channel> {
        let mut negotiation = Negotiation::initiator(&self.local_id, remote_id);
        self.initiate(&mut negotiation).await
    }

    /// Run the initiator side of `negotiation`
    pub async fn initiate(&self, negotiation: &mut Negotiation) -> Result<Channel> {
        let remote_id = negotiation.remote_id.clone();
        if let Err(e) = validate_peer_id(&remote_id) {
            return Err(negotiation.fail(e));
        }
        if remote_id == self.local_id {
            return Err(negotiation.fail(Error::malformed("cannot negotiate with ourselves")));
        }

        info!(remote = %remote_id, session = %negotiation.session, "Initiating negotiation");
        let mut transport = self.transports.create(Role::Initiator);

        // 1. Local descriptor
        let descriptor = match transport.create_local_descriptor().await {
            Ok(d) => d,
            Err(e) => return Err(negotiation.fail_with(e)),
        };

        // 2. Publish offer
        let offer = SignalEnvelope::offer(negotiation.session, &self.local_id, &remote_id, descriptor);
        let published = match offer.to_value() {
            Ok(value) => {
                self.rendezvous
                    .publish(&slot_key(&self.local_id, &remote_id, SlotKind::Offer), value)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            return Err(negotiation.fail_with(e));
        }
        negotiation.advance(NegotiationState::DescriptorPublished);

        // 3. Wait for the answer
        let answer = match self.await_answer(negotiation).await {
            Ok(answer) => answer,
            Err(e) => return Err(negotiation.fail(e)),
        };
        negotiation.advance(NegotiationState::RemoteDescriptorFetched);

        // 4-5. Apply and connect
        self.establish(negotiation, transport.as_mut(), answer.descriptor).await
    }

    /// Poll the answer slot until a matching answer appears or the deadline passes
    async fn await_answer(&self, negotiation: &Negotiation) -> Result<SignalEnvelope> {
        let key = slot_key(&self.local_id, &negotiation.remote_id, SlotKind::Answer);
        let deadline = Instant::now() + self.config.deadline;
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.poll_interval,
            max_interval: self.config.max_poll_interval,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.rendezvous.fetch(&key).await {
                Ok(record) => match SignalEnvelope::from_value(record.descriptor) {
                    Ok(answer)
                        if answer.kind == SignalKind::Answer
                            && answer.session == negotiation.session
                            && answer.from == negotiation.remote_id =>
                    {
                        debug!(remote = %negotiation.remote_id, polls, "Answer received");
                        return Ok(answer);
                    }
                    Ok(_) => trace!(key = %key, "Answer slot holds a different session"),
                    Err(e) => debug!(key = %key, error = %e, "Ignoring unreadable answer"),
                },
                Err(e) if e.is_not_found() => trace!(key = %key, "No answer yet"),
                Err(e) => debug!(key = %key, error = %e.format_for_log(), "Answer poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::NegotiationTimeout {
                    peer_id: negotiation.remote_id.clone(),
                    timeout_ms: self.config.deadline.as_millis() as u64,
                });
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.max_poll_interval)
                .min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Run the responder side for a fetched offer
    pub async fn respond(&self, negotiation: &mut Negotiation, offer: SignalEnvelope) -> Result<Channel> {
        info!(remote = %negotiation.remote_id, session = %negotiation.session, "Answering offer");
        negotiation.advance(NegotiationState::RemoteDescriptorFetched);

        let mut transport = self.transports.create(Role::Responder);

        if let Err(e) = transport.apply_remote_descriptor(offer.descriptor).await {
            return Err(negotiation.fail_with(e));
        }
        let descriptor = match transport.create_local_descriptor().await {
            Ok(d) => d,
            Err(e) => return Err(negotiation.fail_with(e)),
        };

        let answer = SignalEnvelope::answer(
            negotiation.session,
            &self.local_id,
            &negotiation.remote_id,
            descriptor,
        );
        let published = match answer.to_value() {
            Ok(value) => {
                self.rendezvous
                    .publish(
                        &slot_key(&self.local_id, &negotiation.remote_id, SlotKind::Answer),
                        value,
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            return Err(negotiation.fail_with(e));
        }
        negotiation.advance(NegotiationState::DescriptorPublished);
        negotiation.advance(NegotiationState::ChannelEstablishing);

        match transport.open().await {
            Ok(channel) => {
                negotiation.advance(NegotiationState::Open);
                Ok(channel)
            }
            Err(e) => Err(negotiation.fail_with(e)),
        }
    }

    async fn establish(
        &self,
        negotiation: &mut Negotiation,
        transport: &mut dyn Transport,
        remote: serde_json::Value,
    ) -> Result<Channel> {
        if let Err(e) = transport.apply_remote_descriptor(remote).await {
            return Err(negotiation.fail_with(e));
        }
        negotiation.advance(NegotiationState::ChannelEstablishing);

        match transport.open().await {
            Ok(channel) => {
                negotiation.advance(NegotiationState::Open);
                info!(remote = %negotiation.remote_id, "Negotiation complete");
                Ok(channel)
            }
            Err(e) => Err(negotiation.fail_with(e)),
        }
    }

    /// Publish our presence record so we show up in discovery
    pub async fn announce(&self, descriptor: serde_json::Value) -> Result<()> {
        let presence = SignalEnvelope::presence(&self.local_id, descriptor).to_value()?;
        self.rendezvous.publish(&self.local_id, presence).await
    }

    /// Offers currently addressed to us. Unreadable slots are skipped.
    pub async fn pending_offers(&self) -> Vec<SignalEnvelope> {
        let keys = match self.rendezvous.list_active().await {
            Ok(keys) => keys,
            Err(e) => {
                debug!(error = %e.format_for_log(), "Offer scan failed");
                return Vec::new();
            }
        };

        let mut offers = Vec::new();
        for key in keys {
            let involves_us = matches!(
                parse_slot_key(&key),
                Some((lo, hi, SlotKind::Offer)) if lo == self.local_id || hi == self.local_id
            );
            if !involves_us {
                continue;
            }

            let record = match self.rendezvous.fetch(&key).await {
                Ok(record) => record,
                Err(e) => {
                    trace!(key = %key, error = %e, "Offer vanished before fetch");
                    continue;
                }
            };
            match SignalEnvelope::from_value(record.descriptor) {
                Ok(offer)
                    if offer.kind == SignalKind::Offer
                        && offer.is_for(&self.local_id)
                        && offer.from != self.local_id =>
                {
                    offers.push(offer)
                }
                Ok(_) => {}
                Err(e) => debug!(key = %key, error = %e, "Ignoring unreadable offer"),
            }
        }
        offers
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
