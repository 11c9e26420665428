//! Stream multiplexer
//!
//! Carries any number of concurrent generation sessions over one open
//! channel. Outbound `generate` frames are tagged with a request id; a
//! single dispatch task per channel routes inbound `token`, `done` and
//! `error` frames back to the session with that id. Each session has its
//! own progress stream and its own completion signal, so sessions never
//! observe each other's output.
//!
//! The session table is shared by the dispatch task and callers issuing
//! `send` / `cancel`, and is guarded by one mutex per channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::Frame;
use crate::transport::{Channel, TransportEvent};

use super::session::{GenerationSession, SessionState};

// ─────────────────────────────────────────────────────────────────
// Channel State
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// Shutting down; live sessions are being resolved
    Closing,
    /// Terminal. A new channel must be negotiated.
    Closed,
}

// ─────────────────────────────────────────────────────────────────
// Session table
// ─────────────────────────────────────────────────────────────────

struct SessionEntry {
    session: GenerationSession,
    progress: mpsc::UnboundedSender<String>,
    result: Option<oneshot::Sender<Result<String>>>,
}

impl SessionEntry {
    fn resolve(&mut self, outcome: Result<String>) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(outcome);
        }
    }
}

struct MuxState {
    channel: ChannelState,
    outbound: Option<mpsc::Sender<Frame>>,
    sessions: HashMap<String, SessionEntry>,
}

struct Inner {
    peer_id: String,
    state: Mutex<MuxState>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn dispatch(&self, frame: Frame) {
        let mut state = self.state.lock();

        match frame {
            Frame::Token { request_id, token } => match state.sessions.get_mut(&request_id) {
                Some(entry) => {
                    if entry.session.push_token(&token) {
                        let _ = entry.progress.send(token);
                    }
                }
                None => trace!(peer = %self.peer_id, request_id = %request_id, "Dropping token for unknown request"),
            },
            Frame::Done { request_id } => match state.sessions.remove(&request_id) {
                Some(mut entry) => {
                    entry.session.mark_complete();
                    debug!(
                        peer = %self.peer_id,
                        request_id = %request_id,
                        tokens = entry.session.tokens,
                        elapsed_ms = entry.session.created_at.elapsed().as_millis() as u64,
                        "Generation complete"
                    );
                    let text = std::mem::take(&mut entry.session.accumulated);
                    entry.resolve(Ok(text));
                }
                None => trace!(peer = %self.peer_id, request_id = %request_id, "Dropping done for unknown request"),
            },
            Frame::Error { request_id, message } => match state.sessions.remove(&request_id) {
                Some(mut entry) => {
                    entry.session.mark_failed(message.clone());
                    debug!(peer = %self.peer_id, request_id = %request_id, error = %message, "Generation failed on peer");
                    entry.resolve(Err(Error::PeerError { request_id, message }));
                }
                None => trace!(peer = %self.peer_id, request_id = %request_id, "Dropping error for unknown request"),
            },
            other => {
                warn!(
                    peer = %self.peer_id,
                    frame_type = other.type_name(),
                    "Unexpected frame on requesting side"
                );
            }
        }
    }

    /// Move to `Closed`, resolving every live session with `ChannelClosed`
    fn shutdown(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.channel != ChannelState::Open {
            return;
        }

        state.channel = ChannelState::Closing;
        state.outbound = None;

        let live = state.sessions.len();
        for (_, mut entry) in state.sessions.drain() {
            entry.session.mark_failed(reason);
            entry.resolve(Err(Error::channel_closed(&self.peer_id)));
        }

        state.channel = ChannelState::Closed;
        info!(peer = %self.peer_id, reason, live_sessions = live, "Channel closed");
    }

    fn close(&self, reason: &str) {
        self.shutdown(reason);
        if let Some(handle) = self.dispatch.lock().take() {
            handle.abort();
        }
    }
}

/// Held only by `StreamMultiplexer` clones, never by the dispatch task.
/// When the last clone goes away the channel is closed.
struct Owner {
    inner: Arc<Inner>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.inner.close("multiplexer dropped");
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut inbound: mpsc::Receiver<TransportEvent>) {
    let reason = loop {
        match inbound.recv().await {
            Some(TransportEvent::Message(frame)) => inner.dispatch(frame),
            Some(TransportEvent::Closed { reason }) => break reason,
            None => break "transport dropped".to_string(),
        }
    };
    inner.shutdown(&reason);
}

// ─────────────────────────────────────────────────────────────────
// Stream Multiplexer
// ─────────────────────────────────────────────────────────────────

/// Requesting side of one channel. Cheap to clone.
///
/// Dropping every clone (and every outstanding `GenerationHandle`) closes
/// the channel as if `close` had been called.
#[derive(Clone)]
pub struct StreamMultiplexer {
    owner: Arc<Owner>,
}

impl StreamMultiplexer {
    /// Take ownership of an open channel and start its dispatch task
    pub fn new(channel: Channel) -> Self {
        let (peer_id, outbound, inbound) = channel.into_parts();

        let inner = Arc::new(Inner {
            peer_id,
            state: Mutex::new(MuxState {
                channel: ChannelState::Open,
                outbound: Some(outbound),
                sessions: HashMap::new(),
            }),
            dispatch: Mutex::new(None),
        });

        let handle = tokio::spawn(dispatch_loop(Arc::clone(&inner), inbound));
        *inner.dispatch.lock() = Some(handle);

        Self {
            owner: Arc::new(Owner { inner }),
        }
    }

    fn inner(&self) -> &Inner {
        &self.owner.inner
    }

    pub fn peer_id(&self) -> &str {
        &self.inner().peer_id
    }

    pub fn state(&self) -> ChannelState {
        self.inner().state.lock().channel
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Number of sessions still awaiting a terminal frame
    pub fn live_sessions(&self) -> usize {
        self.inner().state.lock().sessions.len()
    }

    /// Snapshot of a live session
    pub fn session(&self, request_id: &str) -> Option<GenerationSession> {
        self.inner()
            .state
            .lock()
            .sessions
            .get(request_id)
            .map(|entry| entry.session.clone())
    }

    /// Start a generation under a fresh request id
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<GenerationHandle> {
        let session = GenerationSession::new(Uuid::new_v4().to_string(), model, prompt);
        self.send(session).await
    }

    /// Register `session` and frame its `generate` request onto the channel
    pub async fn send(&self, session: GenerationSession) -> Result<GenerationHandle> {
        let request_id = session.request_id.clone();
        let frame = Frame::Generate {
            request_id: request_id.clone(),
            model: session.model.clone(),
            prompt: session.prompt.clone(),
            stream: true,
        };

        let (result_tx, result_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        // Registered before the frame leaves so an immediate reply is routed
        let outbound = {
            let mut state = self.inner().state.lock();
            let outbound = match (&state.channel, &state.outbound) {
                (ChannelState::Open, Some(tx)) => tx.clone(),
                _ => return Err(Error::channel_closed(&self.inner().peer_id)),
            };
            if state.sessions.contains_key(&request_id) {
                return Err(Error::malformed(format!(
                    "request id {} is already in flight",
                    request_id
                )));
            }
            state.sessions.insert(
                request_id.clone(),
                SessionEntry {
                    session,
                    progress: progress_tx,
                    result: Some(result_tx),
                },
            );
            outbound
        };

        if outbound.send(frame).await.is_err() {
            self.inner().state.lock().sessions.remove(&request_id);
            return Err(Error::channel_closed(&self.inner().peer_id));
        }

        debug!(peer = %self.inner().peer_id, request_id = %request_id, "Generation sent");

        Ok(GenerationHandle {
            request_id,
            progress: progress_rx,
            result: result_rx,
            mux: self.clone(),
        })
    }

    /// Stop waiting for `request_id` and ask the peer to stop generating.
    ///
    /// Never blocks on the peer. Returns false if the session was not live.
    pub fn cancel(&self, request_id: &str) -> bool {
        let outbound = {
            let mut state = self.inner().state.lock();
            let Some(mut entry) = state.sessions.remove(request_id) else {
                return false;
            };
            entry.session.mark_cancelled();
            entry.resolve(Err(Error::Cancelled {
                request_id: request_id.to_string(),
            }));
            state.outbound.clone()
        };

        if let Some(tx) = outbound {
            if let Err(e) = tx.try_send(Frame::cancel(request_id)) {
                debug!(request_id, error = %e, "Cancel frame not sent");
            }
        }

        debug!(peer = %self.inner().peer_id, request_id, "Generation cancelled");
        true
    }

    /// Close the channel. Every live session resolves with `ChannelClosed`.
    pub fn close(&self) {
        self.inner().close("closed locally");
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("peer_id", &self.inner().peer_id)
            .field("state", &self.state())
            .field("live_sessions", &self.live_sessions())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Generation Handle
// ─────────────────────────────────────────────────────────────────

/// Caller's view of one in-flight generation.
///
/// Dropping the handle before the session ends cancels it.
#[derive(Debug)]
pub struct GenerationHandle {
    request_id: String,
    progress: mpsc::UnboundedReceiver<String>,
    result: oneshot::Receiver<Result<String>>,
    mux: StreamMultiplexer,
}

impl GenerationHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next streamed token, or `None` once the session has ended
    pub async fn next_token(&mut self) -> Option<String> {
        self.progress.recv().await
    }

    /// Wait for the full output
    pub async fn wait(self) -> Result<String> {
        self.wait_timeout(None).await
    }

    /// Wait for the full output, giving up after `timeout`.
    ///
    /// On timeout the session is cancelled locally and `Timeout` is
    /// returned; the peer may keep generating.
    pub async fn wait_timeout(mut self, timeout: Option<Duration>) -> Result<String> {
        let outcome = match timeout {
            None => (&mut self.result).await,
            Some(limit) => match tokio::time::timeout(limit, &mut self.result).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if !self.mux.cancel(&self.request_id) {
                        // Finished while the timer fired
                        if let Ok(outcome) = self.result.try_recv() {
                            return outcome;
                        }
                    }
                    return Err(Error::Timeout {
                        request_id: self.request_id.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
        };

        outcome.unwrap_or_else(|_| Err(Error::channel_closed(self.mux.peer_id())))
    }

    pub fn cancel(&self) -> bool {
        self.mux.cancel(&self.request_id)
    }

    pub fn state(&self) -> Option<SessionState> {
        self.mux.session(&self.request_id).map(|s| s.state)
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        self.mux.cancel(&self.request_id);
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
