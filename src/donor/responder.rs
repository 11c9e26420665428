//! Serving side of a channel
//!
//! Every `generate` frame gets its own task that pulls tokens from the
//! backend and writes `token` frames, closed by exactly one `done` or
//! `error`. A `cancel` frame stops the matching task without a reply.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::{GenerateRequest, SharedBackend};
use crate::protocol::Frame;
use crate::transport::{Channel, TransportEvent};

const TOKEN_BUFFER: usize = 32;

/// How one generation on this channel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

/// Per-channel counters reported when the channel ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub requests: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub rejected: u32,
}

impl ServeSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Serve generation requests arriving on `channel` until the remote
/// side goes away
pub async fn serve_channel(channel: Channel, backend: SharedBackend) -> ServeSummary {
    let (peer_id, outbound, mut inbound) = channel.into_parts();
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<(String, Outcome)>();
    let mut active: HashMap<String, oneshot::Sender<()>> = HashMap::new();
    let mut summary = ServeSummary::default();

    info!(peer = %peer_id, backend = backend.name(), "Serving channel");

    loop {
        tokio::select! {
            event = inbound.recv() => {
                let frame = match event {
                    Some(TransportEvent::Message(frame)) => frame,
                    Some(TransportEvent::Closed { reason }) => {
                        debug!(peer = %peer_id, reason = %reason, "Channel closed by transport");
                        break;
                    }
                    None => break,
                };

                match frame {
                    Frame::Generate { request_id, model, prompt, .. } => {
                        summary.requests += 1;
                        if active.get(&request_id).is_some_and(|cancel| !cancel.is_closed()) {
                            warn!(peer = %peer_id, request_id = %request_id, "Duplicate request id");
                            summary.rejected += 1;
                            let reply = Frame::error(&request_id, "request id already in progress");
                            if outbound.send(reply).await.is_err() {
                                break;
                            }
                            continue;
                        }

                        let (cancel_tx, cancel_rx) = oneshot::channel();
                        active.insert(request_id.clone(), cancel_tx);

                        let request = GenerateRequest { request_id, model, prompt };
                        tokio::spawn(run_generation(
                            request,
                            backend.clone(),
                            outbound.clone(),
                            cancel_rx,
                            finished_tx.clone(),
                        ));
                    }
                    Frame::Cancel { request_id } => match active.remove(&request_id) {
                        Some(cancel) => {
                            debug!(peer = %peer_id, request_id = %request_id, "Cancel requested");
                            let _ = cancel.send(());
                        }
                        None => debug!(peer = %peer_id, request_id = %request_id, "Cancel for idle request"),
                    },
                    other => {
                        warn!(peer = %peer_id, frame = other.type_name(), "Unexpected frame on serving side");
                    }
                }
            }
            Some((request_id, outcome)) = finished_rx.recv() => {
                // A re-used id may already belong to a newer, live task
                if active.get(&request_id).is_some_and(|cancel| cancel.is_closed()) {
                    active.remove(&request_id);
                }
                summary.record(outcome);
            }
        }
    }

    // Dropping the cancel senders stops every task still running
    let abandoned = active.len();
    active.clear();
    drop(finished_tx);
    while let Some((_, outcome)) = finished_rx.recv().await {
        summary.record(outcome);
    }

    info!(
        peer = %peer_id,
        requests = summary.requests,
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        abandoned,
        "Channel finished"
    );
    summary
}

async fn run_generation(
    request: GenerateRequest,
    backend: SharedBackend,
    outbound: mpsc::Sender<Frame>,
    mut cancel: oneshot::Receiver<()>,
    finished: mpsc::UnboundedSender<(String, Outcome)>,
) {
    let request_id = request.request_id.clone();
    let (mut outcome, terminal) = generate(&request, backend, &outbound, &mut cancel).await;

    // The id is free for reuse before the requester can see the end
    drop(cancel);
    if let Some(frame) = terminal {
        if outbound.send(frame).await.is_err() {
            outcome = Outcome::Cancelled;
        }
    }

    debug!(request_id = %request_id, outcome = ?outcome, "Generation finished");
    let _ = finished.send((request_id, outcome));
}

async fn generate(
    request: &GenerateRequest,
    backend: SharedBackend,
    outbound: &mpsc::Sender<Frame>,
    cancel: &mut oneshot::Receiver<()>,
) -> (Outcome, Option<Frame>) {
    let id = request.request_id.as_str();
    let (tokens_tx, mut tokens_rx) = mpsc::channel::<String>(TOKEN_BUFFER);
    let generation = backend.generate_stream(request, tokens_tx);
    tokio::pin!(generation);

    loop {
        tokio::select! {
            biased;

            _ = &mut *cancel => return (Outcome::Cancelled, None),
            Some(token) = tokens_rx.recv() => {
                if outbound.send(Frame::token(id, token)).await.is_err() {
                    return (Outcome::Cancelled, None);
                }
            }
            result = &mut generation => {
                while let Ok(token) = tokens_rx.try_recv() {
                    if outbound.send(Frame::token(id, token)).await.is_err() {
                        return (Outcome::Cancelled, None);
                    }
                }

                return match result {
                    Ok(()) => (Outcome::Completed, Some(Frame::done(id))),
                    Err(e) => {
                        warn!(request_id = %id, error = %e.format_for_log(), "Generation failed");
                        (Outcome::Failed, Some(Frame::error(id, e.to_string())))
                    }
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn mock(tokens: &[&str], latency_ms: u64) -> Arc<MockBackend> {
        Arc::new(MockBackend::with_config(MockConfig {
            token_latency_ms: latency_ms,
            ..MockConfig::with_tokens(tokens.iter().copied())
        }))
    }

    async fn next_frame(rx: &mut mpsc::Receiver<TransportEvent>) -> Frame {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(TransportEvent::Message(frame))) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_streams_tokens_then_done() {
        let (server_side, client_side) = Channel::pair("donor", "asker", 16);
        let backend = mock(&["Hel", "lo"], 0);
        let server = tokio::spawn(serve_channel(server_side, backend.clone()));

        let (_, tx, mut rx) = client_side.into_parts();
        tx.send(Frame::generate("r1", "m", "hi")).await.unwrap();

        assert_eq!(next_frame(&mut rx).await, Frame::token("r1", "Hel"));
        assert_eq!(next_frame(&mut rx).await, Frame::token("r1", "lo"));
        assert_eq!(next_frame(&mut rx).await, Frame::done("r1"));

        drop(tx);
        drop(rx);
        let summary = server.await.unwrap();
        assert_eq!(summary.requests, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(backend.last_request().unwrap().model, "m");
    }

    #[tokio::test]
    async fn test_backend_failure_becomes_error_frame() {
        let (server_side, client_side) = Channel::pair("donor", "asker", 16);
        let backend = Arc::new(MockBackend::with_config(MockConfig {
            token_latency_ms: 0,
            fail_after: Some(1),
            ..MockConfig::with_tokens(["a", "b"])
        }));
        let server = tokio::spawn(serve_channel(server_side, backend));

        let (_, tx, mut rx) = client_side.into_parts();
        tx.send(Frame::generate("r1", "m", "x")).await.unwrap();

        assert_eq!(next_frame(&mut rx).await, Frame::token("r1", "a"));
        match next_frame(&mut rx).await {
            Frame::Error { request_id, message } => {
                assert_eq!(request_id, "r1");
                assert!(message.contains("scripted failure"));
            }
            other => panic!("expected error frame, got {:?}", other),
        }

        drop(tx);
        drop(rx);
        assert_eq!(server.await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_only_that_request() {
        let (server_side, client_side) = Channel::pair("donor", "asker", 64);
        let backend = mock(&["a", "b", "c", "d", "e", "f", "g", "h"], 50);
        let server = tokio::spawn(serve_channel(server_side, backend));

        let (_, tx, mut rx) = client_side.into_parts();
        tx.send(Frame::generate("r1", "m", "x")).await.unwrap();
        tx.send(Frame::generate("r2", "m", "y")).await.unwrap();

        // Cancel r1 as soon as its first token shows up
        loop {
            let frame = next_frame(&mut rx).await;
            if frame.request_id() == "r1" {
                tx.send(Frame::cancel("r1")).await.unwrap();
                break;
            }
        }

        let mut r2_done = false;
        let mut r1_terminal = false;
        while !r2_done {
            let frame = next_frame(&mut rx).await;
            match (&frame, frame.request_id()) {
                (Frame::Done { .. }, "r2") => r2_done = true,
                (f, "r1") if f.is_terminal() => r1_terminal = true,
                _ => {}
            }
        }
        assert!(!r1_terminal, "cancelled request must not be answered");

        drop(tx);
        drop(rx);
        let summary = server.await.unwrap();
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.cancelled, 1);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let (server_side, client_side) = Channel::pair("donor", "asker", 16);
        let backend = mock(&["a", "b", "c"], 50);
        let server = tokio::spawn(serve_channel(server_side, backend));

        let (_, tx, mut rx) = client_side.into_parts();
        tx.send(Frame::generate("r1", "m", "x")).await.unwrap();
        tx.send(Frame::generate("r1", "m", "x")).await.unwrap();

        let mut saw_rejection = false;
        loop {
            match next_frame(&mut rx).await {
                Frame::Error { message, .. } if message.contains("already in progress") => saw_rejection = true,
                Frame::Done { .. } => break,
                _ => {}
            }
        }
        assert!(saw_rejection);

        drop(tx);
        drop(rx);
        assert_eq!(server.await.unwrap().rejected, 1);
    }

    #[tokio::test]
    async fn test_finished_request_id_can_be_reused() {
        let (server_side, client_side) = Channel::pair("donor", "asker", 16);
        let backend = mock(&["a", "b"], 0);
        let server = tokio::spawn(serve_channel(server_side, backend));

        let (_, tx, mut rx) = client_side.into_parts();
        for _ in 0..2 {
            tx.send(Frame::generate("r1", "m", "x")).await.unwrap();
            loop {
                match next_frame(&mut rx).await {
                    Frame::Done { request_id } => {
                        assert_eq!(request_id, "r1");
                        break;
                    }
                    Frame::Error { message, .. } => panic!("reused id rejected: {}", message),
                    _ => {}
                }
            }
        }

        drop(tx);
        drop(rx);
        let summary = server.await.unwrap();
        assert_eq!(summary.rejected, 0);
        assert_eq!(summary.completed, 2);
    }

    #[tokio::test]
    async fn test_remote_close_abandons_running_work() {
        let (server_side, client_side) = Channel::pair("donor", "asker", 16);
        let backend = mock(&["a"; 100], 20);
        let server = tokio::spawn(serve_channel(server_side, backend.clone()));

        let (_, tx, mut rx) = client_side.into_parts();
        tx.send(Frame::generate("r1", "m", "x")).await.unwrap();
        let _ = next_frame(&mut rx).await;

        drop(tx);
        drop(rx);
        let summary = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("serve loop should end")
            .unwrap();
        assert_eq!(summary.completed, 0);
        assert!(backend.tokens_sent() < 100);
    }
}
