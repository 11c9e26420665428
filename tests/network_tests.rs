//! End-to-end tests over real sockets
//!
//! A signaling server on 127.0.0.1, peers talking to it over HTTP, and
//! donor/asker channels over the TCP transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use openmind_peer::backend::{MockBackend, MockConfig, SharedBackend};
use openmind_peer::donor::{DonorConfig, DonorService};
use openmind_peer::error::{Error, Result};
use openmind_peer::negotiator::{Negotiator, NegotiatorConfig};
use openmind_peer::rendezvous::{PeerDirectory, RendezvousClient, RendezvousStore, SharedRendezvous, SignalServer};
use openmind_peer::stream::StreamMultiplexer;
use openmind_peer::transport::{TcpTransportConfig, TcpTransportFactory};

// ─────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────

struct TestServer {
    url: String,
    store: Arc<RendezvousStore>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start(ttl: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let store = Arc::new(RendezvousStore::new(ttl));
        let (tx, rx) = oneshot::channel::<()>();

        let server = SignalServer::new(store.clone(), Duration::from_millis(100));
        let task = tokio::spawn(server.run(listener, async move {
            let _ = rx.await;
        }));

        Self {
            url,
            store,
            shutdown: Some(tx),
            task,
        }
    }

    fn client(&self) -> SharedRendezvous {
        Arc::new(RendezvousClient::new(&self.url, Duration::from_secs(2)).unwrap())
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

fn negotiator(peer_id: &str, rendezvous: SharedRendezvous, deadline: Duration) -> Arc<Negotiator> {
    let mut transport = TcpTransportConfig::new(peer_id);
    transport.bind_addr = "127.0.0.1:0".parse().unwrap();

    Arc::new(
        Negotiator::new(
            peer_id,
            rendezvous,
            Arc::new(TcpTransportFactory::new(transport)),
            NegotiatorConfig {
                poll_interval: Duration::from_millis(25),
                max_poll_interval: Duration::from_millis(100),
                deadline,
            },
        )
        .unwrap(),
    )
}

fn start_donor(
    server: &TestServer,
    peer_id: &str,
    backend: SharedBackend,
) -> (oneshot::Sender<()>, JoinHandle<Result<()>>) {
    let donor = DonorService::new(
        negotiator(peer_id, server.client(), Duration::from_secs(5)),
        backend,
        DonorConfig {
            presence_refresh: Duration::from_secs(1),
            offer_scan_interval: Duration::from_millis(50),
            display_name: Some("test donor".into()),
        },
    );
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(donor.run(async move {
        let _ = rx.await;
    }));
    (tx, task)
}

async fn wait_for_peer(directory: &PeerDirectory, self_id: &str, expected: &str) {
    for _ in 0..100 {
        if directory.discover(self_id).await.iter().any(|p| p == expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never showed up in discovery", expected);
}

// ─────────────────────────────────────────────────────────────────
// Rendezvous over HTTP
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_http_publish_fetch_list() {
    let server = TestServer::start(Duration::from_secs(300)).await;
    let client = server.client();

    client.publish("alice", json!("D1")).await.unwrap();

    let record = client.fetch("alice").await.unwrap();
    assert_eq!(record.peer_id, "alice");
    assert_eq!(record.descriptor, json!("D1"));
    assert_eq!(client.list_active().await.unwrap(), vec!["alice".to_string()]);

    let err = client.fetch("bob").await.unwrap_err();
    assert!(err.is_not_found());

    server.stop().await;
}

#[tokio::test]
async fn test_http_records_expire() {
    let server = TestServer::start(Duration::from_millis(200)).await;
    let client = server.client();

    client.publish("alice", json!({"sdp": "x"})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert!(client.fetch("alice").await.unwrap_err().is_not_found());
    assert!(client.list_active().await.unwrap().is_empty());

    // The background sweep drops it from storage as well
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(server.store.stored_count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_discovery_excludes_self() {
    let server = TestServer::start(Duration::from_secs(300)).await;
    let client = server.client();
    client.publish("alice", json!("A")).await.unwrap();
    client.publish("bob", json!("B")).await.unwrap();

    let directory = PeerDirectory::new(client);
    assert_eq!(directory.discover("alice").await, vec!["bob".to_string()]);

    server.stop().await;
}

#[tokio::test]
async fn test_discovery_degrades_when_server_is_gone() {
    let server = TestServer::start(Duration::from_secs(300)).await;
    let client = server.client();
    server.stop().await;

    let directory = PeerDirectory::new(client);
    assert!(directory.discover("alice").await.is_empty());
}

// ─────────────────────────────────────────────────────────────────
// Donor <-> asker
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ask_a_donor_end_to_end() {
    let server = TestServer::start(Duration::from_secs(300)).await;
    let backend = Arc::new(MockBackend::with_config(MockConfig {
        token_latency_ms: 5,
        ..MockConfig::default()
    }));
    let (stop_donor, donor) = start_donor(&server, "peer-donor001", backend.clone());

    let directory = PeerDirectory::new(server.client());
    wait_for_peer(&directory, "peer-asker001", "peer-donor001").await;

    let asker = negotiator("peer-asker001", server.client(), Duration::from_secs(10));
    let channel = asker.connect("peer-donor001").await.unwrap();
    let mux = StreamMultiplexer::new(channel);

    let mut handle = mux.generate("mock", "why is the sky blue").await.unwrap();
    let mut streamed = String::new();
    while let Some(token) = handle.next_token().await {
        streamed.push_str(&token);
    }
    let text = handle.wait_timeout(Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(text, "echo: why is the sky blue");
    assert_eq!(streamed, text);
    assert_eq!(backend.last_request().unwrap().prompt, "why is the sky blue");

    // Handshake slots are never offered as peers
    let peers = directory.discover("peer-asker001").await;
    assert!(peers.iter().all(|p| !p.contains('~')));

    mux.close();
    let _ = stop_donor.send(());
    donor.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_generations_on_one_channel() {
    let server = TestServer::start(Duration::from_secs(300)).await;
    let backend = Arc::new(MockBackend::with_config(MockConfig {
        token_latency_ms: 2,
        ..MockConfig::default()
    }));
    let (stop_donor, donor) = start_donor(&server, "peer-donor002", backend);

    let asker = negotiator("peer-asker002", server.client(), Duration::from_secs(10));
    let channel = asker.connect("peer-donor002").await.unwrap();
    let mux = StreamMultiplexer::new(channel);

    let first = mux.generate("mock", "one two three").await.unwrap();
    let second = mux.generate("mock", "four five").await.unwrap();

    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert_eq!(a.unwrap(), "echo: one two three");
    assert_eq!(b.unwrap(), "echo: four five");

    mux.close();
    let _ = stop_donor.send(());
    donor.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_cancel_leaves_other_session_intact() {
    let server = TestServer::start(Duration::from_secs(300)).await;
    let backend = Arc::new(MockBackend::with_config(MockConfig {
        token_latency_ms: 20,
        ..MockConfig::default()
    }));
    let (stop_donor, donor) = start_donor(&server, "peer-donor003", backend);

    let asker = negotiator("peer-asker003", server.client(), Duration::from_secs(10));
    let mux = StreamMultiplexer::new(asker.connect("peer-donor003").await.unwrap());

    let long = mux
        .generate("mock", "a b c d e f g h i j k l m n o p")
        .await
        .unwrap();
    let short = mux.generate("mock", "short").await.unwrap();

    assert!(long.cancel());
    assert!(matches!(long.wait().await, Err(Error::Cancelled { .. })));
    assert_eq!(short.wait().await.unwrap(), "echo: short");
    assert!(mux.is_open());

    mux.close();
    let _ = stop_donor.send(());
    donor.await.unwrap().unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_unanswered_offer_times_out() {
    let server = TestServer::start(Duration::from_secs(300)).await;
    let client = server.client();
    client.publish("peer-silent01", json!({"kind": "presence"})).await.unwrap();

    let asker = negotiator("peer-asker004", client, Duration::from_millis(300));
    let err = asker.connect("peer-silent01").await.unwrap_err();
    assert!(matches!(err, Error::NegotiationTimeout { .. }));

    server.stop().await;
}
