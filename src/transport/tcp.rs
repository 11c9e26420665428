//! Direct TCP transport
//!
//! The responder listens and advertises its address in the answer; the
//! initiator connects out and proves which offer it belongs to with the
//! token from its own descriptor.
//!
//! Wire format:  [4-byte big-endian length][JSON payload]
//!
//! ```text
//! initiator                          responder
//!   offer  {transport, token}  ──►     apply_remote: remember token
//!                              ◄──   answer {transport, token, addr}
//!   connect(addr) ─────────────────►   accept
//!   HELLO {token, peer_id, version} ─►  verify token
//!                              ◄──── HELLO_ACK {peer_id, version}
//!   frames ◄═══════════════════════► frames
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransportSettings;
use crate::error::{Error, Result};
use crate::protocol::{Frame, ProtocolVersion, PROTOCOL_VERSION};

use super::{Channel, Role, Transport, TransportEvent, TransportFactory};

const TRANSPORT_NAME: &str = "tcp";

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Our peer id, sent in the hello
    pub local_peer_id: String,

    /// Responder listen address (port 0 = OS-assigned)
    pub bind_addr: SocketAddr,

    /// Host written into answers; falls back to the bind IP, then the hostname
    pub advertise_host: Option<String>,

    /// Bound on connect, accept and hello exchange
    pub connect_timeout: Duration,

    pub max_frame_bytes: u32,

    /// Per-direction frame queue depth
    pub queue_size: usize,
}

impl TcpTransportConfig {
    pub fn new(local_peer_id: impl Into<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_host: None,
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes: 16 * 1024 * 1024,
            queue_size: 64,
        }
    }

    pub fn from_settings(local_peer_id: impl Into<String>, settings: &TransportSettings) -> Result<Self> {
        let bind_addr = settings.bind_addr.parse().map_err(|_| {
            Error::config_field_invalid(
                "transport.bind_addr",
                format!("'{}' is not a valid socket address", settings.bind_addr),
            )
        })?;

        Ok(Self {
            local_peer_id: local_peer_id.into(),
            bind_addr,
            advertise_host: settings.advertise_host.clone(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            max_frame_bytes: settings.max_frame_bytes,
            queue_size: settings.queue_size.max(1),
        })
    }

    /// Address placed in answers for a listener bound to `bound`
    fn advertised_addr(&self, bound: SocketAddr) -> String {
        if let Some(host) = &self.advertise_host {
            return format!("{}:{}", host, bound.port());
        }
        if !bound.ip().is_unspecified() {
            return bound.to_string();
        }
        match hostname::get().ok().and_then(|h| h.into_string().ok()) {
            Some(host) => format!("{}:{}", host, bound.port()),
            None => format!("127.0.0.1:{}", bound.port()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Descriptor and hello messages
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TcpDescriptor {
    transport: String,
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    addr: Option<String>,
}

impl TcpDescriptor {
    fn parse(value: serde_json::Value) -> Result<Self> {
        let descriptor: TcpDescriptor = serde_json::from_value(value)
            .map_err(|e| Error::transport(format!("unusable descriptor: {}", e)))?;
        if descriptor.transport != TRANSPORT_NAME {
            return Err(Error::transport(format!(
                "unsupported transport '{}'",
                descriptor.transport
            )));
        }
        Ok(descriptor)
    }

    fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::Internal(format!("descriptor encode: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum Handshake {
    Hello {
        token: String,
        peer_id: String,
        version: ProtocolVersion,
    },
    HelloAck {
        peer_id: String,
        version: ProtocolVersion,
    },
    Reject {
        reason: String,
    },
}

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// One negotiation's worth of TCP connectivity
pub struct TcpTransport {
    config: TcpTransportConfig,
    role: Role,
    token: Option<String>,
    remote_addr: Option<String>,
    listener: Option<TcpListener>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig, role: Role) -> Self {
        Self {
            config,
            role,
            token: None,
            remote_addr: None,
            listener: None,
        }
    }

    async fn connect(&mut self) -> Result<Channel> {
        let addr = self
            .remote_addr
            .clone()
            .ok_or_else(|| Error::transport("no remote descriptor applied"))?;
        let token = self
            .token
            .clone()
            .ok_or_else(|| Error::transport("no local descriptor created"))?;
        let timeout = self.config.connect_timeout;
        let max = self.config.max_frame_bytes;

        debug!(addr = %addr, "Connecting to peer");
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| Error::transport(format!("connect to {} timed out", addr)))?
            .map_err(|e| Error::transport(format!("connect to {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        let hello = Handshake::Hello {
            token,
            peer_id: self.config.local_peer_id.clone(),
            version: PROTOCOL_VERSION,
        };
        write_framed(&mut stream, &hello, max).await?;

        let reply: Handshake = tokio::time::timeout(timeout, read_framed(&mut stream, max))
            .await
            .map_err(|_| Error::transport("HELLO_ACK timeout"))??;

        match reply {
            Handshake::HelloAck { peer_id, version } => {
                PROTOCOL_VERSION.check_compatible(&version)?;
                info!(peer = %peer_id, addr = %addr, "Channel open (outbound)");
                Ok(spawn_channel(peer_id, stream, &self.config))
            }
            Handshake::Reject { reason } => Err(Error::transport(format!("peer rejected hello: {}", reason))),
            Handshake::Hello { .. } => Err(Error::transport("expected HELLO_ACK, got HELLO")),
        }
    }

    async fn accept(&mut self) -> Result<Channel> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::transport("no local descriptor created"))?;
        let token = self
            .token
            .clone()
            .ok_or_else(|| Error::transport("no remote descriptor applied"))?;
        let max = self.config.max_frame_bytes;
        let deadline = Instant::now() + self.config.connect_timeout;

        // Stray connections are turned away until the right token arrives
        loop {
            let (mut stream, peer_addr) = tokio::time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| Error::transport("initiator never connected"))??;
            let _ = stream.set_nodelay(true);

            let hello = match tokio::time::timeout_at(deadline, read_framed::<Handshake, _>(&mut stream, max)).await {
                Ok(Ok(hello)) => hello,
                Ok(Err(e)) => {
                    debug!(peer_addr = %peer_addr, error = %e, "Bad hello");
                    continue;
                }
                Err(_) => return Err(Error::transport("hello timeout")),
            };

            match hello {
                Handshake::Hello {
                    token: offered,
                    peer_id,
                    version,
                } if offered == token => {
                    if let Err(e) = PROTOCOL_VERSION.check_compatible(&version) {
                        let reject = Handshake::Reject { reason: e.to_string() };
                        let _ = write_framed(&mut stream, &reject, max).await;
                        return Err(e);
                    }

                    let ack = Handshake::HelloAck {
                        peer_id: self.config.local_peer_id.clone(),
                        version: PROTOCOL_VERSION,
                    };
                    write_framed(&mut stream, &ack, max).await?;

                    info!(peer = %peer_id, peer_addr = %peer_addr, "Channel open (inbound)");
                    return Ok(spawn_channel(peer_id, stream, &self.config));
                }
                _ => {
                    warn!(peer_addr = %peer_addr, "Rejecting connection with wrong token");
                    let reject = Handshake::Reject {
                        reason: "unknown session".to_string(),
                    };
                    let _ = write_framed(&mut stream, &reject, max).await;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn create_local_descriptor(&mut self) -> Result<serde_json::Value> {
        match self.role {
            Role::Initiator => {
                let token = Uuid::new_v4().to_string();
                self.token = Some(token.clone());
                TcpDescriptor {
                    transport: TRANSPORT_NAME.to_string(),
                    token,
                    addr: None,
                }
                .to_value()
            }
            Role::Responder => {
                let token = self
                    .token
                    .clone()
                    .ok_or_else(|| Error::transport("responder must apply the offer first"))?;

                let listener = TcpListener::bind(self.config.bind_addr)
                    .await
                    .map_err(|e| Error::transport(format!("bind {}: {}", self.config.bind_addr, e)))?;
                let bound = listener.local_addr()?;
                let addr = self.config.advertised_addr(bound);
                debug!(bound = %bound, advertised = %addr, "Listening for initiator");
                self.listener = Some(listener);

                TcpDescriptor {
                    transport: TRANSPORT_NAME.to_string(),
                    token,
                    addr: Some(addr),
                }
                .to_value()
            }
        }
    }

    async fn apply_remote_descriptor(&mut self, descriptor: serde_json::Value) -> Result<()> {
        let remote = TcpDescriptor::parse(descriptor)?;

        match self.role {
            Role::Initiator => {
                if self.token.as_deref() != Some(remote.token.as_str()) {
                    return Err(Error::transport("answer does not match our offer"));
                }
                let addr = remote
                    .addr
                    .ok_or_else(|| Error::transport("answer carries no address"))?;
                self.remote_addr = Some(addr);
            }
            Role::Responder => {
                self.token = Some(remote.token);
            }
        }
        Ok(())
    }

    async fn open(&mut self) -> Result<Channel> {
        match self.role {
            Role::Initiator => self.connect().await,
            Role::Responder => self.accept().await,
        }
    }
}

/// Builds [`TcpTransport`]s sharing one configuration
pub struct TcpTransportFactory {
    config: TcpTransportConfig,
}

impl TcpTransportFactory {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self, role: Role) -> Box<dyn Transport> {
        Box::new(TcpTransport::new(self.config.clone(), role))
    }
}

// ─────────────────────────────────────────────────────────────────
// Channel plumbing
// ─────────────────────────────────────────────────────────────────

fn spawn_channel(peer_id: String, stream: TcpStream, config: &TcpTransportConfig) -> Channel {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<Frame>(config.queue_size);
    let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(config.queue_size);

    tokio::spawn(write_loop(peer_id.clone(), write_half, out_rx, config.max_frame_bytes));
    tokio::spawn(read_loop(peer_id.clone(), read_half, in_tx, config.max_frame_bytes));

    Channel::from_parts(peer_id, out_tx, in_rx)
}

/// Background task: reads frames and forwards them as events
async fn read_loop(
    peer_id: String,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    events: mpsc::Sender<TransportEvent>,
    max_frame_bytes: u32,
) {
    let reason = loop {
        let payload = match read_payload(&mut reader, max_frame_bytes).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break "remote closed the connection".to_string(),
            Err(e) => break e.to_string(),
        };

        match Frame::decode(&payload) {
            Ok(frame) => {
                if events.send(TransportEvent::Message(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(peer = %peer_id, error = %e, "Dropping malformed frame"),
        }
    };

    debug!(peer = %peer_id, reason = %reason, "Channel read side finished");
    let _ = events.send(TransportEvent::Closed { reason }).await;
}

/// Background task: writes queued frames; shuts the socket down when the queue closes
async fn write_loop(
    peer_id: String,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut frames: mpsc::Receiver<Frame>,
    max_frame_bytes: u32,
) {
    while let Some(frame) = frames.recv().await {
        let written = match frame.encode() {
            Ok(payload) => write_payload(&mut writer, &payload, max_frame_bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(peer = %peer_id, error = %e, "Channel write error");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Length-prefixed JSON framing
// ─────────────────────────────────────────────────────────────────

/// One payload, or `None` on a clean end of stream
async fn read_payload<R: AsyncReadExt + Unpin>(reader: &mut R, max: u32) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max {
        return Err(Error::transport(format!(
            "frame too large: {} bytes (max {})",
            len, max
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn read_framed<T: DeserializeOwned, R: AsyncReadExt + Unpin>(reader: &mut R, max: u32) -> Result<T> {
    let payload = read_payload(reader, max)
        .await?
        .ok_or_else(|| Error::transport("connection closed during handshake"))?;
    serde_json::from_slice(&payload).map_err(|e| Error::malformed(e.to_string()))
}

async fn write_framed<T: Serialize, W: AsyncWriteExt + Unpin>(writer: &mut W, msg: &T, max: u32) -> Result<()> {
    let json = serde_json::to_vec(msg).map_err(|e| Error::Internal(format!("handshake encode: {}", e)))?;
    write_payload(writer, &json, max).await
}

async fn write_payload<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8], max: u32) -> Result<()> {
    if payload.len() > max as usize {
        return Err(Error::transport(format!(
            "frame too large: {} bytes (max {})",
            payload.len(),
            max
        )));
    }

    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
