//! UDP private channels and the public beacon listener.
//!
//! Every datagram on a private channel is a JSON envelope carrying the
//! sender's random origin id, the JSON body, and a SHA-256 tag over the team
//! password, origin and body. Datagrams with a bad tag are dropped, as are
//! the channel's own broadcasts echoing back.
//!
//! Beacons on the public port are plain JSON [`RobotBeacon`]s.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::net::{UdpSocket, lookup_host};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ChannelFactory, Inbound, InboundSink, MAX_DATAGRAM_SIZE, Result, RobotChannel};
use crate::error::TransportError;
use crate::messages::{BenchmarkStateMessage, RobotBeacon, RobotState};

// ============================================================================
// Envelope
// ============================================================================

/// Body of a private-channel datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrivateMessage {
    /// Robot heartbeat
    RobotState(Box<RobotState>),
    /// Referee state
    BenchmarkState(BenchmarkStateMessage),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    body: String,
    tag: String,
}

fn digest(secret: &str, origin: Uuid, body: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update([0u8]);
    hasher.update(origin.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    hasher.finalize().to_vec()
}

fn tag(secret: &str, origin: Uuid, body: &str) -> String {
    hex::encode(digest(secret, origin, body))
}

/// Compares in time independent of where the tags differ.
fn tag_matches(secret: &str, envelope: &Envelope) -> bool {
    let Ok(received) = hex::decode(&envelope.tag) else {
        return false;
    };
    let expected = digest(secret, envelope.origin, &envelope.body);
    expected.as_slice().ct_eq(received.as_slice()).into()
}

/// Encodes and tags a private-channel message.
///
/// # Errors
///
/// Returns [`TransportError::Json`] if the message cannot be serialized.
pub fn encode(message: &PrivateMessage, secret: &str, origin: Uuid) -> Result<Vec<u8>> {
    let body = serde_json::to_string(message)?;
    let envelope = Envelope {
        origin,
        tag: tag(secret, origin, &body),
        body,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Verifies and decodes a private-channel datagram.
///
/// # Errors
///
/// Returns [`TransportError::Authentication`] on a bad tag and
/// [`TransportError::Json`] on malformed content.
pub fn decode(datagram: &[u8], secret: &str) -> Result<(Uuid, PrivateMessage)> {
    let envelope: Envelope = serde_json::from_slice(datagram)?;
    if !tag_matches(secret, &envelope) {
        return Err(TransportError::Authentication(format!(
            "bad tag from origin {}",
            envelope.origin
        )));
    }
    let message = serde_json::from_str(&envelope.body)?;
    Ok((envelope.origin, message))
}

// ============================================================================
// Private channel
// ============================================================================

/// Opens UDP private channels that send to `host:<port>`.
#[derive(Debug, Clone)]
pub struct UdpChannelFactory {
    host: String,
}

impl UdpChannelFactory {
    /// Creates a factory sending to `host` (usually the arena broadcast
    /// address).
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait::async_trait]
impl ChannelFactory for UdpChannelFactory {
    async fn open(&self, port: u16, secret: &str, sink: InboundSink) -> Result<Box<dyn RobotChannel>> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|source| TransportError::PortUnavailable { port, source })?;
        socket.set_broadcast(true)?;
        let destination = lookup_host((self.host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| TransportError::Protocol(format!("cannot resolve {}", self.host)))?;

        let socket = Arc::new(socket);
        let origin = Uuid::new_v4();
        let cancel = CancellationToken::new();
        tokio::spawn(receive_loop(
            Arc::clone(&socket),
            secret.to_string(),
            origin,
            sink,
            cancel.clone(),
        ));
        debug!(port, %destination, "private channel opened");

        Ok(Box::new(UdpChannel {
            socket,
            destination,
            secret: secret.to_string(),
            origin,
            port,
            cancel,
        }))
    }
}

/// UDP private channel.
#[derive(Debug)]
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    secret: String,
    origin: Uuid,
    port: u16,
    cancel: CancellationToken,
}

impl RobotChannel for UdpChannel {
    fn send(&self, message: &BenchmarkStateMessage) {
        if self.cancel.is_cancelled() {
            return;
        }
        let datagram = match encode(
            &PrivateMessage::BenchmarkState(message.clone()),
            &self.secret,
            self.origin,
        ) {
            Ok(datagram) => datagram,
            Err(error) => {
                warn!(%error, port = self.port, "cannot encode benchmark state");
                return;
            }
        };
        if let Err(error) = self.socket.try_send_to(&datagram, self.destination) {
            debug!(%error, port = self.port, "benchmark state not sent");
        }
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn close(&mut self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            debug!(port = self.port, "private channel closed");
        }
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    secret: String,
    own_origin: Uuid,
    sink: InboundSink,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(error) => {
                debug!(%error, "private channel receive failed");
                continue;
            }
        };
        let inbound = match decode(&buf[..len], &secret) {
            Ok((origin, _)) if origin == own_origin => continue,
            Ok((_, PrivateMessage::RobotState(state))) => Inbound::RobotState(state),
            Ok((_, PrivateMessage::BenchmarkState(_))) => Inbound::PeerBenchmarkState {
                origin: from.to_string(),
            },
            Err(error) => {
                debug!(%error, %from, "dropping datagram");
                continue;
            }
        };
        if !sink.deliver(inbound) {
            break;
        }
    }
}

// ============================================================================
// Public beacons
// ============================================================================

/// Listens for [`RobotBeacon`]s on the public port until `cancel` fires,
/// handing each one to `on_beacon`.
///
/// # Errors
///
/// Returns [`TransportError::PortUnavailable`] if the port cannot be bound.
pub async fn spawn_beacon_listener<F>(
    port: u16,
    on_beacon: F,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>>
where
    F: Fn(RobotBeacon) + Send + 'static,
{
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|source| TransportError::PortUnavailable { port, source })?;
    info!(port, "listening for robot beacons");

    Ok(tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, from)) => match serde_json::from_slice::<RobotBeacon>(&buf[..len]) {
                    Ok(beacon) => on_beacon(beacon),
                    Err(error) => debug!(%error, %from, "ignoring malformed beacon"),
                },
                Err(error) => debug!(%error, "beacon receive failed"),
            }
        }
        debug!("beacon listener stopped");
    }))
}
