//! In-process loopback network.
//!
//! [`MemoryNetwork`] plays both sides: it is the [`ChannelFactory`] the
//! controller opens channels through, and the handle a simulated robot uses
//! to inject heartbeats and read back what the controller sent. Ports can be
//! blocked to exercise the allocation retry path.

use std::io;
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

use super::{ChannelFactory, Inbound, InboundSink, Result, RobotChannel};
use crate::error::TransportError;
use crate::messages::{BenchmarkStateMessage, RobotState};

type SentLog = Arc<Mutex<Vec<BenchmarkStateMessage>>>;

#[derive(Debug)]
struct Endpoint {
    secret: String,
    sink: InboundSink,
}

#[derive(Debug, Default)]
struct Inner {
    endpoints: DashMap<u16, Endpoint>,
    // survives channel close
    sent: DashMap<u16, SentLog>,
    blocked: DashSet<u16>,
}

/// Shared loopback network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `port` fail to bind, as if another process held it.
    pub fn block_port(&self, port: u16) {
        self.inner.blocked.insert(port);
    }

    /// Reverses [`Self::block_port`].
    pub fn unblock_port(&self, port: u16) {
        self.inner.blocked.remove(&port);
    }

    /// Ports with an open channel, ascending.
    #[must_use]
    pub fn open_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.inner.endpoints.iter().map(|e| *e.key()).collect();
        ports.sort_unstable();
        ports
    }

    /// Delivers a robot heartbeat to the channel on `port`; `false` if
    /// nothing is listening.
    #[must_use]
    pub fn deliver(&self, port: u16, state: RobotState) -> bool {
        self.inner
            .endpoints
            .get(&port)
            .is_some_and(|e| e.sink.deliver(Inbound::RobotState(Box::new(state))))
    }

    /// Delivers a benchmark state as if another referee box were sending on
    /// `port`.
    #[must_use]
    pub fn deliver_peer(&self, port: u16, origin: &str) -> bool {
        self.inner.endpoints.get(&port).is_some_and(|e| {
            e.sink.deliver(Inbound::PeerBenchmarkState {
                origin: origin.to_string(),
            })
        })
    }

    /// Everything the controller sent on the latest channel bound to `port`,
    /// including after that channel closed.
    #[must_use]
    pub fn sent(&self, port: u16) -> Vec<BenchmarkStateMessage> {
        self.inner
            .sent
            .get(&port)
            .map(|log| lock(&log).clone())
            .unwrap_or_default()
    }

    /// Most recent message the controller sent on `port`.
    #[must_use]
    pub fn last_sent(&self, port: u16) -> Option<BenchmarkStateMessage> {
        self.inner
            .sent
            .get(&port)
            .and_then(|log| lock(&log).last().cloned())
    }

    /// Secret the channel on `port` was keyed with.
    #[must_use]
    pub fn secret(&self, port: u16) -> Option<String> {
        self.inner.endpoints.get(&port).map(|e| e.secret.clone())
    }
}

/// # Panics
///
/// Panics if the lock is poisoned.
#[allow(clippy::expect_used)]
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("sent log lock poisoned")
}

#[async_trait::async_trait]
impl ChannelFactory for MemoryNetwork {
    async fn open(&self, port: u16, secret: &str, sink: InboundSink) -> Result<Box<dyn RobotChannel>> {
        let unavailable = |kind| TransportError::PortUnavailable {
            port,
            source: io::Error::from(kind),
        };
        if self.inner.blocked.contains(&port) {
            return Err(unavailable(io::ErrorKind::AddrInUse));
        }
        match self.inner.endpoints.entry(port) {
            Entry::Occupied(_) => return Err(unavailable(io::ErrorKind::AddrInUse)),
            Entry::Vacant(slot) => {
                slot.insert(Endpoint {
                    secret: secret.to_string(),
                    sink,
                });
            }
        }
        let sent = SentLog::default();
        self.inner.sent.insert(port, Arc::clone(&sent));
        Ok(Box::new(MemoryChannel {
            network: Arc::clone(&self.inner),
            port,
            sent,
            closed: false,
        }))
    }
}

/// Loopback channel.
#[derive(Debug)]
pub struct MemoryChannel {
    network: Arc<Inner>,
    port: u16,
    sent: SentLog,
    closed: bool,
}

impl RobotChannel for MemoryChannel {
    fn send(&self, message: &BenchmarkStateMessage) {
        if !self.closed {
            lock(&self.sent).push(message.clone());
        }
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.network.endpoints.remove(&self.port);
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}
