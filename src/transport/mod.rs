//! Private robot channels.
//!
//! Each single-robot trial owns one [`RobotChannel`] bound to its own port and
//! keyed with the team password. Inbound robot traffic is pushed into the
//! trial's task through an [`InboundSink`]; outbound state is fire-and-forget.
//!
//! Two implementations ship: [`udp`] for robots on the arena network and
//! [`memory`] for in-process loopback.

pub mod memory;
pub mod udp;

pub use memory::MemoryNetwork;
pub use udp::UdpChannelFactory;

use std::fmt;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::messages::{BenchmarkStateMessage, RobotState};

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Largest datagram either side is expected to send.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Message received on a private channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Heartbeat from the robot
    RobotState(Box<RobotState>),
    /// Benchmark state sent by some other referee box on the same port
    PeerBenchmarkState {
        /// Where the message came from
        origin: String,
    },
}

/// Inbound message tagged with the trial member it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotInbound {
    /// Sub-trial index (always 0 outside fleet trials)
    pub member: usize,
    /// The message
    pub message: Inbound,
}

/// Delivers a channel's inbound messages to its trial task.
#[derive(Debug, Clone)]
pub struct InboundSink {
    member: usize,
    tx: mpsc::UnboundedSender<RobotInbound>,
}

impl InboundSink {
    /// Creates a sink tagging messages with `member`.
    #[must_use]
    pub const fn new(member: usize, tx: mpsc::UnboundedSender<RobotInbound>) -> Self {
        Self { member, tx }
    }

    /// Sub-trial index this sink tags messages with.
    #[must_use]
    pub const fn member(&self) -> usize {
        self.member
    }

    /// Pushes a message; `false` once the trial task is gone.
    pub fn deliver(&self, message: Inbound) -> bool {
        self.tx
            .send(RobotInbound {
                member: self.member,
                message,
            })
            .is_ok()
    }
}

/// Bound private channel to one robot.
pub trait RobotChannel: Send + fmt::Debug {
    /// Sends the referee state; failures are logged, never returned.
    fn send(&self, message: &BenchmarkStateMessage);

    /// Port the channel is bound to.
    fn port(&self) -> u16;

    /// Stops receiving and releases the port. Idempotent.
    fn close(&mut self);
}

/// Opens private channels.
#[async_trait::async_trait]
pub trait ChannelFactory: Send + Sync + fmt::Debug {
    /// Binds a channel on `port` keyed with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PortUnavailable`] when the port is taken;
    /// callers retry on the next port.
    async fn open(&self, port: u16, secret: &str, sink: InboundSink) -> Result<Box<dyn RobotChannel>>;
}
