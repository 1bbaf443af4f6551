//! One task per trial.
//!
//! The task owns its [`Trial`] and serializes every stimulus for it: operator
//! commands, robot traffic, benchmarking-box updates, the retransmit tick and
//! the timeout deadline. Cancelling the task, or the trial terminating
//! itself, closes the channels and the audit log before the task returns, so
//! nothing can reach a disposed trial.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TrialKind;
use crate::error::TrialError;
use crate::transport::RobotInbound;

use super::Trial;
use super::status::StatusView;

/// Score update sent by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    /// Scoring group
    pub group: String,
    /// Item description within the group
    pub desc: String,
    /// New value
    pub value: i64,
}

/// Operator command for one trial.
#[derive(Debug)]
pub enum TrialCommand {
    /// Start or resume
    Start,
    /// Stop, or terminate if already stopped
    Stop,
    /// Record a score
    Score(ScoreUpdate),
    /// Manual operation done
    ManualOperationComplete,
    /// Switch input done
    OmfComplete,
    /// Damaged switch count
    OmfDamaged(u8),
    /// Switch toggled
    OmfButton(u8),
    /// Reply with a status snapshot
    Snapshot(oneshot::Sender<StatusView>),
}

/// Cloneable sender of [`TrialCommand`]s.
#[derive(Debug, Clone)]
pub struct Commander {
    zone: String,
    tx: mpsc::UnboundedSender<TrialCommand>,
}

impl Commander {
    /// Zone the commands go to.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Queues a command.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::Stopped`] if the trial task has exited.
    pub fn send(&self, command: TrialCommand) -> Result<(), TrialError> {
        self.tx
            .send(command)
            .map_err(|_| TrialError::Stopped(self.zone.clone()))
    }

    /// Asks the trial for its status.
    ///
    /// # Errors
    ///
    /// Returns [`TrialError::Stopped`] if the trial task has exited.
    pub async fn snapshot(&self) -> Result<StatusView, TrialError> {
        let (reply, rx) = oneshot::channel();
        self.send(TrialCommand::Snapshot(reply))?;
        rx.await.map_err(|_| TrialError::Stopped(self.zone.clone()))
    }
}

/// Owner's view of a running trial task.
#[derive(Debug)]
pub struct TrialHandle {
    zone: String,
    kind: TrialKind,
    token: Uuid,
    commander: Commander,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TrialHandle {
    /// Spawns the task driving `trial`.
    ///
    /// `inbound` must be the receiver whose sender the trial's channels were
    /// opened with. `bmbox` is the subscription to the box's state topic, for
    /// kinds that watch one.
    #[must_use]
    pub fn spawn(
        trial: Trial,
        token: Uuid,
        inbound: mpsc::UnboundedReceiver<RobotInbound>,
        bmbox: Option<watch::Receiver<Option<Value>>>,
        retransmit_every: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let zone = trial.zone().to_string();
        let kind = trial.kind();
        let (tx, commands) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(trial, commands, inbound, bmbox, retransmit_every, cancel.clone()));
        Self {
            commander: Commander {
                zone: zone.clone(),
                tx,
            },
            zone,
            kind,
            token,
            cancel,
            task,
        }
    }

    /// Zone identifier.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Trial kind.
    #[must_use]
    pub const fn kind(&self) -> TrialKind {
        self.kind
    }

    /// Identifies this particular task, so a stale end notification cannot
    /// remove a newer trial for the same zone.
    #[must_use]
    pub const fn token(&self) -> Uuid {
        self.token
    }

    /// Command sender.
    #[must_use]
    pub fn commander(&self) -> Commander {
        self.commander.clone()
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the task and waits until it has disposed of the trial.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            tracing::error!(zone = %self.zone, %error, "trial task failed");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_bmbox(rx: Option<&mut watch::Receiver<Option<Value>>>) -> Option<Value> {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_err() {
        return std::future::pending().await;
    }
    rx.borrow_and_update().clone()
}

fn apply(trial: &mut Trial, command: TrialCommand) {
    let now = Instant::now();
    match command {
        TrialCommand::Start => trial.start(now),
        TrialCommand::Stop => trial.stop(now),
        TrialCommand::Score(update) => trial.score(&update),
        TrialCommand::ManualOperationComplete => trial.manual_operation_complete(now),
        TrialCommand::OmfComplete => trial.omf_complete(now),
        TrialCommand::OmfDamaged(damaged) => trial.omf_damaged(damaged),
        TrialCommand::OmfButton(button) => trial.omf_button(button),
        TrialCommand::Snapshot(reply) => {
            let _ = reply.send(trial.snapshot(now));
        }
    }
}

async fn run(
    mut trial: Trial,
    mut commands: mpsc::UnboundedReceiver<TrialCommand>,
    mut inbound: mpsc::UnboundedReceiver<RobotInbound>,
    mut bmbox: Option<watch::Receiver<Option<Value>>>,
    retransmit_every: Duration,
    cancel: CancellationToken,
) {
    info!(zone = %trial.zone(), kind = trial.kind().as_str(), "trial task started");
    if let Some(rx) = bmbox.as_mut() {
        rx.mark_changed();
    }
    let mut ticker = tokio::time::interval(retransmit_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut inbound_open = true;

    loop {
        let deadline = trial.next_deadline();
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            message = inbound.recv(), if inbound_open => match message {
                Some(message) => trial.on_robot_message(Instant::now(), message),
                None => inbound_open = false,
            },

            value = next_bmbox(bmbox.as_mut()) => {
                if let Some(value) = value {
                    trial.on_bmbox_value(Instant::now(), &value);
                }
            }

            command = commands.recv() => match command {
                Some(command) => apply(&mut trial, command),
                None => break,
            },

            () = sleep_until(deadline) => trial.poll_timers(Instant::now()),

            _ = ticker.tick() => trial.retransmit(),
        }

        if trial.is_terminated() {
            debug!(zone = %trial.zone(), "trial terminated itself");
            break;
        }
    }

    trial.dispose();
    info!(zone = %trial.zone(), "trial task stopped");
}
