//! Shared integration-test harness: fixture paths, the `rsbb` binary, and an
//! in-process referee box wired to loopback robots and an in-memory bus.

#![allow(dead_code)]

use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use rsbb::bus::{Bus, MemoryBus};
use rsbb::config::ConfigLoader;
use rsbb::coordinator::Coordinator;
use rsbb::messages::{RobotBeacon, RobotState, RobotStateCode, WireTime};
use rsbb::transport::MemoryNetwork;
use rsbb::trial::StatusView;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Absolute path of a file under `tests/fixtures/`.
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Runs the `rsbb` binary to completion.
#[allow(clippy::missing_panics_doc)]
pub fn rsbb(args: &[&str]) -> Output {
    std::process::Command::new(env!("CARGO_BIN_EXE_rsbb"))
        .args(args)
        .env_remove("RSBB_CONFIG")
        .env_remove("RSBB_LOG_LEVEL")
        .output()
        .expect("failed to run rsbb")
}

/// A referee box built from `tests/fixtures/settings.yaml`.
pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub bus: Arc<MemoryBus>,
    pub network: MemoryNetwork,
    pub cancel: CancellationToken,
}

impl Harness {
    #[allow(clippy::missing_panics_doc)]
    pub fn new() -> Self {
        let loaded = ConfigLoader::with_defaults()
            .load(&fixture_path("settings.yaml"))
            .expect("fixture settings must load");
        let bus = Arc::new(MemoryBus::new());
        let network = MemoryNetwork::new();
        let cancel = CancellationToken::new();
        let dyn_bus: Arc<dyn Bus> = bus.clone();
        let coordinator = Arc::new(Coordinator::new(
            loaded.config,
            dyn_bus,
            Arc::new(network.clone()),
            cancel.clone(),
        ));
        Self {
            coordinator,
            bus,
            network,
            cancel,
        }
    }

    /// Announces a robot on the public channel.
    pub fn beacon(&self, team: &str, robot: &str) {
        self.coordinator.record_beacon(&RobotBeacon {
            team_name: team.to_string(),
            robot_name: robot.to_string(),
            time: WireTime::now(),
        });
    }

    /// Private port of the team's running trial.
    #[allow(clippy::missing_panics_doc)]
    pub fn port_of(&self, team: &str) -> u16 {
        self.coordinator
            .shared()
            .claim_of(team)
            .expect("team has no running trial")
            .port
    }

    /// Delivers a heartbeat to the team's trial and lets it run.
    #[allow(clippy::missing_panics_doc)]
    pub async fn send(&self, team: &str, state: RobotState) {
        let port = self.port_of(team);
        assert!(self.network.deliver(port, state), "port {port} is closed");
        settle().await;
    }

    /// Sends a bare heartbeat.
    pub async fn heartbeat(&self, team: &str, robot: &str, state: RobotStateCode) {
        self.send(team, RobotState::heartbeat(team, robot, state)).await;
    }

    /// Publishes a benchmarking box state and lets the trial react.
    pub async fn bmbox(&self, prefix: &str, state: &str, payload: &str) {
        self.bus.publish(
            &format!("{prefix}bmbox_state"),
            serde_json::json!({ "state": state, "payload": payload }),
        );
        settle().await;
    }

    /// Status of a zone.
    #[allow(clippy::missing_panics_doc)]
    pub async fn status(&self, zone: &str) -> StatusView {
        self.coordinator.snapshot(zone).await.expect("zone is running")
    }

    /// Latest value on a bus topic.
    pub fn latest(&self, topic: &str) -> Option<Value> {
        self.bus.latest(topic)
    }
}

/// Lets spawned tasks process what was queued for them.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
