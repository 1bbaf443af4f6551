mod common;

use std::time::Duration;

use common::{Harness, settle};
use rsbb::error::TrialError;
use rsbb::messages::{BenchmarkState, RobotState, RobotStateCode};
use rsbb::trial::{Phase, ScoreUpdate};

const ZONE: &str = "PLN-alpha-r1-1";

async fn connected() -> Harness {
    let h = Harness::new();
    h.beacon("alpha", "r1");
    h.coordinator.connect(ZONE).await.unwrap();
    h
}

#[tokio::test(start_paused = true)]
async fn robot_drives_plain_trial_to_completion() {
    let h = connected().await;
    h.coordinator.start(ZONE).unwrap();
    assert_eq!(h.status(ZONE).await.benchmark_state, BenchmarkState::Prepare);

    h.heartbeat("alpha", "r1", RobotStateCode::WaitingGoal).await;
    let view = h.status(ZONE).await;
    assert_eq!(view.benchmark_state, BenchmarkState::WaitingResult);
    assert!(view.state.starts_with("Robot finished preparation, executing (no explicit goal)"));

    h.heartbeat("alpha", "r1", RobotStateCode::ResultTx).await;
    let view = h.status(ZONE).await;
    assert_eq!(view.phase, Phase::Post);
    assert!(view.state.starts_with("Benchmark completed by the robot"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let port = h.port_of("alpha");
    let last = h.network.last_sent(port).unwrap();
    assert_eq!(last.benchmark_state, BenchmarkState::Stop);
    assert_eq!(last.benchmark_type, "PLN");
}

#[tokio::test(start_paused = true)]
async fn timeout_stops_and_announces() {
    let h = connected().await;
    h.coordinator.start(ZONE).unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let view = h.status(ZONE).await;
    assert_eq!(view.phase, Phase::Post);
    assert!(view.state.starts_with("Stopped due to timeout!"));
    assert_eq!(h.latest("/timeout").unwrap()["zone"], ZONE);
}

#[tokio::test(start_paused = true)]
async fn device_requests_reach_the_bus() {
    let h = connected().await;
    h.coordinator.start(ZONE).unwrap();

    let mut state = RobotState::heartbeat("alpha", "r1", RobotStateCode::Preparing);
    state.devices.switch_1 = Some(true);
    state.devices.dimmer = Some(40);
    state.tablet_display_map = Some(true);
    h.send("alpha", state).await;

    assert_eq!(h.latest("/devices/switch_1/set").unwrap()["data"], true);
    assert_eq!(h.latest("/devices/dimmer/set").unwrap()["data"], 40);
    assert!(h.latest("/devices/switch_2/set").is_none());
    assert!(h.coordinator.shared().tablet_display_map());

    let view = h.status(ZONE).await;
    assert!(view.log.iter().any(|line| line.contains("/devices/switch_1: 1")));
}

#[tokio::test(start_paused = true)]
async fn scores_update_the_table() {
    let h = connected().await;
    h.coordinator
        .score(
            ZONE,
            ScoreUpdate {
                group: "Penalties".to_string(),
                desc: "Bumps".to_string(),
                value: 2,
            },
        )
        .unwrap();
    let view = h.status(ZONE).await;
    let penalties = view.scoring.iter().find(|g| g.group_name == "Penalties").unwrap();
    assert_eq!(penalties.items[0].current_value, 2);
}

#[tokio::test(start_paused = true)]
async fn stop_twice_frees_the_team() {
    let h = connected().await;
    h.coordinator.start(ZONE).unwrap();
    h.coordinator.stop(ZONE).unwrap();
    settle().await;
    assert_eq!(h.status(ZONE).await.state.lines().next(), Some("Benchmark Stopped by referee"));

    h.coordinator.stop(ZONE).unwrap();
    settle().await;
    assert!(h.coordinator.zone_ids().is_empty());
    assert!(!h.coordinator.shared().is_benchmarking("alpha"));
    assert!(matches!(
        h.coordinator.snapshot(ZONE).await,
        Err(TrialError::UnknownZone(_))
    ));

    // the zone can be opened again
    h.coordinator.connect(ZONE).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn second_zone_for_busy_team_is_refused() {
    let h = connected().await;
    h.beacon("alpha", "r1");
    let err = h.coordinator.connect("NAV-alpha-r1-2").await.unwrap_err();
    assert!(matches!(err, TrialError::TeamBusy { .. }), "{err}");
    assert_eq!(h.coordinator.zone_ids(), vec![ZONE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn silent_robot_is_flagged() {
    let h = connected().await;
    h.heartbeat("alpha", "r1", RobotStateCode::Stop).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    let view = h.status(ZONE).await;
    assert!(
        view.state.contains("WARNING: Last robot transmission received"),
        "{}",
        view.state
    );
}
