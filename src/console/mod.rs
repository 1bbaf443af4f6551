//! Operator console over HTTP
//!
//! JSON routes over a shared [`Coordinator`]: schedule and robots listing,
//! zone connect/disconnect, referee commands, status snapshots, and a small
//! bridge that lets an external benchmarking box read and write bus topics.
//!
//! A bridged peer counts as a publisher on a topic for
//! `bridge_publisher_ttl` after each post to it. A peer that publishes
//! rarely keeps its lease alive with `POST /publishers/{topic}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::{RsbbError, TrialError};
use crate::trial::ScoreUpdate;

// ============================================================================
// Errors
// ============================================================================

/// A [`TrialError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ConsoleError(TrialError);

impl From<TrialError> for ConsoleError {
    fn from(error: TrialError) -> Self {
        Self(error)
    }
}

impl ConsoleError {
    const fn status(&self) -> StatusCode {
        match &self.0 {
            TrialError::UnknownZone(_) | TrialError::UnknownEvent(_) | TrialError::Stopped(_) => {
                StatusCode::NOT_FOUND
            }
            TrialError::ZoneExists(_)
            | TrialError::NoRobot { .. }
            | TrialError::TeamBusy { .. }
            | TrialError::NoPassword { .. } => StatusCode::CONFLICT,
            TrialError::InvalidState { .. } | TrialError::Channel(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "console request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ConsoleResult<T> = Result<T, ConsoleError>;

// ============================================================================
// Router
// ============================================================================

/// Builds the console router.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/schedule", get(schedule))
        .route("/robots", get(robots))
        .route("/zones", get(zones))
        .route("/zones/{id}", get(zone).delete(disconnect))
        .route("/zones/{id}/connect", post(connect))
        .route("/zones/{id}/start", post(start))
        .route("/zones/{id}/stop", post(stop))
        .route("/zones/{id}/score", post(score))
        .route("/zones/{id}/manual-operation", post(manual_operation))
        .route("/zones/{id}/omf/complete", post(omf_complete))
        .route("/zones/{id}/omf/damaged", post(omf_damaged))
        .route("/zones/{id}/omf/button", post(omf_button))
        .route("/bus/{*topic}", get(bus_latest).post(bus_publish))
        .route("/publishers/{*topic}", post(bus_keepalive))
        .with_state(coordinator)
}

/// Binds `addr` and serves the console until `cancel` fires.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be bound.
pub async fn serve(
    addr: &str,
    coordinator: Arc<Coordinator>,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), RsbbError> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let app = router(coordinator);
    let handle = tokio::spawn(async move {
        info!(%bound, "operator console listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .ok();
        debug!("operator console shut down");
    });
    Ok((bound, handle))
}

// ============================================================================
// Handlers
// ============================================================================

type Shared = State<Arc<Coordinator>>;

fn accepted(id: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, Json(json!({ "zone": id })))
}

async fn schedule(State(coordinator): Shared) -> impl IntoResponse {
    Json(coordinator.schedule())
}

async fn robots(State(coordinator): Shared) -> impl IntoResponse {
    Json(coordinator.active_robots())
}

async fn zones(State(coordinator): Shared) -> impl IntoResponse {
    Json(coordinator.snapshots().await)
}

async fn zone(State(coordinator): Shared, Path(id): Path<String>) -> ConsoleResult<Response> {
    Ok(Json(coordinator.snapshot(&id).await?).into_response())
}

async fn connect(State(coordinator): Shared, Path(id): Path<String>) -> ConsoleResult<Response> {
    coordinator.connect(&id).await?;
    Ok((StatusCode::CREATED, Json(json!({ "zone": id }))).into_response())
}

async fn disconnect(State(coordinator): Shared, Path(id): Path<String>) -> ConsoleResult<StatusCode> {
    coordinator.disconnect(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start(State(coordinator): Shared, Path(id): Path<String>) -> ConsoleResult<Response> {
    coordinator.start(&id)?;
    Ok(accepted(&id).into_response())
}

async fn stop(State(coordinator): Shared, Path(id): Path<String>) -> ConsoleResult<Response> {
    coordinator.stop(&id)?;
    Ok(accepted(&id).into_response())
}

async fn score(
    State(coordinator): Shared,
    Path(id): Path<String>,
    Json(update): Json<ScoreUpdate>,
) -> ConsoleResult<Response> {
    coordinator.score(&id, update)?;
    Ok(accepted(&id).into_response())
}

async fn manual_operation(State(coordinator): Shared, Path(id): Path<String>) -> ConsoleResult<Response> {
    coordinator.manual_operation_complete(&id)?;
    Ok(accepted(&id).into_response())
}

async fn omf_complete(State(coordinator): Shared, Path(id): Path<String>) -> ConsoleResult<Response> {
    coordinator.omf_complete(&id)?;
    Ok(accepted(&id).into_response())
}

#[derive(Debug, Deserialize)]
struct DamagedBody {
    damaged: u8,
}

async fn omf_damaged(
    State(coordinator): Shared,
    Path(id): Path<String>,
    Json(body): Json<DamagedBody>,
) -> ConsoleResult<Response> {
    coordinator.omf_damaged(&id, body.damaged)?;
    Ok(accepted(&id).into_response())
}

#[derive(Debug, Deserialize)]
struct ButtonBody {
    button: u8,
}

async fn omf_button(
    State(coordinator): Shared,
    Path(id): Path<String>,
    Json(body): Json<ButtonBody>,
) -> ConsoleResult<Response> {
    coordinator.omf_button(&id, body.button)?;
    Ok(accepted(&id).into_response())
}

fn bus_topic(topic: &str) -> String {
    format!("/{}", topic.trim_start_matches('/'))
}

async fn bus_publish(
    State(coordinator): Shared,
    Path(topic): Path<String>,
    Json(message): Json<Value>,
) -> StatusCode {
    let topic = bus_topic(&topic);
    debug!(%topic, "bus message from console");
    let bus = coordinator.bus();
    bus.refresh_publisher(&topic, bridge_ttl(&coordinator));
    bus.publish(&topic, message);
    StatusCode::ACCEPTED
}

async fn bus_keepalive(State(coordinator): Shared, Path(topic): Path<String>) -> StatusCode {
    let topic = bus_topic(&topic);
    coordinator.bus().refresh_publisher(&topic, bridge_ttl(&coordinator));
    StatusCode::NO_CONTENT
}

fn bridge_ttl(coordinator: &Coordinator) -> std::time::Duration {
    coordinator.config().settings.bridge_publisher_ttl
}

async fn bus_latest(State(coordinator): Shared, Path(topic): Path<String>) -> Response {
    let topic = bus_topic(&topic);
    let latest = coordinator.bus().subscribe(&topic).borrow().clone();
    match latest {
        Some(value) => Json(value).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("nothing published on {topic}") })),
        )
            .into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, MemoryBus};
    use crate::config::{BenchmarkDescriptor, Catalog, Passwords, RsbbConfig, Settings, TrialEvent, TrialKind};
    use crate::transport::MemoryNetwork;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn app() -> Router {
        let benchmark = Arc::new(BenchmarkDescriptor {
            name: "Plain".to_string(),
            desc: String::new(),
            code: "PLN".to_string(),
            timeout: Duration::from_secs(60),
            total_timeout: Duration::from_secs(60),
            kind: TrialKind::Simple,
            device_control: false,
            external: None,
            scoring: Vec::new(),
        });
        let config = RsbbConfig {
            settings: Settings::default(),
            catalog: Catalog::new(BTreeMap::from([("PLN".to_string(), Arc::clone(&benchmark))])),
            passwords: Passwords::new(BTreeMap::from([("alpha".to_string(), "pw".to_string())])),
            schedule: vec![TrialEvent {
                team: "alpha".to_string(),
                round: 1,
                run: 1,
                robot: None,
                benchmark,
                password: "pw".to_string(),
            }],
        };
        let coordinator = Coordinator::new(
            Arc::new(config),
            Arc::new(MemoryBus::new()),
            Arc::new(MemoryNetwork::new()),
            CancellationToken::new(),
        );
        router(Arc::new(coordinator))
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn schedule_lists_events() {
        let resp = app()
            .oneshot(Request::get("/schedule").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body[0]["id"], "PLN-alpha-r1-1");
        assert_eq!(body[0]["connected"], false);
    }

    #[tokio::test]
    async fn unknown_zone_is_404() {
        let resp = app()
            .oneshot(Request::post("/zones/nope/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn connect_without_robot_is_409() {
        let resp = app()
            .oneshot(
                Request::post("/zones/PLN-alpha-r1-1/connect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn bus_bridge_round_trips() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(
                Request::post("/bus/bmbox/bmbox_state")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"state":"READY","payload":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = app
            .oneshot(Request::get("/bus/bmbox/bmbox_state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["state"], "READY");
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_posts_hold_a_publisher_lease() {
        let bus = Arc::new(MemoryBus::new());
        let coordinator = Coordinator::new(
            Arc::new(RsbbConfig {
                settings: Settings::default(),
                catalog: Catalog::new(BTreeMap::new()),
                passwords: Passwords::new(BTreeMap::new()),
                schedule: Vec::new(),
            }),
            bus.clone(),
            Arc::new(MemoryNetwork::new()),
            CancellationToken::new(),
        );
        let app = router(Arc::new(coordinator));
        assert_eq!(bus.publisher_count("/fbm/bmbox_state"), 0);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/bus/fbm/bmbox_state")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"state":"READY","payload":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(bus.publisher_count("/fbm/bmbox_state"), 1);

        tokio::time::sleep(Duration::from_secs(8)).await;
        let resp = app
            .oneshot(Request::post("/publishers/fbm/bmbox_state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(bus.publisher_count("/fbm/bmbox_state"), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(bus.publisher_count("/fbm/bmbox_state"), 0);
    }

    #[tokio::test]
    async fn unpublished_topic_is_404() {
        let resp = app()
            .oneshot(Request::get("/bus/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
