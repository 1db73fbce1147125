//! Admin HTTP API.
//!
//! Provides:
//! - `GET /health`, `GET /metrics` - daemon observability
//! - `GET|POST /features` - registry listing and registration
//! - `GET /features/{id}/state`, `GET /features/{id}/history` - inspection
//! - `POST /features/{id}/{start,pause,resume,rollback,rearm,abandon}` -
//!   operator commands
//! - `POST /samples` - sample ingestion for out-of-process callers
//! - `GET /route/{feature_id}/{user_id}` - routing queries for dashboards

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use crate::audit::AuditTrail;
use crate::controller::RolloutController;
use crate::evaluator::HealthEvaluator;
use crate::metrics;
use crate::registry::FeatureRegistry;
use crate::router::VariantRouter;
use crate::sampler::MetricSampler;
use crate::store::StateStore;
use ramp_common::errors::RolloutError;
use ramp_common::{
    Feature, FeatureId, FeatureThresholds, RolloutCommand, RolloutState, Variant, fresh_seed,
};

/// Actor recorded for commands that omit the `X-Ramp-Actor` header.
const DEFAULT_ACTOR: &str = "api";

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<FeatureRegistry>,
    pub store: Arc<StateStore>,
    pub controller: Arc<RolloutController>,
    pub audit: Arc<AuditTrail>,
    pub evaluator: Arc<HealthEvaluator>,
    pub variant_router: Arc<VariantRouter>,
    pub sampler: MetricSampler,
    pub version: &'static str,
    pub started_at: Instant,
}

/// Create the admin API router.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/features", get(list_features_handler).post(register_handler))
        .route("/features/{id}/state", get(feature_state_handler))
        .route("/features/{id}/history", get(history_handler))
        .route("/features/{id}/start", post(start_handler))
        .route("/features/{id}/pause", post(pause_handler))
        .route("/features/{id}/resume", post(resume_handler))
        .route("/features/{id}/rollback", post(rollback_handler))
        .route("/features/{id}/rearm", post(rearm_handler))
        .route("/features/{id}/abandon", post(abandon_handler))
        .route("/samples", post(samples_handler))
        .route("/route/{feature_id}/{user_id}", get(route_handler))
        .with_state(Arc::new(state))
}

/// Map a domain error to an HTTP response.
fn error_response(err: RolloutError) -> axum::response::Response {
    let status = match &err {
        RolloutError::UnknownFeature(_) => StatusCode::NOT_FOUND,
        RolloutError::FeatureExists(_) => StatusCode::CONFLICT,
        RolloutError::InvalidPercentage(_) | RolloutError::Config(_) => StatusCode::BAD_REQUEST,
        RolloutError::InvalidTransition { .. }
        | RolloutError::ConcurrentTransitionConflict { .. } => StatusCode::CONFLICT,
        RolloutError::InsufficientData(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RolloutError::StateStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn actor_from(headers: &HeaderMap) -> String {
    headers
        .get("x-ramp-actor")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "features_registered": state.registry.len(),
        "state_store_available": state.store.is_available(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

async fn list_features_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let features: Vec<_> = state
        .registry
        .all()
        .into_iter()
        .map(|feature| {
            let rollout = state.store.get(&feature.id);
            json!({
                "feature": feature,
                "stage": rollout.as_ref().map(|s| s.stage.to_string()),
                "current_percentage": rollout.as_ref().map(|s| s.current_percentage),
            })
        })
        .collect();
    Json(json!({ "features": features }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    id: String,
    #[serde(default)]
    description: String,
    thresholds: FeatureThresholds,
}

/// Register a feature and create its `Off` rollout state.
async fn register_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<RegisterRequest>,
) -> axum::response::Response {
    let feature = Feature::new(req.id, req.description);
    let id = feature.id.clone();

    if let Err(e) = state.registry.register(feature, req.thresholds) {
        return error_response(e);
    }
    let initial = RolloutState::initial(id.clone(), fresh_seed());
    match state.store.insert_initial(initial) {
        Ok(_persist) => {
            let rollout = state.store.get(&id);
            (StatusCode::CREATED, Json(json!({ "state": rollout }))).into_response()
        }
        Err(e) => {
            // Unwind so a failed registration leaves no half-registered
            // feature behind.
            state.registry.remove(&id);
            error_response(e)
        }
    }
}

/// Current rollout state plus the live new-variant health aggregate.
async fn feature_state_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let feature_id = FeatureId::new(id);
    let Some(rollout) = state.store.get(&feature_id) else {
        return error_response(RolloutError::UnknownFeature(feature_id));
    };
    let health = state.evaluator.aggregate(&feature_id, Variant::New);
    Json(json!({ "state": rollout, "new_variant_health": health })).into_response()
}

async fn history_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let feature_id = FeatureId::new(id);
    if state.registry.get(&feature_id).is_none() {
        return error_response(RolloutError::UnknownFeature(feature_id));
    }
    Json(json!({ "history": state.audit.history(&feature_id) })).into_response()
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    target_percentage: f64,
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    reason: String,
}

async fn apply_command(
    state: &HttpState,
    id: String,
    command: RolloutCommand,
    headers: &HeaderMap,
) -> axum::response::Response {
    let envelope = ramp_common::CommandEnvelope::new(
        FeatureId::new(id),
        command,
        actor_from(headers),
    );
    match state.controller.submit_command(envelope).await {
        Ok(rollout) => Json(json!({ "state": rollout })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn start_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StartRequest>,
) -> axum::response::Response {
    let command = RolloutCommand::Start {
        target_percentage: req.target_percentage,
    };
    apply_command(&state, id, command, &headers).await
}

async fn pause_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    apply_command(&state, id, RolloutCommand::Pause, &headers).await
}

async fn resume_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    apply_command(&state, id, RolloutCommand::Resume, &headers).await
}

async fn rollback_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RollbackRequest>,
) -> axum::response::Response {
    let command = RolloutCommand::Rollback { reason: req.reason };
    apply_command(&state, id, command, &headers).await
}

async fn rearm_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    apply_command(&state, id, RolloutCommand::Rearm, &headers).await
}

async fn abandon_handler(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    apply_command(&state, id, RolloutCommand::Abandon, &headers).await
}

#[derive(Debug, Deserialize)]
struct SampleRequest {
    feature_id: String,
    variant: Variant,
    success: bool,
    latency_ms: u64,
    #[serde(default)]
    error_kind: Option<String>,
}

/// Ingest one health observation. Always accepted; backpressure is handled
/// by dropping inside the sampler, never by blocking the caller.
async fn samples_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<SampleRequest>,
) -> impl IntoResponse {
    state.sampler.record_sample(
        FeatureId::new(req.feature_id),
        req.variant,
        req.success,
        req.latency_ms,
        req.error_kind,
    );
    StatusCode::ACCEPTED
}

async fn route_handler(
    State(state): State<Arc<HttpState>>,
    Path((feature_id, user_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let variant = state
        .variant_router
        .route(&FeatureId::new(&feature_id), &user_id);
    Json(json!({
        "feature_id": feature_id,
        "user_id": user_id,
        "variant": variant,
    }))
}

/// Start the admin API server.
pub async fn start_server(
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<Result<(), std::io::Error>> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("Starting admin API on port {}", port);

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::SinkSet;
    use crate::sampler::{self, SampleWindows};
    use axum::body::Body;
    use axum::http::Request;
    use ramp_common::ControllerConfig;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            tick_interval_secs: 1,
            canary_percentage: 5.0,
            ramp_step_percentage: 20.0,
            dwell_ticks: 2,
            sample_window_secs: 300,
            max_window_samples: 10_000,
            router_refresh_secs: 1,
        }
    }

    fn make_test_state() -> HttpState {
        let registry = Arc::new(FeatureRegistry::new());
        let store = Arc::new(StateStore::new());
        let windows = Arc::new(SampleWindows::new(Duration::from_secs(300), 10_000));
        let evaluator = Arc::new(HealthEvaluator::new(
            Arc::clone(&windows),
            Arc::clone(&registry),
        ));
        let audit = Arc::new(AuditTrail::new());
        let controller = Arc::new(RolloutController::new(
            test_config(),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&evaluator),
            Arc::clone(&audit),
            SinkSet::default(),
        ));
        let (sampler, rx) = MetricSampler::new(sampler::DEFAULT_CHANNEL_CAPACITY);
        sampler::start_drain_task(rx, Arc::clone(&windows));

        HttpState {
            registry,
            store,
            controller,
            audit,
            evaluator,
            variant_router: Arc::new(VariantRouter::new()),
            sampler,
            version: "0.4.2-test",
            started_at: Instant::now(),
        }
    }

    async fn send(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn register_body() -> serde_json::Value {
        json!({
            "id": "widget",
            "description": "widget checkout path",
            "thresholds": {
                "min_sample_threshold": 100,
                "degraded_error_rate": 0.05,
                "critical_error_rate": 0.10,
                "degraded_latency_ms": 500,
                "critical_latency_ms": 2000,
            }
        })
    }

    #[tokio::test]
    async fn health_endpoint_reports_daemon_state() {
        let router = create_router(make_test_state());
        let (status, json) = send(router, "GET", "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["version"], "0.4.2-test");
        assert_eq!(json["features_registered"], 0);
        assert_eq!(json["state_store_available"], true);
    }

    #[tokio::test]
    async fn register_creates_feature_in_off_stage() {
        let state = make_test_state();
        let router = create_router(state.clone());

        let (status, json) = send(router.clone(), "POST", "/features", Some(register_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["state"]["stage"], "off");
        assert_eq!(json["state"]["current_percentage"], 0.0);

        let (status, json) = send(router, "GET", "/features", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["features"].as_array().unwrap().len(), 1);
        assert_eq!(json["features"][0]["feature"]["id"], "widget");
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let router = create_router(make_test_state());
        let (status, _) =
            send(router.clone(), "POST", "/features", Some(register_body())).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, json) = send(router, "POST", "/features", Some(register_body())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("widget"));
    }

    #[tokio::test]
    async fn failed_registration_leaves_no_registry_entry() {
        let state = make_test_state();
        let router = create_router(state.clone());

        // A leftover rollout state makes the store insert fail; the
        // registry entry created first must be unwound with it.
        state
            .store
            .insert_initial(RolloutState::initial(FeatureId::new("widget"), 1))
            .unwrap();

        let (status, _) = send(router, "POST", "/features", Some(register_body())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(state.registry.get(&FeatureId::new("widget")).is_none());
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn start_command_moves_feature_to_canary() {
        let router = create_router(make_test_state());
        send(router.clone(), "POST", "/features", Some(register_body())).await;

        let (status, json) = send(
            router.clone(),
            "POST",
            "/features/widget/start",
            Some(json!({ "target_percentage": 100.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"]["stage"], "canary");
        assert_eq!(json["state"]["current_percentage"], 5.0);
        assert_eq!(json["state"]["target_percentage"], 100.0);

        let (status, json) = send(router, "GET", "/features/widget/history", None).await;
        assert_eq!(status, StatusCode::OK);
        let history = json["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["trigger"], "manual");
        assert_eq!(history[0]["actor"], "api");
    }

    #[tokio::test]
    async fn invalid_transition_is_conflict() {
        let router = create_router(make_test_state());
        send(router.clone(), "POST", "/features", Some(register_body())).await;

        // Pause before any rollout started.
        let (status, json) =
            send(router, "POST", "/features/widget/pause", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("pause"));
    }

    #[tokio::test]
    async fn unknown_feature_is_not_found() {
        let router = create_router(make_test_state());

        let (status, _) = send(router.clone(), "GET", "/features/ghost/state", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            router,
            "POST",
            "/features/ghost/start",
            Some(json!({ "target_percentage": 50.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rollback_records_actor_header() {
        let state = make_test_state();
        let router = create_router(state.clone());
        send(router.clone(), "POST", "/features", Some(register_body())).await;
        send(
            router.clone(),
            "POST",
            "/features/widget/start",
            Some(json!({ "target_percentage": 100.0 })),
        )
        .await;

        let request = Request::builder()
            .method("POST")
            .uri("/features/widget/rollback")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-ramp-actor", "oncall-jamie")
            .body(Body::from(
                json!({ "reason": "checkout conversion dropped" }).to_string(),
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let history = state.audit.history(&FeatureId::new("widget"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].actor, "oncall-jamie");
        assert_eq!(history[1].reason, "checkout conversion dropped");
    }

    #[tokio::test]
    async fn samples_are_accepted_and_aggregated() {
        let state = make_test_state();
        let router = create_router(state.clone());
        send(router.clone(), "POST", "/features", Some(register_body())).await;

        for _ in 0..10 {
            let (status, _) = send(
                router.clone(),
                "POST",
                "/samples",
                Some(json!({
                    "feature_id": "widget",
                    "variant": "new",
                    "success": true,
                    "latency_ms": 42,
                })),
            )
            .await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }

        // The drain task runs concurrently; yield until it catches up.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if state
                .evaluator
                .aggregate(&FeatureId::new("widget"), Variant::New)
                .sample_count
                == 10
            {
                return;
            }
        }
        panic!("samples were not drained into the window");
    }

    #[tokio::test]
    async fn route_endpoint_defaults_to_legacy() {
        let router = create_router(make_test_state());
        let (status, json) = send(router, "GET", "/route/widget/user-1", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["variant"], "legacy");
        assert_eq!(json["user_id"], "user-1");
    }

    #[tokio::test]
    async fn metrics_endpoint_exports_prometheus_text() {
        let _ = metrics::register_metrics();
        let router = create_router(make_test_state());

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# HELP") || text.is_empty());
    }
}
