//! HTTP API for submitting broadcasts and observing the daemon

use crate::broadcast::{BroadcastService, TransactionRequest};
use crate::config::{ApiConfig, StrategyMode};
use crate::error::{BroadcastError, BroadcastResult};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BroadcastService>,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, service: Arc<BroadcastService>) -> BroadcastResult<()> {
    let state = AppState { service };

    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BroadcastError::Internal(format!("api bind failed: {}", e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| BroadcastError::Internal(format!("api server failed: {}", e)))?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/broadcasts", post(submit_broadcast))
        .route("/broadcasts/:id", get(broadcast_status))
        .route("/broadcasts/:id", delete(cancel_broadcast))
        .route("/providers", get(provider_health))
        .route("/queue", get(queue_stats))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Submit a transaction for broadcast
async fn submit_broadcast(
    State(state): State<AppState>,
    Json(body): Json<SubmitRequest>,
) -> impl IntoResponse {
    match state
        .service
        .enqueue_broadcast(body.request, body.mode)
        .await
    {
        Ok(id) => (StatusCode::ACCEPTED, Json(SubmitResponse { id })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Get the status of one broadcast
async fn broadcast_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.service.get_status(id).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Cancel a queued or pending broadcast
async fn cancel_broadcast(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.service.cancel(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// Health snapshots of every registered provider
async fn provider_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.provider_health())
}

/// Queue depth and throughput counters
async fn queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.queue_stats())
}

/// Basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: at least one selectable provider somewhere
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.service.provider_health();
    let selectable = providers
        .iter()
        .filter(|p| p.status != crate::provider::health::HealthStatus::Failed)
        .count();

    let response = ReadinessResponse {
        ready: selectable > 0,
        providers: providers.len(),
        selectable,
        active_broadcasts: state.service.active_count(),
    };
    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

fn error_response(error: BroadcastError) -> axum::response::Response {
    let status = match &error {
        BroadcastError::RecordNotFound { .. } | BroadcastError::ChainNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        BroadcastError::Validation(_) => StatusCode::BAD_REQUEST,
        BroadcastError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BroadcastError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// Request and response types

#[derive(Deserialize)]
struct SubmitRequest {
    #[serde(flatten)]
    request: TransactionRequest,
    mode: Option<StrategyMode>,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: Uuid,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    providers: usize,
    selectable: usize,
    active_broadcasts: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BroadcasterConfig, OverflowPolicy};
    use crate::events::EventBus;
    use crate::provider::health::{HealthThresholds, ProviderHealthRegistry};
    use crate::provider::rate_limit::RateLimiter;
    use crate::testing::{test_profile, MockEndpoint, MockSigner};

    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = BroadcasterConfig {
            instance_id: "test".to_string(),
            queue_capacity: 16,
            overflow_policy: OverflowPolicy::Reject,
            priority_enabled: false,
            dispatch_interval_ms: 10,
            max_concurrent: 4,
            default_mode: StrategyMode::Failover,
            fanout: 3,
            quorum_size: 2,
            coordination_timeout_ms: 5000,
            attempt_timeout_secs: 5,
            max_provider_attempts: 3,
            retry_delay_ms: 10,
            max_retries: 3,
            monitor_interval_ms: 50,
            monitor_batch_size: 25,
            history_capacity: 32,
            probe_interval_secs: 30,
            failure_threshold: 3,
            recovery_threshold: 2,
            rate_limit_per_sec: 1000.0,
            rate_limit_burst: 1000.0,
        };

        let events = EventBus::new(64);
        let registry = Arc::new(ProviderHealthRegistry::new(
            HealthThresholds::default(),
            events.clone(),
        ));
        registry.register(
            "p0",
            1,
            1,
            0,
            Arc::new(MockEndpoint::new()),
            RateLimiter::new(1000.0, 1000.0),
        );

        let mut networks = HashMap::new();
        networks.insert(1, test_profile(1));
        let (service, _monitor, _retry_rx) = BroadcastService::build(
            &config,
            networks,
            registry,
            Arc::new(MockSigner::new()),
            events,
        );
        router(AppState { service })
    }

    fn submit_body() -> String {
        serde_json::json!({
            "chain_id": 1,
            "from": "0x00000000000000000000000000000000000a11ce",
            "to": "0x0000000000000000000000000000000000000b0b",
            "value": "0xf4240",
            "data": null,
            "gas_limit": "0x5208",
            "fee_override": null,
            "nonce": null,
            "priority": 5
        })
        .to_string()
    }

    #[tokio::test]
    async fn liveness_and_readiness_respond() {
        let app = app();
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_is_accepted() {
        let response = app()
            .oneshot(
                Request::post("/broadcasts")
                    .header("content-type", "application/json")
                    .body(Body::from(submit_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unknown_broadcast_is_a_404() {
        let uri = format!("/broadcasts/{}", Uuid::new_v4());
        let response = app()
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app()
            .oneshot(Request::delete(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn queue_and_provider_views_respond() {
        let response = app()
            .oneshot(Request::get("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app()
            .oneshot(Request::get("/providers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
