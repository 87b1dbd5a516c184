//! Admin HTTP API: health, metrics, pool inspection, warning management,
//! circuit-breaker control, standby status, and dev-only seeding.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, OpenApi, ToSchema};

use fc_broker::{QueueDepth, QueuePublisher};
use fc_core::{
    tsid, DispatchMode, HealthReport, InFlightInfo, MediationType, MessagePointer, PoolStats,
    Warning, WarningSeverity,
};
use fc_standby::{StandbyService, StandbyStatus};

use crate::breaker::BreakerStats;
use crate::health::HealthService;
use crate::router::RouterHandle;
use crate::supervisor::ConsumerSupervisor;
use crate::warning::WarningService;

#[derive(Clone)]
pub struct AppState {
    pub router: RouterHandle,
    pub supervisor: Arc<ConsumerSupervisor>,
    pub warnings: Arc<WarningService>,
    pub health: Arc<HealthService>,
    pub standby: Arc<StandbyService>,
    pub publisher: Option<Arc<dyn QueuePublisher>>,
    pub prometheus: PrometheusHandle,
    pub dev_mode: bool,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        list_pools,
        pool_stats,
        list_queues,
        in_flight,
        list_warnings,
        acknowledge_warning,
        list_breakers,
        reset_breaker,
        standby_status,
        seed_messages,
    ),
    components(schemas(
        SeedRequest,
        SeedResponse,
        ErrorBody,
        HealthReport,
        PoolStats,
        Warning,
        BreakerStats,
        InFlightInfo
    ))
)]
struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_handler))
        .route("/api/pools", get(list_pools))
        .route("/api/pools/{code}/stats", get(pool_stats))
        .route("/api/queues", get(list_queues))
        .route("/api/messages/in-flight", get(in_flight))
        .route("/api/warnings", get(list_warnings))
        .route("/api/warnings/{id}/acknowledge", post(acknowledge_warning))
        .route("/api/circuit-breakers", get(list_breakers))
        .route("/api/circuit-breakers/{name}/reset", post(reset_breaker))
        .route("/api/standby/status", get(standby_status))
        .route("/api/seed/messages", post(seed_messages))
        .with_state(state)
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

fn not_found(message: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Health of the router's own infrastructure; downstream target failures
/// never surface here.
#[utoipa::path(get, path = "/health", responses(
    (status = 200, body = HealthReport),
    (status = 503, body = HealthReport)
))]
async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state.health.report();
    let status = if report.status == fc_core::HealthStatus::Failed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(get, path = "/api/pools", responses((status = 200, body = [PoolStats])))]
async fn list_pools(State(state): State<AppState>) -> Json<Vec<PoolStats>> {
    Json(state.router.pool_stats().await)
}

#[utoipa::path(get, path = "/api/pools/{code}/stats", params(
    ("code" = String, Path, description = "Pool code")
), responses(
    (status = 200, body = PoolStats),
    (status = 404, body = ErrorBody)
))]
async fn pool_stats(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    match state
        .router
        .pool_stats()
        .await
        .into_iter()
        .find(|s| s.pool_code == code)
    {
        Some(stats) => Json(stats).into_response(),
        None => not_found(format!("pool [{code}] not found")),
    }
}

/// Broker-reported backlog per queue: pending and in-flight counts straight
/// from the backend, as opposed to the router-internal `pool_queue_depth`.
#[utoipa::path(get, path = "/api/queues", responses(
    (status = 200, description = "Pending/in-flight figures per queue, as the broker reports them")
))]
async fn list_queues(State(state): State<AppState>) -> Json<Vec<QueueDepth>> {
    Json(state.supervisor.queue_depths().await)
}

#[derive(Debug, Deserialize, IntoParams)]
struct InFlightQuery {
    /// Maximum entries returned, oldest first.
    limit: Option<usize>,
}

#[utoipa::path(get, path = "/api/messages/in-flight", params(InFlightQuery), responses(
    (status = 200, body = [InFlightInfo])
))]
async fn in_flight(
    State(state): State<AppState>,
    Query(query): Query<InFlightQuery>,
) -> Json<Vec<InFlightInfo>> {
    Json(state.router.in_flight(query.limit.unwrap_or(100)).await)
}

#[derive(Debug, Deserialize, IntoParams)]
struct WarningsQuery {
    /// INFO | WARN | ERROR | CRITICAL
    severity: Option<String>,
    acknowledged: Option<bool>,
}

#[utoipa::path(get, path = "/api/warnings", params(WarningsQuery), responses(
    (status = 200, body = [Warning])
))]
async fn list_warnings(
    State(state): State<AppState>,
    Query(query): Query<WarningsQuery>,
) -> Json<Vec<Warning>> {
    let severity = query.severity.as_deref().map(|s| match s.to_uppercase().as_str() {
        "INFO" => WarningSeverity::Info,
        "WARN" | "WARNING" => WarningSeverity::Warn,
        "ERROR" => WarningSeverity::Error,
        _ => WarningSeverity::Critical,
    });

    let mut warnings = match severity {
        Some(severity) => state.warnings.get_by_severity(severity),
        None => state.warnings.get_all(),
    };
    if let Some(acknowledged) = query.acknowledged {
        warnings.retain(|w| w.acknowledged == acknowledged);
    }
    warnings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(warnings)
}

#[utoipa::path(post, path = "/api/warnings/{id}/acknowledge", params(
    ("id" = String, Path, description = "Warning id")
), responses(
    (status = 204),
    (status = 404, body = ErrorBody)
))]
async fn acknowledge_warning(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.warnings.acknowledge(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(format!("warning [{id}] not found"))
    }
}

#[utoipa::path(get, path = "/api/circuit-breakers", responses(
    (status = 200, body = [BreakerStats])
))]
async fn list_breakers(State(state): State<AppState>) -> Json<Vec<BreakerStats>> {
    Json(state.router.breakers().await)
}

#[utoipa::path(post, path = "/api/circuit-breakers/{name}/reset", params(
    ("name" = String, Path, description = "Breaker name (pool code)")
), responses(
    (status = 204),
    (status = 404, body = ErrorBody)
))]
async fn reset_breaker(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if state.router.reset_breaker(&name).await {
        info!(breaker = %name, "circuit breaker reset via api");
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(format!("circuit breaker [{name}] not found"))
    }
}

#[utoipa::path(get, path = "/api/standby/status", responses(
    (status = 200, description = "Current role, lease health, and traffic state")
))]
async fn standby_status(State(state): State<AppState>) -> Json<StandbyStatus> {
    Json(state.standby.status())
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct SeedRequest {
    #[serde(default = "default_seed_count")]
    count: u32,
    pool_code: String,
    mediation_target: String,
    #[serde(default)]
    message_group_id: Option<String>,
}

fn default_seed_count() -> u32 {
    1
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct SeedResponse {
    published: Vec<String>,
}

/// Produce synthetic pointers. Development only.
#[utoipa::path(post, path = "/api/seed/messages", request_body = SeedRequest, responses(
    (status = 200, body = SeedResponse),
    (status = 403, body = ErrorBody),
    (status = 503, body = ErrorBody)
))]
async fn seed_messages(
    State(state): State<AppState>,
    Json(request): Json<SeedRequest>,
) -> Response {
    if !state.dev_mode {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorBody {
                error: "seeding is only available in dev mode".to_string(),
            }),
        )
            .into_response();
    }

    let Some(publisher) = state.publisher.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: "no publisher configured".to_string(),
            }),
        )
            .into_response();
    };

    let mut published = Vec::with_capacity(request.count as usize);
    for _ in 0..request.count.min(1_000) {
        let pointer = MessagePointer {
            id: tsid::generate(),
            pool_code: request.pool_code.clone(),
            auth_token: None,
            mediation_type: MediationType::HTTP,
            mediation_target: request.mediation_target.clone(),
            message_group_id: request.message_group_id.clone(),
            dispatch_mode: DispatchMode::BlockOnError,
        };

        match publisher.publish(pointer).await {
            Ok(id) => published.push(id),
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: format!("publish failed: {e}"),
                    }),
                )
                    .into_response();
            }
        }
    }

    info!(count = published.len(), pool = %request.pool_code, "seeded synthetic pointers");
    Json(SeedResponse { published }).into_response()
}
