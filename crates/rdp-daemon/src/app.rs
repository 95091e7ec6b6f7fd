// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control surface.
//!
//! Thin JSON endpoints over [`SchedulingService`] and [`AuditTrail`]: the
//! idempotent batch operations, per-subscription actions, and read-side
//! listings. Authentication fronts this surface in deployment; the daemon
//! itself binds to loopback by default.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rdp_audit::{AuditError, AuditTrail};
use rdp_core::model::NewSubscription;
use rdp_core::SubscriptionStatus;
use rdp_sched::{SchedError, SchedulingService};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state behind every endpoint.
pub struct AppState {
    /// Scheduling actions.
    pub service: SchedulingService,
    /// Trail reconstruction.
    pub audit: AuditTrail,
}

/// Build the control router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/scheduling/tick", post(tick))
        .route("/scheduling/compute-next", post(compute_next))
        .route("/scheduling/outbox/dispatch", post(dispatch_outbox))
        .route("/scheduling/subscriptions", post(create_subscription).get(list_subscriptions))
        .route("/scheduling/subscriptions/{id}", get(get_subscription))
        .route("/scheduling/subscriptions/{id}/enable", post(enable_subscription))
        .route("/scheduling/subscriptions/{id}/disable", post(disable_subscription))
        .route("/scheduling/subscriptions/{id}/run", post(run_subscription))
        .route("/scheduling/runs", get(list_runs))
        .route("/scheduling/outbox", get(list_outbox))
        .route("/observability/snapshot", get(observability_snapshot))
        .route("/documents/{id}/audit-trail", get(document_trail))
        .route(
            "/documents/{id}/versions/{version_id}/audit-trail",
            get(version_trail),
        )
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<SchedError> for ApiError {
    fn from(err: SchedError) -> Self {
        let status = match &err {
            SchedError::BadSchedule { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SchedError::Store(rdp_store::StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            SchedError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        let status = match &err {
            AuditError::DocumentNotFound { .. } | AuditError::VersionNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            AuditError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

fn not_found(what: &str, id: i64) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: format!("{what} {id} not found"),
    }
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    #[serde(default = "default_batch_size")]
    batch_size: i64,
}

fn default_batch_size() -> i64 {
    100
}

#[derive(Debug, Serialize)]
struct TickResult {
    processed: usize,
}

#[derive(Debug, Serialize)]
struct ComputeNextResult {
    updated: u64,
}

#[derive(Debug, Serialize)]
struct DispatchResult {
    published: usize,
}

async fn tick(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchRequest>,
) -> Result<Json<TickResult>, ApiError> {
    let processed = state.service.tick(body.batch_size).await?;
    Ok(Json(TickResult { processed }))
}

async fn compute_next(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchRequest>,
) -> Result<Json<ComputeNextResult>, ApiError> {
    let updated = state.service.compute_next(body.batch_size).await?;
    Ok(Json(ComputeNextResult { updated }))
}

async fn dispatch_outbox(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchRequest>,
) -> Result<Json<DispatchResult>, ApiError> {
    let published = state.service.dispatch_outbox(body.batch_size).await?;
    Ok(Json(DispatchResult { published }))
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewSubscription>,
) -> Result<Json<rdp_core::Subscription>, ApiError> {
    Ok(Json(state.service.create_subscription(body).await?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<rdp_core::Subscription>>, ApiError> {
    let status = query.status.as_deref().and_then(SubscriptionStatus::parse);
    Ok(Json(
        state
            .service
            .list_subscriptions(status, query.limit, query.offset)
            .await?,
    ))
}

async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<rdp_core::Subscription>, ApiError> {
    state
        .service
        .subscription(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("subscription", id))
}

async fn enable_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<rdp_core::Subscription>, ApiError> {
    state
        .service
        .enable_subscription(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("subscription", id))
}

async fn disable_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<rdp_core::Subscription>, ApiError> {
    state
        .service
        .disable_subscription(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("subscription", id))
}

#[derive(Debug, Serialize)]
struct RunNowResult {
    subscription_id: i64,
    run_id: i64,
    outbox_id: i64,
}

async fn run_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RunNowResult>, ApiError> {
    let claim = state.service.run_subscription_now(id).await?;
    Ok(Json(RunNowResult {
        subscription_id: claim.subscription_id,
        run_id: claim.run_id,
        outbox_id: claim.outbox_id,
    }))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<rdp_core::Run>>, ApiError> {
    Ok(Json(state.service.list_runs(query.limit).await?))
}

async fn list_outbox(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<rdp_core::OutboxEntry>>, ApiError> {
    Ok(Json(state.service.list_outbox(query.limit).await?))
}

#[derive(Debug, Serialize)]
struct Snapshot {
    runs: Vec<rdp_core::Run>,
    outbox: Vec<rdp_core::OutboxEntry>,
}

async fn observability_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Snapshot>, ApiError> {
    Ok(Json(Snapshot {
        runs: state.service.list_runs(query.limit).await?,
        outbox: state.service.list_outbox(query.limit).await?,
    }))
}

async fn document_trail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<rdp_audit::AuditEvent>>, ApiError> {
    Ok(Json(state.audit.document_trail(id).await?))
}

async fn version_trail(
    State(state): State<Arc<AppState>>,
    Path((id, version_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<rdp_audit::AuditEvent>>, ApiError> {
    Ok(Json(state.audit.version_trail(id, version_id).await?))
}
