// HTTP API over the request operations and the job scheduler

use crate::access::Caller;
use crate::error::{TicketError, TicketResult};
use crate::jobs::{OverdueCheck, ReminderRun, Scheduler, SchedulerConfig};
use crate::lifecycle::{NewRequest, RequestUpdate, Tickets};
use crate::models::{Comment, DashboardStats, Page, RequestView};
use crate::query::ListParams;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Header carrying the authenticated user id, set by the fronting gateway
pub const USER_HEADER: &str = "x-user-id";

pub struct AppState {
    pub tickets: Tickets,
    pub scheduler: Scheduler,
}

impl IntoResponse for TicketError {
    fn into_response(self) -> Response {
        let status = match &self {
            TicketError::NotFound { .. } => StatusCode::NOT_FOUND,
            TicketError::NotAllowed(_) => StatusCode::FORBIDDEN,
            TicketError::Unauthenticated => StatusCode::UNAUTHORIZED,
            TicketError::Invalid(_) => StatusCode::BAD_REQUEST,
            TicketError::Internal(e) => {
                error!(error = ?e, "Request failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                )
                    .into_response();
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/requests", get(list_requests).post(create_request))
        .route("/api/requests/:id", get(get_request).put(update_request))
        .route("/api/requests/:id/complete", put(complete_request))
        .route("/api/requests/:id/restore", put(restore_request))
        .route("/api/requests/:id/comments", post(add_comment))
        .route("/api/requests/:id/photos", post(add_photo))
        .route("/api/admin/scheduler", get(scheduler_config))
        .route("/api/admin/scheduler/interval", post(set_poll_interval))
        .route("/api/admin/scheduler/cron", post(set_reminder_cron))
        .route("/api/admin/scheduler/check", post(force_overdue_check))
        .route("/api/admin/scheduler/remind", post(force_reminders))
        .route("/api/admin/requests/:id/created-at", post(backdate_request))
        .route("/api/admin/chats/:chat_id/validate", get(validate_chat))
        .route("/api/admin/stats", get(dashboard_stats))
        .with_state(state)
}

/// Serves the API until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, "HTTP API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;
    Ok(())
}

/// Runs store work on the blocking pool so SQLite I/O and the store mutex
/// never tie up an async worker
async fn blocking<T, F>(state: &AppState, work: F) -> TicketResult<T>
where
    F: FnOnce(&Tickets) -> TicketResult<T> + Send + 'static,
    T: Send + 'static,
{
    let tickets = state.tickets.clone();
    tokio::task::spawn_blocking(move || work(&tickets))
        .await
        .map_err(|e| TicketError::Internal(eyre!("store task failed: {}", e)))?
}

fn user_id(headers: &HeaderMap) -> TicketResult<i64> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or(TicketError::Unauthenticated)
}

async fn caller(state: &AppState, headers: &HeaderMap) -> TicketResult<Caller> {
    let user_id = user_id(headers)?;
    blocking(state, move |tickets| tickets.caller(user_id)).await
}

async fn admin(state: &AppState, headers: &HeaderMap) -> TicketResult<Caller> {
    let caller = caller(state, headers).await?;
    if !caller.is_admin() {
        return Err(TicketError::not_allowed("administrators only"));
    }
    Ok(caller)
}

// ============================================================================
// Requests
// ============================================================================

async fn list_requests(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> TicketResult<Json<Page<RequestView>>> {
    let caller = caller(&state, &headers).await?;
    let params = ListParams::from_pairs(pairs)?;
    let page = blocking(&state, move |tickets| tickets.list(&caller, &params)).await?;
    Ok(Json(page))
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> TicketResult<Json<RequestView>> {
    let caller = caller(&state, &headers).await?;
    Ok(Json(blocking(&state, move |tickets| tickets.get(&caller, id)).await?))
}

async fn create_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<NewRequest>,
) -> TicketResult<(StatusCode, Json<RequestView>)> {
    let caller = caller(&state, &headers).await?;
    let view = blocking(&state, move |tickets| tickets.create(&caller, input)).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn update_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(input): Json<RequestUpdate>,
) -> TicketResult<Json<RequestView>> {
    let caller = caller(&state, &headers).await?;
    Ok(Json(blocking(&state, move |tickets| tickets.update(&caller, id, input)).await?))
}

async fn complete_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> TicketResult<Json<RequestView>> {
    let caller = caller(&state, &headers).await?;
    Ok(Json(blocking(&state, move |tickets| tickets.complete(&caller, id)).await?))
}

async fn restore_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> TicketResult<Json<RequestView>> {
    let caller = caller(&state, &headers).await?;
    Ok(Json(blocking(&state, move |tickets| tickets.restore(&caller, id)).await?))
}

#[derive(Deserialize)]
struct CommentBody {
    text: String,
}

async fn add_comment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<CommentBody>,
) -> TicketResult<(StatusCode, Json<Comment>)> {
    let caller = caller(&state, &headers).await?;
    let comment = blocking(&state, move |tickets| tickets.add_comment(&caller, id, &body.text)).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PhotoCreated {
    photo_id: i64,
    request_id: i64,
}

/// Body is the raw image
async fn add_photo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    image: Bytes,
) -> TicketResult<(StatusCode, Json<PhotoCreated>)> {
    let caller = caller(&state, &headers).await?;
    let photo_id = blocking(&state, move |tickets| tickets.add_photo(&caller, id, image.to_vec())).await?;
    Ok((StatusCode::CREATED, Json(PhotoCreated { photo_id, request_id: id })))
}

// ============================================================================
// Admin operations
// ============================================================================

async fn scheduler_config(State(state): State<Arc<AppState>>, headers: HeaderMap) -> TicketResult<Json<SchedulerConfig>> {
    admin(&state, &headers).await?;
    Ok(Json(state.scheduler.config().await))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntervalBody {
    poll_interval: u64,
}

async fn set_poll_interval(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IntervalBody>,
) -> TicketResult<Json<SchedulerConfig>> {
    admin(&state, &headers).await?;
    state.scheduler.set_poll_interval(body.poll_interval).await?;
    Ok(Json(state.scheduler.config().await))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CronBody {
    reminder_cron: String,
}

async fn set_reminder_cron(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CronBody>,
) -> TicketResult<Json<SchedulerConfig>> {
    admin(&state, &headers).await?;
    state.scheduler.set_reminder_cron(&body.reminder_cron).await?;
    Ok(Json(state.scheduler.config().await))
}

async fn force_overdue_check(State(state): State<Arc<AppState>>, headers: HeaderMap) -> TicketResult<Json<OverdueCheck>> {
    admin(&state, &headers).await?;
    Ok(Json(state.scheduler.run_overdue_check(true).await?))
}

async fn force_reminders(State(state): State<Arc<AppState>>, headers: HeaderMap) -> TicketResult<Json<ReminderRun>> {
    admin(&state, &headers).await?;
    Ok(Json(state.scheduler.run_reminders().await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedAtBody {
    created_at: i64,
}

/// Rewrites createdAt, then runs one notifying poller tick
async fn backdate_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<CreatedAtBody>,
) -> TicketResult<Json<OverdueCheck>> {
    let caller = admin(&state, &headers).await?;
    blocking(&state, move |tickets| tickets.backdate(&caller, id, body.created_at)).await?;
    Ok(Json(state.scheduler.run_overdue_check(true).await?))
}

async fn dashboard_stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> TicketResult<Json<DashboardStats>> {
    let caller = caller(&state, &headers).await?;
    let stats = blocking(&state, move |tickets| tickets.dashboard(&caller)).await?;
    Ok(Json(stats))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatValidation {
    chat_id: i64,
    valid: bool,
}

async fn validate_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<i64>,
) -> TicketResult<Json<ChatValidation>> {
    admin(&state, &headers).await?;
    let valid = state.tickets.dispatcher().validate_chat(chat_id).await;
    Ok(Json(ChatValidation { chat_id, valid }))
}
