//! REST and stream API for the fleet command central server
//!
//! Two routers share one application state: the operator surface (task
//! management and observability) and the agent-facing surface (host
//! registration, status reports, and the WebSocket command stream). Each
//! public handler corresponds to one endpoint; handlers translate between
//! HTTP and the lifecycle engine, scheduler, registry and dispatcher.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use shared::api::{
    endpoints, headers, ApiEnvelope, AuditQuery, CreateTaskRequest, HostStatusResponse,
    HostTasksQuery, PendingHostView, RegisterRequest, RegisterResponse, StatusReportRequest,
    SystemLoadView, TaskListPage, TaskListQuery, TaskProgress, TaskSummary, TimelineEvent,
};
use shared::config::ServerConfig;
use shared::model::Task;
use shared::protocol::CommandMessage;
use shared::ControlError;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tower::ServiceBuilder;
use tracing::{debug, error, info, warn};

use crate::cache::{self, StatusCache};
use crate::database::{db_audit, db_commands, db_logs, db_stats, db_tasks, ServerDatabase};
use crate::dispatcher::AgentDispatcher;
use crate::lifecycle::LifecycleEngine;
use crate::load_monitor::SystemLoadMonitor;
use crate::registry::HostRegistry;
use crate::scheduler::TaskScheduler;

/// Maximum request body size: 10MB. Prevents memory exhaustion from large
/// request payloads.
const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 200;

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub database: Arc<Mutex<ServerDatabase>>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub scheduler: TaskScheduler,
    pub registry: HostRegistry,
    pub dispatcher: AgentDispatcher,
    pub cache: StatusCache,
    pub load_monitor: Arc<SystemLoadMonitor>,
}

/// Error type returned by handlers; maps the control-plane error vocabulary
/// onto HTTP status codes and the response envelope.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    GatewayTimeout(String),
    Internal(String),
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::Validation(msg) => ApiError::BadRequest(msg),
            ControlError::NotFound(msg) => ApiError::NotFound(msg),
            ControlError::Conflict(msg) => ApiError::Conflict(msg),
            ControlError::Transport(msg) => ApiError::BadGateway(msg),
            ControlError::Timeout(msg) => ApiError::GatewayTimeout(msg),
            ControlError::Storage(msg) | ControlError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            ApiError::Internal(msg) => {
                // Internal detail is logged, not leaked.
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ApiEnvelope::<()>::error(message))).into_response()
    }
}

/// Creates the operator-facing router.
pub fn create_operator_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(endpoints::TASKS, post(handle_create_task).get(handle_list_tasks))
        .route(
            "/api/v1/tasks/{id}",
            get(handle_task_detail).delete(handle_delete_task),
        )
        .route("/api/v1/tasks/{id}/start", post(handle_start_task))
        .route("/api/v1/tasks/{id}/stop", post(handle_cancel_task))
        .route("/api/v1/tasks/{id}/cancel", post(handle_cancel_task))
        .route("/api/v1/tasks/{id}/status", get(handle_task_status))
        .route("/api/v1/tasks/{id}/progress", get(handle_task_progress))
        .route("/api/v1/tasks/{id}/logs", get(handle_task_logs))
        .route("/api/v1/tasks/{id}/timeline", get(handle_task_timeline))
        .route("/api/v1/tasks/{id}/summary", get(handle_task_summary))
        .route("/api/v1/commands/{id}/retry", post(handle_retry_command))
        .route(endpoints::PENDING_HOSTS, get(handle_pending_hosts))
        .route("/api/v1/pending-hosts/{id}/approve", post(handle_approve_host))
        .route("/api/v1/pending-hosts/{id}/reject", post(handle_reject_host))
        .route(endpoints::HOSTS, get(handle_list_hosts))
        .route("/api/v1/hosts/{id}", get(handle_host_detail))
        .route("/api/v1/hosts/{id}/tasks", get(handle_host_tasks))
        .route(endpoints::AUDIT, get(handle_audit_query))
        .route(endpoints::STATISTICS, get(handle_statistics))
        .route(endpoints::SYSTEM_LOAD, get(handle_system_load))
        .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE)))
        .with_state(state)
}

/// Creates the agent-facing router: unary host service plus the command
/// stream upgrade.
pub fn create_agent_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(endpoints::HOST_REGISTER, post(handle_register))
        .route(endpoints::HOST_STATUS, post(handle_report_status))
        .route(endpoints::COMMAND_STREAM, get(handle_command_stream))
        .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE)))
        .with_state(state)
}

/// Validate the optional pre-shared API key in constant time. A server
/// configured with an empty key skips the check entirely.
fn validate_api_key(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    if expected_key.is_empty() {
        return Ok(());
    }

    let provided_key = match headers.get(headers::API_KEY) {
        Some(key) => match key.to_str() {
            Ok(key_str) => key_str,
            Err(_) => {
                warn!("Invalid API key format in header");
                return Err(ApiError::Unauthorized);
            }
        },
        None => {
            warn!("Missing API key header");
            return Err(ApiError::Unauthorized);
        }
    };

    let provided_bytes = provided_key.as_bytes();
    let expected_bytes = expected_key.as_bytes();
    let keys_match = provided_bytes.len() == expected_bytes.len()
        && bool::from(provided_bytes.ct_eq(expected_bytes));

    if !keys_match {
        warn!("Invalid API key provided");
        return Err(ApiError::Unauthorized);
    }

    Ok(())
}

fn page_params(page: Option<u32>, page_size: Option<u32>) -> (u32, u32) {
    let page = page.unwrap_or(1).max(1);
    let size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    (page, size)
}

/// Unauthenticated liveness endpoint for load balancers and orchestrators.
async fn health_check() -> impl IntoResponse {
    Json(ApiEnvelope::<()>::message("ok"))
}

// ---- Operator surface ----

async fn handle_create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let task = state.lifecycle.create_task(request).await?;
    Ok((StatusCode::CREATED, Json(ApiEnvelope::success(task))))
}

async fn handle_list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TaskListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let (page, size) = page_params(query.page, query.page_size);
    let status_key = query.status.map(|s| s.as_str()).unwrap_or("all");
    let name_key = query.name.clone().unwrap_or_default();
    let cache_key = cache::task_list_key(page, size, status_key, &name_key);

    if let Some(cached) = state.cache.get(&cache_key).await {
        if let Ok(page) = serde_json::from_value::<TaskListPage>(cached) {
            return Ok(Json(ApiEnvelope::success(page)));
        }
    }

    let (tasks, total) = {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        db_tasks::list_tasks(conn, page, size, query.status, query.name.as_deref())
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };

    let result = TaskListPage {
        tasks,
        page,
        page_size: size,
        total,
    };
    if let Ok(value) = serde_json::to_value(&result) {
        state.cache.set(&cache_key, value, cache::TTL_TASK_LIST).await;
    }
    Ok(Json(ApiEnvelope::success(result)))
}

async fn handle_task_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let mut db = state.database.lock().await;
    let conn = db
        .get_connection()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let task = db_tasks::get_task(conn, &task_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Task not found: {}", task_id)))?;
    let commands = db_commands::commands_for_task(conn, &task_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(ApiEnvelope::success(serde_json::json!({
        "task": task,
        "commands": commands,
    }))))
}

async fn handle_delete_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let task = get_task_or_404(&state, &task_id).await?;
    if task.status == shared::model::TaskStatus::Running {
        return Err(ApiError::Conflict(format!(
            "Task {} is running and cannot be deleted",
            task_id
        )));
    }

    {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        // Commands, execution records and result snapshots cascade.
        db_tasks::delete_task(conn, &task_id).map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    state.cache.invalidate_task(&task_id).await;
    state.cache.invalidate_listings().await;
    Ok(Json(ApiEnvelope::<()>::message("Task deleted")))
}

async fn handle_start_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    // Admission goes through the scheduler; a worker hands the task to the
    // lifecycle engine once the concurrency invariants allow it.
    let priority = state.lifecycle.task_priority(&task_id).await?;
    let host_ids = state.lifecycle.task_hosts(&task_id).await?;
    state
        .scheduler
        .enqueue_task(&task_id, priority, host_ids)
        .await?;

    state.cache.invalidate_listings().await;
    Ok(Json(ApiEnvelope::<()>::message("Task queued for execution")))
}

async fn handle_cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    // Remove from the scheduler first so an admitted-but-unstarted task
    // does not race the lifecycle cancel.
    let descheduled = state.scheduler.cancel_task(&task_id).await;
    state.lifecycle.cancel_task(&task_id).await?;

    debug!(task_id = %task_id, descheduled = descheduled, "Task canceled via API");
    Ok(Json(ApiEnvelope::<()>::message("Task canceled")))
}

async fn handle_task_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let cache_key = cache::task_status_key(&task_id);
    if let Some(cached) = state.cache.get(&cache_key).await {
        return Ok(Json(ApiEnvelope::success(cached)));
    }

    let task = get_task_or_404(&state, &task_id).await?;
    let value = serde_json::json!({
        "task_id": task.task_id,
        "status": task.status,
        "started_at": task.started_at,
        "finished_at": task.finished_at,
    });
    state
        .cache
        .set(&cache_key, value.clone(), cache::TTL_TASK_STATUS)
        .await;
    Ok(Json(ApiEnvelope::success(value)))
}

async fn handle_task_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let cache_key = cache::task_progress_key(&task_id);
    if let Some(cached) = state.cache.get(&cache_key).await {
        if let Ok(progress) = serde_json::from_value::<TaskProgress>(cached) {
            return Ok(Json(ApiEnvelope::success(progress)));
        }
    }

    let progress = compute_task_progress(&state, &task_id).await?;
    if let Ok(value) = serde_json::to_value(&progress) {
        state
            .cache
            .set(&cache_key, value, cache::TTL_TASK_PROGRESS)
            .await;
    }
    Ok(Json(ApiEnvelope::success(progress)))
}

async fn handle_task_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    get_task_or_404(&state, &task_id).await?;
    let logs = {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        db_logs::logs_for_task(conn, &task_id).map_err(|e| ApiError::Internal(e.to_string()))?
    };
    Ok(Json(ApiEnvelope::success(logs)))
}

async fn handle_task_timeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    get_task_or_404(&state, &task_id).await?;
    let logs = {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        db_logs::logs_for_task(conn, &task_id).map_err(|e| ApiError::Internal(e.to_string()))?
    };

    let timeline: Vec<TimelineEvent> = logs
        .into_iter()
        .map(|entry| TimelineEvent {
            timestamp: entry.timestamp,
            event: entry.message,
            host_id: entry.host_id,
            command_id: entry.command_id,
            detail: entry.details.map(|d| d.to_string()),
        })
        .collect();
    Ok(Json(ApiEnvelope::success(timeline)))
}

async fn handle_task_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let cache_key = cache::task_execution_key(&task_id);
    if let Some(cached) = state.cache.get(&cache_key).await {
        if let Ok(summary) = serde_json::from_value::<TaskSummary>(cached) {
            return Ok(Json(ApiEnvelope::success(summary)));
        }
    }

    let task = get_task_or_404(&state, &task_id).await?;
    let (counts, avg_ms, max_ms) = {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let counts = db_commands::host_status_counts(conn, &task_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let (avg_ms, max_ms) = db_commands::execution_time_stats(conn, &task_id)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        (counts, avg_ms, max_ms)
    };

    let summary = TaskSummary {
        task_id: task.task_id.clone(),
        status: task.status,
        counts,
        avg_execution_time_ms: avg_ms,
        max_execution_time_ms: max_ms,
        started_at: task.started_at,
        finished_at: task.finished_at,
    };
    if let Ok(value) = serde_json::to_value(&summary) {
        state
            .cache
            .set(&cache_key, value, cache::TTL_TASK_EXECUTION)
            .await;
    }
    Ok(Json(ApiEnvelope::success(summary)))
}

async fn handle_retry_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(command_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    state.lifecycle.retry_failed_command(&command_id).await?;
    Ok(Json(ApiEnvelope::<()>::message("Command queued for retry")))
}

async fn handle_pending_hosts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let hosts: Vec<PendingHostView> = state.registry.pending_hosts().await;
    Ok(Json(ApiEnvelope::success(hosts)))
}

async fn handle_approve_host(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(host_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    state.registry.approve(&host_id).await?;
    Ok(Json(ApiEnvelope::<()>::message("Host approved")))
}

async fn handle_reject_host(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(host_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    state.registry.reject(&host_id).await?;
    Ok(Json(ApiEnvelope::<()>::message("Host rejected")))
}

async fn handle_list_hosts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let hosts = state.registry.list_hosts().await?;
    Ok(Json(ApiEnvelope::success(hosts)))
}

async fn handle_host_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(host_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let (host, snapshot) = state.registry.host_detail(&host_id).await?;
    Ok(Json(ApiEnvelope::success(serde_json::json!({
        "host": host,
        "last_status": snapshot,
        "connected": state.dispatcher.is_connected(&host_id).await,
    }))))
}

async fn handle_host_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(host_id): Path<String>,
    Query(query): Query<HostTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let (page, size) = page_params(query.page, query.page_size);
    let status_key = query.status.map(|s| s.as_str()).unwrap_or("all");
    let cache_key = cache::host_tasks_key(&host_id, page, size, status_key);

    if let Some(cached) = state.cache.get(&cache_key).await {
        return Ok(Json(ApiEnvelope::success(cached)));
    }

    let (commands, total) = {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        db_commands::commands_for_host_page(conn, &host_id, page, size, query.status)
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };

    let value = serde_json::json!({
        "host_id": host_id,
        "commands": commands,
        "page": page,
        "page_size": size,
        "total": total,
    });
    state
        .cache
        .set(&cache_key, value.clone(), cache::TTL_HOST_TASKS)
        .await;
    Ok(Json(ApiEnvelope::success(value)))
}

async fn handle_audit_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let (page, size) = page_params(query.page, query.page_size);
    let entries = {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        db_audit::query_audit(
            conn,
            query.entity_type.as_deref(),
            query.entity_id.as_deref(),
            page,
            size,
        )
        .map_err(|e| ApiError::Internal(e.to_string()))?
    };
    Ok(Json(ApiEnvelope::success(entries)))
}

async fn handle_statistics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    if let Some(cached) = state.cache.get(cache::KEY_TASK_STATS_GLOBAL).await {
        return Ok(Json(ApiEnvelope::success(cached)));
    }

    // Refresh today's rollup before reading so the endpoint is usable even
    // between rollup ticks.
    state.lifecycle.rollup_statistics().await?;

    let rows = {
        let mut db = state.database.lock().await;
        let conn = db
            .get_connection()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        db_stats::recent_statistics(conn, 30).map_err(|e| ApiError::Internal(e.to_string()))?
    };

    let value = serde_json::to_value(&rows).map_err(|e| ApiError::Internal(e.to_string()))?;
    state
        .cache
        .set(cache::KEY_TASK_STATS_GLOBAL, value.clone(), cache::TTL_TASK_STATS)
        .await;
    Ok(Json(ApiEnvelope::success(value)))
}

async fn handle_system_load(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let load = state.load_monitor.current_load().await;
    let (cpu, memory, concurrency) = state.load_monitor.current_dimensions().await;
    let stats = state.scheduler.stats().await;
    let view = SystemLoadView {
        load,
        cpu_percent: cpu,
        memory_percent: memory,
        concurrency_percent: concurrency,
        recommended_concurrency: state
            .load_monitor
            .recommended_concurrency(stats.max_concurrent_tasks)
            .await,
        overloaded: state.load_monitor.is_overloaded().await,
        window: state.load_monitor.window_stats().await,
    };
    Ok(Json(ApiEnvelope::success(view)))
}

// ---- Agent-facing surface ----

async fn handle_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    match state.registry.register(&request.host).await {
        Ok(()) => Ok(Json(RegisterResponse {
            success: true,
            assigned_id: request.host.id.clone(),
            error_message: String::new(),
        })),
        Err(ControlError::Validation(msg)) => Ok(Json(RegisterResponse {
            success: false,
            assigned_id: String::new(),
            error_message: msg,
        })),
        Err(e) => Err(e.into()),
    }
}

async fn handle_report_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StatusReportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    match state.registry.report_status(&request.status).await {
        Ok(()) => {
            // Feed the scheduler's admission table from the report.
            state
                .scheduler
                .update_host_load(
                    &request.status.host_id,
                    request.status.cpu.usage_percent,
                    request.status.memory.usage_percent,
                )
                .await;
            Ok(Json(HostStatusResponse {
                success: true,
                message: "ok".to_string(),
            }))
        }
        Err(ControlError::NotFound(msg)) => {
            // The agent resets its registered flag on this message.
            Ok(Json(HostStatusResponse {
                success: false,
                message: msg,
            }))
        }
        Err(e) => Err(e.into()),
    }
}

/// Upgrade to the bidirectional command stream.
async fn handle_command_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    Ok(ws.on_upgrade(move |socket| handle_agent_stream(socket, state)))
}

/// Per-stream task: bind the host id from the first frame, register the
/// outbound channel with the dispatcher (flushing any buffer), then pump
/// frames in both directions until the socket closes.
async fn handle_agent_stream(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // The first message on the stream identifies the agent.
    let host_id = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match CommandMessage::from_frame(text.as_str()) {
                Ok(message) => break message.host_id().to_string(),
                Err(e) => {
                    warn!(error = %e, "Malformed first frame on command stream");
                    return;
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                debug!("Command stream closed before identification");
                return;
            }
            Some(Ok(_)) => {
                warn!("Non-text first frame on command stream");
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Command stream error before identification");
                return;
            }
        }
    };

    if host_id.is_empty() {
        warn!("Command stream bound with empty host id, dropping");
        return;
    }

    info!(host_id = %host_id, "Agent command stream connected");

    // Outbound half: the dispatcher writes into this channel, the writer
    // task forwards frames onto the socket.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<CommandMessage>(64);
    state.dispatcher.register_stream(&host_id, outbound_tx).await;

    let writer_host = host_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let frame = match message.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(host_id = %writer_host, error = %e, "Frame serialization failed");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(frame.into())).await {
                warn!(host_id = %writer_host, error = %e, "Stream write failed");
                break;
            }
        }
    });

    // Inbound half: route every frame through the dispatcher.
    while let Some(received) = stream.next().await {
        match received {
            Ok(Message::Text(text)) => match CommandMessage::from_frame(text.as_str()) {
                Ok(message) => state.dispatcher.handle_incoming(message).await,
                Err(e) => warn!(host_id = %host_id, error = %e, "Malformed stream frame"),
            },
            Ok(Message::Close(_)) => {
                debug!(host_id = %host_id, "Agent closed command stream");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(host_id = %host_id, error = %e, "Command stream error");
                break;
            }
        }
    }

    writer.abort();
    state.dispatcher.handle_stream_closed(&host_id).await;
    info!(host_id = %host_id, "Agent command stream disconnected");
}

// ---- Shared helpers ----

async fn get_task_or_404(state: &AppState, task_id: &str) -> Result<Task, ApiError> {
    let mut db = state.database.lock().await;
    let conn = db
        .get_connection()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    db_tasks::get_task(conn, task_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Task not found: {}", task_id)))
}

async fn compute_task_progress(state: &AppState, task_id: &str) -> Result<TaskProgress, ApiError> {
    let mut db = state.database.lock().await;
    let conn = db
        .get_connection()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let task = db_tasks::get_task(conn, task_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Task not found: {}", task_id)))?;
    let counts = db_commands::host_status_counts(conn, task_id)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let get = |key: &str| counts.get(key).copied().unwrap_or(0);
    let failed = get("failed") + get("exec_failed") + get("timeout");
    let canceled = get("canceled");
    let completed = get("completed");
    let settled = completed + failed + canceled;
    let percent = if task.total_hosts == 0 {
        100
    } else {
        settled * 100 / task.total_hosts
    };

    Ok(TaskProgress {
        task_id: task.task_id,
        status: task.status,
        total_hosts: task.total_hosts,
        completed_hosts: completed,
        failed_hosts: failed,
        running_hosts: get("running"),
        pending_hosts: get("pending"),
        canceled_hosts: canceled,
        percent,
    })
}
