use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio::net::TcpListener;

pub mod error;
pub mod stream;
#[cfg(test)]
mod tests;
pub mod timeouts;

use self::timeouts::parse_run_timeout;
use crate::config::{PORT_SCAN_ATTEMPTS, ServerConfig};
use crate::error::ApiError;
use crate::filter::{apply_display_mode, enforce_token_cap};
use crate::session::{DEFAULT_SESSION_ID, SessionManager, run_sweeper};
use crate::worker_protocol::{DataTable, GraphRef, RunOutcome, WorkerReply, WorkerRequest};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    run_history: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            run_history: Arc::new(AtomicU64::new(0)),
        }
    }

    fn config(&self) -> &ServerConfig {
        self.sessions.config()
    }
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub status: &'static str,
    pub output: String,
    pub log_path: String,
    pub graphs: Vec<GraphRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_to_file: Option<String>,
    pub session_id: String,
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(err.to_string())
}

/// Shared core for `/run_selection` and the MCP tool: resolve the
/// session, dispatch, then post-filter for the consumer.
pub(crate) async fn execute_selection(
    state: &AppState,
    selection: String,
    session_id: Option<String>,
    working_dir: Option<String>,
    timeout_secs: Option<u64>,
    skip_filter: bool,
) -> Result<RunResponse, ApiError> {
    if selection.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "selection must not be empty".to_string(),
        ));
    }
    let timeout = parse_run_timeout(timeout_secs)?;
    let sessions = state.sessions.clone();
    let (entry_id, outcome) = tokio::task::spawn_blocking(move || {
        let entry = sessions.resolve(session_id.as_deref())?;
        entry.set_active_log(entry.session_log_path());
        let request = WorkerRequest::RunSelection {
            code: selection,
            working_dir,
            timeout_secs: timeout.as_secs(),
        };
        let reply = sessions.dispatch(&entry, request, timeout)?;
        Ok::<_, ApiError>((entry.id.clone(), expect_run(reply)?))
    })
    .await
    .map_err(internal)??;

    state.run_history.fetch_add(1, Ordering::Relaxed);
    finish_run_response(state, entry_id, outcome, skip_filter)
}

/// Shared core for `/run_file` and the MCP tool. The run log location
/// follows the configured policy and is announced to the streaming
/// layer before dispatch.
pub(crate) async fn execute_file(
    state: &AppState,
    file_path: String,
    session_id: Option<String>,
    working_dir: Option<String>,
    timeout_secs: Option<u64>,
) -> Result<RunResponse, ApiError> {
    if file_path.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "file_path must not be empty".to_string(),
        ));
    }
    let timeout = parse_run_timeout(timeout_secs)?;
    let sessions = state.sessions.clone();
    let (entry_id, outcome) = tokio::task::spawn_blocking(move || {
        let entry = sessions.resolve(session_id.as_deref())?;
        let log_path = sessions
            .config()
            .run_log_path(Path::new(&file_path), &entry.id);
        entry.set_active_log(log_path.clone());
        let request = WorkerRequest::RunFile {
            path: file_path,
            working_dir,
            timeout_secs: timeout.as_secs(),
            log_path: log_path.display().to_string(),
        };
        let reply = sessions.dispatch(&entry, request, timeout)?;
        Ok::<_, ApiError>((entry.id.clone(), expect_run(reply)?))
    })
    .await
    .map_err(internal)??;

    state.run_history.fetch_add(1, Ordering::Relaxed);
    finish_run_response(state, entry_id, outcome, false)
}

fn expect_run(reply: WorkerReply) -> Result<RunOutcome, ApiError> {
    match reply {
        WorkerReply::RunCompleted { outcome } => Ok(outcome),
        other => Err(ApiError::Internal(format!(
            "unexpected worker reply: {other:?}"
        ))),
    }
}

fn finish_run_response(
    state: &AppState,
    session_id: String,
    outcome: RunOutcome,
    skip_filter: bool,
) -> Result<RunResponse, ApiError> {
    let config = state.config();
    let filtered = if skip_filter {
        outcome.output
    } else {
        apply_display_mode(config.result_display_mode, &outcome.output)
    };

    let log_path = PathBuf::from(&outcome.log_path);
    let spill_dir = log_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.logs_dir());
    let stem = log_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "session".to_string());
    let capped = enforce_token_cap(filtered, config.max_output_tokens, &spill_dir, &stem)
        .map_err(internal)?;

    Ok(RunResponse {
        status: outcome.status.as_str(),
        output: capped.text,
        log_path: outcome.log_path,
        graphs: outcome.graphs,
        truncated_to_file: capped
            .truncated_to_file
            .map(|path| path.display().to_string()),
        session_id,
    })
}

pub(crate) async fn fetch_view_data(
    state: &AppState,
    session_id: Option<String>,
    if_condition: Option<String>,
    max_rows: Option<u64>,
) -> Result<DataTable, ApiError> {
    // No hard upper limit; the floor keeps pathological requests from
    // returning nothing useful.
    let max_rows = max_rows.unwrap_or(10_000).max(100);
    let sessions = state.sessions.clone();
    let reply = tokio::task::spawn_blocking(move || {
        let entry = sessions.resolve(session_id.as_deref())?;
        sessions.dispatch(
            &entry,
            WorkerRequest::ViewData {
                if_condition,
                max_rows,
            },
            Duration::from_secs(60),
        )
    })
    .await
    .map_err(internal)??;
    match reply {
        WorkerReply::Data { table } => Ok(table),
        other => Err(ApiError::Internal(format!(
            "unexpected worker reply: {other:?}"
        ))),
    }
}

pub(crate) async fn restart_session_op(
    state: &AppState,
    session_id: Option<String>,
) -> Result<String, ApiError> {
    let sessions = state.sessions.clone();
    tokio::task::spawn_blocking(move || {
        let entry = sessions.resolve(session_id.as_deref())?;
        sessions.dispatch(&entry, WorkerRequest::Restart, Duration::from_secs(60))?;
        entry.graphs.clear();
        Ok::<_, ApiError>(entry.id.clone())
    })
    .await
    .map_err(internal)?
}

pub(crate) async fn create_session_op(state: &AppState) -> Result<String, ApiError> {
    let sessions = state.sessions.clone();
    tokio::task::spawn_blocking(move || {
        if !sessions.multi_session() {
            return Err(ApiError::BadRequest(
                "multi-session mode is not enabled; start the server with --multi-session"
                    .to_string(),
            ));
        }
        sessions.create_session().map(|entry| entry.id.clone())
    })
    .await
    .map_err(internal)?
}

pub(crate) async fn destroy_session_op(state: &AppState, id: String) -> Result<bool, ApiError> {
    let sessions = state.sessions.clone();
    tokio::task::spawn_blocking(move || Ok::<_, ApiError>(sessions.destroy(&id)))
        .await
        .map_err(internal)?
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RunSelectionBody {
    selection: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    skip_filter: bool,
}

async fn run_selection(
    State(state): State<AppState>,
    Json(body): Json<RunSelectionBody>,
) -> Result<Json<RunResponse>, ApiError> {
    let response = execute_selection(
        &state,
        body.selection,
        body.session_id,
        body.working_dir,
        body.timeout,
        body.skip_filter,
    )
    .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct RunFileQuery {
    file_path: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

async fn run_file(
    State(state): State<AppState>,
    Query(query): Query<RunFileQuery>,
) -> Result<Json<RunResponse>, ApiError> {
    let response = execute_file(
        &state,
        query.file_path,
        query.session_id,
        query.working_dir,
        query.timeout,
    )
    .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct StreamSelectionQuery {
    selection: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

async fn run_selection_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamSelectionQuery>,
) -> Response {
    stream::selection_stream(
        state,
        query.selection,
        query.session_id,
        query.working_dir,
        query.timeout,
    )
    .await
}

async fn run_file_stream(
    State(state): State<AppState>,
    Query(query): Query<RunFileQuery>,
) -> Response {
    stream::file_stream(
        state,
        query.file_path,
        query.session_id,
        query.working_dir,
        query.timeout,
    )
    .await
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(default)]
    session_id: Option<String>,
}

async fn stop_execution(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let sessions = state.sessions.clone();
    let session_id = query.session_id.clone();
    let outcome =
        tokio::task::spawn_blocking(move || sessions.stop_execution(session_id.as_deref()))
            .await
            .map_err(internal)??;
    Ok(Json(json!({
        "status": outcome.as_str(),
        "session_id": query.session_id.unwrap_or_else(|| DEFAULT_SESSION_ID.to_string()),
    })))
}

async fn execution_status(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    match state.sessions.peek(query.session_id.as_deref()) {
        Ok(entry) => Ok(Json(serde_json::to_value(entry.execution_status()).map_err(internal)?)),
        Err(ApiError::SessionNotFound(_)) if query.session_id.is_none() => Ok(Json(json!({
            "state": "ready",
            "session_id": DEFAULT_SESSION_ID,
            "elapsed_ms": 0,
        }))),
        Err(err) => Err(err),
    }
}

async fn create_session(State(state): State<AppState>) -> Result<Json<JsonValue>, ApiError> {
    let session_id = create_session_op(&state).await?;
    Ok(Json(json!({
        "status": "success",
        "session_id": session_id,
    })))
}

async fn list_sessions(State(state): State<AppState>) -> Json<JsonValue> {
    let sessions = state.sessions.list();
    Json(json!({
        "sessions": sessions,
        "max_sessions": state.sessions.max_sessions(),
        "available_slots": state.sessions.available_slots(),
        "multi_session_enabled": state.sessions.multi_session(),
    }))
}

async fn session_detail(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let entry = state
        .sessions
        .get(&id)
        .ok_or_else(|| ApiError::SessionNotFound(id.clone()))?;
    let info = entry.engine_info();
    Ok(Json(json!({
        "session": entry.summary(),
        "engine": info,
        "worker_alive": entry.worker_alive(),
        "graphs": entry.graphs.list(),
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let destroyed = destroy_session_op(&state, id.clone()).await?;
    Ok(Json(json!({
        "status": "success",
        "session_id": id,
        "destroyed": destroyed,
    })))
}

async fn restart_session(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let session_id = restart_session_op(&state, query.session_id).await?;
    Ok(Json(json!({
        "status": "success",
        "session_id": session_id,
        "message": "Stata session restarted",
    })))
}

#[derive(Debug, Deserialize)]
struct ViewDataQuery {
    #[serde(default)]
    if_condition: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    max_rows: Option<u64>,
}

async fn view_data(
    State(state): State<AppState>,
    Query(query): Query<ViewDataQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let table = fetch_view_data(
        &state,
        query.session_id,
        query.if_condition,
        query.max_rows,
    )
    .await?;
    Ok(Json(json!({
        "status": "success",
        "columns": table.columns,
        "data": table.data,
        "dtypes": table.dtypes,
        "total_rows": table.total_rows,
        "displayed_rows": table.displayed_rows,
        "max_rows": table.max_rows,
    })))
}

#[derive(Debug, Deserialize)]
struct GraphQuery {
    #[serde(default)]
    session_id: Option<String>,
}

async fn get_graph(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Query(query): Query<GraphQuery>,
) -> Result<Response, ApiError> {
    let entry = state.sessions.peek(query.session_id.as_deref())?;
    let path = entry
        .graphs
        .lookup(&name)
        .ok_or_else(|| ApiError::GraphNotFound(name.clone()))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::GraphNotFound(name.clone()))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        bytes,
    )
        .into_response())
}

async fn health(State(state): State<AppState>) -> Json<JsonValue> {
    let (engine_available, version, edition) =
        match state.sessions.get(DEFAULT_SESSION_ID) {
            Some(entry) => {
                let info = entry.engine_info();
                (info.available, info.version, info.edition)
            }
            None => (state.config().stata_binary().is_some(), None, None),
        };
    Json(json!({
        "ok": true,
        "engine_available": engine_available,
        "version": version,
        "edition": edition,
    }))
}

async fn clear_history(State(state): State<AppState>) -> Json<JsonValue> {
    let cleared = state.run_history.swap(0, Ordering::Relaxed);
    Json(json!({
        "status": "success",
        "message": format!("Cleared {cleared} items from history"),
    }))
}

// ---------------------------------------------------------------------------
// Unified tool invocation (legacy editor surface)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ToolRequest {
    tool: String,
    #[serde(default)]
    parameters: JsonValue,
}

#[derive(Debug, Serialize)]
struct ToolResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ToolResponse {
    fn success(result: String) -> Self {
        Self {
            status: "success",
            result: Some(result),
            message: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error",
            result: None,
            message: Some(message),
        }
    }
}

fn param_str(parameters: &JsonValue, key: &str) -> Option<String> {
    parameters
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

fn param_u64(parameters: &JsonValue, key: &str) -> Option<u64> {
    parameters.get(key).and_then(JsonValue::as_u64)
}

async fn call_tool(
    State(state): State<AppState>,
    Json(request): Json<ToolRequest>,
) -> Json<ToolResponse> {
    // Editor-era tool names map onto the MCP names.
    let tool = match request.tool.as_str() {
        "run_selection" => "stata_run_selection",
        "run_file" => "stata_run_file",
        "view_data" => "stata_view_data",
        other => other,
    };
    let parameters = &request.parameters;

    let result = match tool {
        "stata_run_selection" => {
            let Some(selection) = param_str(parameters, "selection") else {
                return Json(ToolResponse::error(
                    "Missing required parameter: selection".to_string(),
                ));
            };
            execute_selection(
                &state,
                selection,
                param_str(parameters, "session_id"),
                param_str(parameters, "working_dir"),
                param_u64(parameters, "timeout"),
                parameters
                    .get("skip_filter")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false),
            )
            .await
            .map(|response| response.output)
        }
        "stata_run_file" => {
            let Some(file_path) = param_str(parameters, "file_path") else {
                return Json(ToolResponse::error(
                    "Missing required parameter: file_path".to_string(),
                ));
            };
            execute_file(
                &state,
                file_path,
                param_str(parameters, "session_id"),
                param_str(parameters, "working_dir"),
                param_u64(parameters, "timeout"),
            )
            .await
            .map(|response| response.output)
        }
        "stata_view_data" => fetch_view_data(
            &state,
            param_str(parameters, "session_id"),
            param_str(parameters, "if_condition"),
            param_u64(parameters, "max_rows"),
        )
        .await
        .and_then(|table| serde_json::to_string_pretty(&table).map_err(internal)),
        "stata_sessions_list" => {
            let listing = json!({
                "sessions": state.sessions.list(),
                "max_sessions": state.sessions.max_sessions(),
                "available_slots": state.sessions.available_slots(),
                "multi_session_enabled": state.sessions.multi_session(),
            });
            serde_json::to_string_pretty(&listing).map_err(internal)
        }
        "stata_sessions_create" => create_session_op(&state)
            .await
            .map(|id| json!({"session_id": id}).to_string()),
        "stata_sessions_destroy" => match param_str(parameters, "session_id") {
            Some(id) => destroy_session_op(&state, id.clone())
                .await
                .map(|destroyed| {
                    json!({"session_id": id, "destroyed": destroyed}).to_string()
                }),
            None => {
                return Json(ToolResponse::error(
                    "Missing required parameter: session_id".to_string(),
                ));
            }
        },
        other => {
            return Json(ToolResponse::error(format!("Unknown tool: {other}")));
        }
    };

    Json(match result {
        Ok(output) => ToolResponse::success(output),
        Err(err) => ToolResponse::error(err.to_string()),
    })
}

// ---------------------------------------------------------------------------
// Router and bootstrap
// ---------------------------------------------------------------------------

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/run_selection", post(run_selection))
        .route("/run_selection/stream", get(run_selection_stream))
        .route("/run_file", get(run_file))
        .route("/run_file/stream", get(run_file_stream))
        .route("/stop_execution", post(stop_execution))
        .route("/execution_status", get(execution_status))
        .route("/sessions/restart", post(restart_session))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(session_detail).delete(delete_session))
        .route("/view_data", get(view_data))
        .route("/graphs/{name}", get(get_graph))
        .route("/health", get(health))
        .route("/clear_history", post(clear_history))
        .route("/v1/tools", post(call_tool))
        .with_state(state)
}

async fn bind_listener(config: &ServerConfig) -> Result<TcpListener, std::io::Error> {
    let attempts = if config.force_port {
        1
    } else {
        PORT_SCAN_ATTEMPTS
    };
    let mut last_err = None;
    for offset in 0..attempts {
        let port = config.port.saturating_add(offset);
        let addr = format!("{}:{}", config.host, port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                if offset > 0 {
                    tracing::warn!(
                        requested = config.port,
                        bound = port,
                        "requested port busy; using the next free one"
                    );
                }
                return Ok(listener);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no bindable port")))
}

pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(config.data_dir())?;
    std::fs::create_dir_all(config.logs_dir())?;
    std::fs::create_dir_all(config.graphs_dir())?;

    let sessions = Arc::new(SessionManager::new(config.clone()));
    let state = AppState::new(sessions.clone());

    // Warm-start the implicit session so the first run does not pay
    // the Engine license handshake.
    let warm_sessions = sessions.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(err) = warm_sessions.ensure_default() {
            tracing::warn!(error = %err, "default session warm start failed");
        }
    });

    tokio::spawn(run_sweeper(sessions.clone()));

    let listener = bind_listener(&config).await?;
    let addr = listener.local_addr()?;

    let router = app(state.clone())
        .merge(crate::mcp::sse_router(state.clone()))
        .nest_service("/mcp-streamable", crate::mcp::streamable_service(state.clone()));

    eprintln!("stata-mcp server listening on http://{addr}");
    tracing::info!(%addr, "server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let shutdown_sessions = sessions.clone();
    let _ = tokio::task::spawn_blocking(move || shutdown_sessions.shutdown_all()).await;
    Ok(())
}
