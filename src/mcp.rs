use std::path::PathBuf;
use std::time::{Duration, Instant};

use axum::Router;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, ErrorData as McpError, LoggingLevel,
    LoggingMessageNotificationParam, ProgressNotificationParam, ProtocolVersion,
    ServerCapabilities, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
use rmcp::{RoleServer, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::server::timeouts::apply_tool_call_margin;
use crate::server::{
    AppState, RunResponse, create_session_op, destroy_session_op, execute_file,
    execute_selection, fetch_view_data,
};

/// Cadence of MCP log/progress notifications during long `run_file`
/// calls; they keep assistants' HTTP connections alive past their
/// default idle timeout.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// How many fresh log lines each progress message carries.
const PROGRESS_TAIL_LINES: usize = 5;

#[derive(Clone)]
pub struct StataToolServer {
    state: AppState,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RunSelectionArgs {
    /// Stata code to execute.
    selection: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    working_dir: Option<String>,
    /// Timeout in seconds (default 600).
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RunFileArgs {
    /// Path to the .do file to run.
    file_path: String,
    /// Timeout in seconds (default 600).
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
pub struct ViewDataArgs {
    /// Stata `if` expression filtering the rows, e.g. "price > 5000".
    #[serde(default)]
    if_condition: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    /// Row cap for the snapshot (default 10000).
    #[serde(default)]
    max_rows: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
pub struct SessionsListArgs {}

#[derive(Debug, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
pub struct SessionsCreateArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SessionsDestroyArgs {
    session_id: String,
}

#[tool_router]
impl StataToolServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            tool_router: Self::tool_router(),
        }
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_run_selection.md")]
    #[tool(name = "stata_run_selection")]
    async fn stata_run_selection(
        &self,
        params: Parameters<RunSelectionArgs>,
    ) -> Result<CallToolResult, McpError> {
        let RunSelectionArgs {
            selection,
            session_id,
            working_dir,
            timeout,
        } = params.0;
        let timeout = timeout.map(margin_secs);
        let result =
            execute_selection(&self.state, selection, session_id, working_dir, timeout, false)
                .await;
        Ok(run_result_to_tool_result(result))
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_run_file.md")]
    #[tool(name = "stata_run_file")]
    async fn stata_run_file(
        &self,
        params: Parameters<RunFileArgs>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let RunFileArgs {
            file_path,
            timeout,
            working_dir,
            session_id,
        } = params.0;
        let timeout_secs = timeout.map(margin_secs).unwrap_or(598);

        let log_path = self.guess_run_log_path(&file_path, session_id.as_deref());
        let run = execute_file(
            &self.state,
            file_path.clone(),
            session_id,
            working_dir,
            Some(timeout_secs),
        );
        tokio::pin!(run);

        let mut reporter = ProgressReporter::new(context, file_path, log_path, timeout_secs);
        let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
        interval.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = interval.tick() => reporter.report().await,
            }
        };
        Ok(run_result_to_tool_result(result))
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_view_data.md")]
    #[tool(name = "stata_view_data")]
    async fn stata_view_data(
        &self,
        params: Parameters<ViewDataArgs>,
    ) -> Result<CallToolResult, McpError> {
        let ViewDataArgs {
            if_condition,
            session_id,
            max_rows,
        } = params.0;
        match fetch_view_data(&self.state, session_id, if_condition, max_rows).await {
            Ok(table) => {
                let payload = serde_json::to_string_pretty(&table)
                    .map_err(|err| McpError::internal_error(err.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(payload)]))
            }
            Err(err) => Ok(api_error_to_tool_result(err)),
        }
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_sessions_list.md")]
    #[tool(name = "stata_sessions_list")]
    async fn stata_sessions_list(
        &self,
        _params: Parameters<SessionsListArgs>,
    ) -> Result<CallToolResult, McpError> {
        let listing = json!({
            "sessions": self.state.sessions.list(),
            "max_sessions": self.state.sessions.max_sessions(),
            "available_slots": self.state.sessions.available_slots(),
            "multi_session_enabled": self.state.sessions.multi_session(),
        });
        let payload = serde_json::to_string_pretty(&listing)
            .map_err(|err| McpError::internal_error(err.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(payload)]))
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_sessions_create.md")]
    #[tool(name = "stata_sessions_create")]
    async fn stata_sessions_create(
        &self,
        _params: Parameters<SessionsCreateArgs>,
    ) -> Result<CallToolResult, McpError> {
        match create_session_op(&self.state).await {
            Ok(session_id) => Ok(CallToolResult::success(vec![Content::text(
                json!({"session_id": session_id}).to_string(),
            )])),
            Err(err) => Ok(api_error_to_tool_result(err)),
        }
    }

    #[doc = include_str!("../docs/tool-descriptions/stata_sessions_destroy.md")]
    #[tool(name = "stata_sessions_destroy")]
    async fn stata_sessions_destroy(
        &self,
        params: Parameters<SessionsDestroyArgs>,
    ) -> Result<CallToolResult, McpError> {
        let SessionsDestroyArgs { session_id } = params.0;
        match destroy_session_op(&self.state, session_id.clone()).await {
            Ok(destroyed) => Ok(CallToolResult::success(vec![Content::text(
                json!({"session_id": session_id, "destroyed": destroyed}).to_string(),
            )])),
            Err(err) => Ok(api_error_to_tool_result(err)),
        }
    }

    fn guess_run_log_path(&self, file_path: &str, session_id: Option<&str>) -> PathBuf {
        let session = session_id.unwrap_or(crate::session::DEFAULT_SESSION_ID);
        self.state
            .sessions
            .config()
            .run_log_path(std::path::Path::new(file_path), session)
    }
}

#[tool_handler]
impl ServerHandler for StataToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_logging()
                .build(),
            instructions: Some(
                "Tools for driving Stata: run code selections and .do files, inspect the \
                 in-memory dataset, and manage parallel sessions."
                    .to_string(),
            ),
            ..ServerInfo::default()
        }
    }
}

fn margin_secs(timeout_secs: u64) -> u64 {
    apply_tool_call_margin(Duration::from_secs(timeout_secs))
        .as_secs()
        .max(1)
}

/// Engine-level failures ride inside the tool result rather than as
/// MCP protocol errors; assistants read them like any other output.
fn run_result_to_tool_result(result: Result<RunResponse, ApiError>) -> CallToolResult {
    match result {
        Ok(response) => {
            let mut text = response.output;
            if let Some(spill) = &response.truncated_to_file {
                text.push_str(&format!("\n[full output: {spill}]"));
            }
            if response.status == "success" {
                CallToolResult::success(vec![Content::text(text)])
            } else {
                let framed = format!("[status: {}]\n{text}", response.status);
                CallToolResult::error(vec![Content::text(framed)])
            }
        }
        Err(err) => api_error_to_tool_result(err),
    }
}

fn api_error_to_tool_result(err: ApiError) -> CallToolResult {
    CallToolResult::error(vec![Content::text(format!("[{}] {err}", err.code()))])
}

/// Periodic MCP log + progress notifications during a long run. Tails
/// the run log so the client sees fresh Engine output, not just a
/// counter.
struct ProgressReporter {
    context: RequestContext<RoleServer>,
    file_path: String,
    log_path: PathBuf,
    log_offset: u64,
    started: Instant,
    total_secs: u64,
}

impl ProgressReporter {
    fn new(
        context: RequestContext<RoleServer>,
        file_path: String,
        log_path: PathBuf,
        total_secs: u64,
    ) -> Self {
        Self {
            context,
            file_path,
            log_path,
            log_offset: 0,
            started: Instant::now(),
            total_secs,
        }
    }

    async fn report(&mut self) {
        let elapsed = self.started.elapsed().as_secs();
        let mut message = format!(
            "{}: {elapsed}s elapsed / {}s timeout",
            self.file_path, self.total_secs
        );
        if let Some(tail) = self.read_new_tail().await {
            message.push('\n');
            message.push_str(&tail);
        }

        let _ = self
            .context
            .peer
            .notify_logging_message(LoggingMessageNotificationParam {
                level: LoggingLevel::Info,
                logger: Some("stata-mcp".to_string()),
                data: serde_json::Value::String(message.clone()),
            })
            .await;

        if let Some(progress_token) = self.context.meta.get_progress_token() {
            let _ = self
                .context
                .peer
                .notify_progress(ProgressNotificationParam {
                    progress_token,
                    progress: elapsed as f64,
                    total: Some(self.total_secs as f64),
                    message: Some(message),
                })
                .await;
        }
    }

    async fn read_new_tail(&mut self) -> Option<String> {
        let data = tokio::fs::read(&self.log_path).await.ok()?;
        if data.len() as u64 <= self.log_offset {
            return None;
        }
        let fresh = &data[self.log_offset as usize..];
        self.log_offset = data.len() as u64;
        let text = String::from_utf8_lossy(fresh);
        let lines: Vec<&str> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter(|line| !crate::engine::is_internal_log_line(line))
            .collect();
        if lines.is_empty() {
            return None;
        }
        let tail_start = lines.len().saturating_sub(PROGRESS_TAIL_LINES);
        Some(lines[tail_start..].join("\n"))
    }
}

/// Legacy SSE transport: `GET /mcp` opens the event stream, clients
/// post JSON-RPC messages to `/mcp/message`.
pub fn sse_router(state: AppState) -> Router {
    let config = SseServerConfig {
        bind: "127.0.0.1:0".parse().expect("loopback addr"),
        sse_path: "/mcp".to_string(),
        post_path: "/mcp/message".to_string(),
        ct: CancellationToken::new(),
        sse_keep_alive: Some(Duration::from_secs(15)),
    };
    let (sse_server, router) = SseServer::new(config);
    let _ct = sse_server.with_service(move || StataToolServer::new(state.clone()));
    router
}

/// Streamable HTTP transport: JSON-RPC 2.0 over a single endpoint.
pub fn streamable_service(
    state: AppState,
) -> StreamableHttpService<StataToolServer, LocalSessionManager> {
    StreamableHttpService::new(
        move || Ok(StataToolServer::new(state.clone())),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig {
            sse_keep_alive: Some(Duration::from_secs(15)),
            stateful_mode: true,
        },
    )
}
