use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::AppState;
use super::timeouts::parse_run_timeout;
use crate::engine::{EXECUTION_ENDED_MARKER, EXECUTION_STARTED_MARKER, is_internal_log_line};
use crate::error::ApiError;
use crate::session::SessionEntry;
use crate::worker_protocol::{WorkerReply, WorkerRequest};

/// Log tail poll cadence. Short enough to feel live, long enough that a
/// busy Engine is not contending with us on the log file.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(150);

const FRAME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum StreamFrame {
    Status(String),
    Stdout(String),
    Error {
        code: &'static str,
        message: String,
    },
    Done {
        status: &'static str,
        log_path: String,
        graphs: Vec<String>,
    },
}

impl StreamFrame {
    fn into_event(self) -> Event {
        match self {
            StreamFrame::Status(text) | StreamFrame::Stdout(text) => Event::default().data(text),
            StreamFrame::Error { code, message } => Event::default().data(
                json!({"kind": "error", "code": code, "message": message}).to_string(),
            ),
            StreamFrame::Done {
                status,
                log_path,
                graphs,
            } => Event::default().data(
                json!({
                    "kind": "done",
                    "status": status,
                    "log_path": log_path,
                    "graphs": graphs,
                })
                .to_string(),
            ),
        }
    }
}

pub async fn selection_stream(
    state: AppState,
    selection: String,
    session_id: Option<String>,
    working_dir: Option<String>,
    timeout_secs: Option<u64>,
) -> Response {
    if selection.trim().is_empty() {
        return ApiError::BadRequest("selection must not be empty".to_string()).into_response();
    }
    let timeout = match parse_run_timeout(timeout_secs) {
        Ok(timeout) => timeout,
        Err(err) => return err.into_response(),
    };

    let entry = match resolve_blocking(&state, session_id).await {
        Ok(entry) => entry,
        Err(err) => return err.into_response(),
    };
    let log_path = entry.session_log_path();
    entry.set_active_log(log_path.clone());

    let request = WorkerRequest::RunSelection {
        code: selection,
        working_dir,
        timeout_secs: timeout.as_secs(),
    };
    start_stream(state, entry, request, timeout, log_path)
}

pub async fn file_stream(
    state: AppState,
    file_path: String,
    session_id: Option<String>,
    working_dir: Option<String>,
    timeout_secs: Option<u64>,
) -> Response {
    if file_path.trim().is_empty() {
        return ApiError::BadRequest("file_path must not be empty".to_string()).into_response();
    }
    let timeout = match parse_run_timeout(timeout_secs) {
        Ok(timeout) => timeout,
        Err(err) => return err.into_response(),
    };

    let entry = match resolve_blocking(&state, session_id).await {
        Ok(entry) => entry,
        Err(err) => return err.into_response(),
    };
    let log_path = state
        .sessions
        .config()
        .run_log_path(Path::new(&file_path), &entry.id);
    entry.set_active_log(log_path.clone());

    let request = WorkerRequest::RunFile {
        path: file_path,
        working_dir,
        timeout_secs: timeout.as_secs(),
        log_path: log_path.display().to_string(),
    };
    start_stream(state, entry, request, timeout, log_path)
}

async fn resolve_blocking(
    state: &AppState,
    session_id: Option<String>,
) -> Result<Arc<SessionEntry>, ApiError> {
    let sessions = state.sessions.clone();
    tokio::task::spawn_blocking(move || sessions.resolve(session_id.as_deref()))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
}

/// Open the SSE response, then start the run. Frames flow through a
/// bounded channel; back-pressure is the client's TCP buffer.
fn start_stream(
    state: AppState,
    entry: Arc<SessionEntry>,
    request: WorkerRequest,
    timeout: Duration,
    log_path: PathBuf,
) -> Response {
    let (tx, rx) = mpsc::channel::<StreamFrame>(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(drive_run(state, entry, request, timeout, log_path, tx));

    let stream =
        ReceiverStream::new(rx).map(|frame| Ok::<Event, Infallible>(frame.into_event()));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn drive_run(
    state: AppState,
    entry: Arc<SessionEntry>,
    request: WorkerRequest,
    timeout: Duration,
    log_path: PathBuf,
    tx: mpsc::Sender<StreamFrame>,
) {
    let start_offset = tokio::fs::metadata(&log_path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0);

    if tx
        .send(StreamFrame::Status("Starting execution".to_string()))
        .await
        .is_err()
    {
        return;
    }

    let sessions = state.sessions.clone();
    let dispatch_entry = entry.clone();
    let mut dispatch = tokio::task::spawn_blocking(move || {
        sessions.dispatch(&dispatch_entry, request, timeout)
    });

    let mut tailer = LogTailer::new(log_path, start_offset);
    let mut interval = tokio::time::interval(TAIL_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            result = &mut dispatch => break result,
            _ = interval.tick() => {
                for frame in tailer.poll().await {
                    if tx.send(frame).await.is_err() {
                        // Client disconnected. Stop tailing; the run
                        // continues on the worker unless the client
                        // also POSTs /stop_execution.
                        return;
                    }
                }
            }
        }
    };

    for frame in tailer.poll().await {
        if tx.send(frame).await.is_err() {
            return;
        }
    }

    let final_frame = match result {
        Ok(Ok(WorkerReply::RunCompleted { outcome })) => StreamFrame::Done {
            status: outcome.status.as_str(),
            log_path: outcome.log_path,
            graphs: outcome.graphs.into_iter().map(|graph| graph.name).collect(),
        },
        Ok(Ok(other)) => StreamFrame::Error {
            code: "internal",
            message: format!("unexpected worker reply: {other:?}"),
        },
        Ok(Err(err)) => StreamFrame::Error {
            code: err.code(),
            message: err.to_string(),
        },
        Err(err) => StreamFrame::Error {
            code: "internal",
            message: err.to_string(),
        },
    };
    let _ = tx.send(final_frame).await;
}

/// Incremental tail over the session's log file. Only whole lines are
/// emitted; a partial trailing line waits for its newline. CRLF is
/// normalized to LF. Nothing is buffered beyond the current read.
struct LogTailer {
    path: PathBuf,
    offset: u64,
    pending: String,
}

impl LogTailer {
    fn new(path: PathBuf, offset: u64) -> Self {
        Self {
            path,
            offset,
            pending: String::new(),
        }
    }

    async fn poll(&mut self) -> Vec<StreamFrame> {
        let Ok(mut file) = tokio::fs::File::open(&self.path).await else {
            return Vec::new();
        };
        let Ok(meta) = file.metadata().await else {
            return Vec::new();
        };
        if meta.len() < self.offset {
            // Log replaced underneath us (fresh run in replace mode);
            // start over from the top.
            self.offset = 0;
            self.pending.clear();
        }
        if meta.len() == self.offset {
            return Vec::new();
        }
        if file
            .seek(std::io::SeekFrom::Start(self.offset))
            .await
            .is_err()
        {
            return Vec::new();
        }
        let mut buffer = Vec::new();
        let Ok(read) = file.read_to_end(&mut buffer).await else {
            return Vec::new();
        };
        self.offset += read as u64;
        self.pending.push_str(&String::from_utf8_lossy(&buffer));

        let mut frames = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let raw: String = self.pending.drain(..=newline).collect();
            let line = raw.trim_end_matches(['\n', '\r']);
            if let Some(frame) = classify_line(line) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn classify_line(line: &str) -> Option<StreamFrame> {
    if line.trim().is_empty() {
        return None;
    }
    let is_echo = line.trim_start().starts_with('.');
    if !is_echo && line.contains(EXECUTION_STARTED_MARKER) {
        return Some(StreamFrame::Status("Starting execution".to_string()));
    }
    if !is_echo && line.contains(EXECUTION_ENDED_MARKER) {
        return Some(StreamFrame::Status(EXECUTION_ENDED_MARKER.to_string()));
    }
    if is_internal_log_line(line) {
        return None;
    }
    Some(StreamFrame::Stdout(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_skips_internal_and_blank_lines() {
        assert!(classify_line("").is_none());
        assert!(classify_line("   ").is_none());
        assert!(classify_line("<<stata-mcp:done:1:0>>").is_none());
        assert!(classify_line(". display \"<<stata-mcp:count:`r(N)'>>\"").is_none());
    }

    #[test]
    fn classify_maps_boundary_markers_to_status_frames() {
        match classify_line("*** Execution started: 1 Aug 2026") {
            Some(StreamFrame::Status(text)) => assert_eq!(text, "Starting execution"),
            other => panic!("unexpected frame: {other:?}"),
        }
        match classify_line("*** Execution ended") {
            Some(StreamFrame::Status(text)) => assert_eq!(text, EXECUTION_ENDED_MARKER),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn classify_passes_ordinary_output_through() {
        match classify_line("price = 4099") {
            Some(StreamFrame::Stdout(text)) => assert_eq!(text, "price = 4099"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tailer_emits_only_complete_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("run.log");
        tokio::fs::write(&log, "first line\npartial").await.expect("write");

        let mut tailer = LogTailer::new(log.clone(), 0);
        let frames = tailer.poll().await;
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            StreamFrame::Stdout(text) => assert_eq!(text, "first line"),
            other => panic!("unexpected frame: {other:?}"),
        }

        tokio::fs::write(&log, "first line\npartial done\r\nsecond\n")
            .await
            .expect("write");
        let frames = tailer.poll().await;
        let texts: Vec<String> = frames
            .into_iter()
            .map(|frame| match frame {
                StreamFrame::Stdout(text) => text,
                other => panic!("unexpected frame: {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["partial done", "second"]);
    }

    #[tokio::test]
    async fn tailer_starts_from_the_given_offset() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("run.log");
        let prelude = "stale output\n";
        tokio::fs::write(&log, format!("{prelude}fresh output\n"))
            .await
            .expect("write");

        let mut tailer = LogTailer::new(log, prelude.len() as u64);
        let frames = tailer.poll().await;
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            StreamFrame::Stdout(text) => assert_eq!(text, "fresh output"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
