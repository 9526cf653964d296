use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const WORKER_MODE_ARG: &str = "worker";

pub(crate) const INPUT_FRAME_PREFIX: &str = "STATA_MCP_REQUEST ";

pub(crate) fn format_input_frame_header(len: usize) -> String {
    format!("{INPUT_FRAME_PREFIX}{len}\n")
}

pub(crate) fn parse_input_frame_header(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    let rest = trimmed.strip_prefix(INPUT_FRAME_PREFIX)?;
    rest.trim().parse().ok()
}

/// Requests framed onto the worker's stdin. `Break` is not here: it
/// travels on the IPC side-band so it can overtake a queued request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    RunSelection {
        code: String,
        working_dir: Option<String>,
        timeout_secs: u64,
    },
    RunFile {
        path: String,
        working_dir: Option<String>,
        timeout_secs: u64,
        log_path: String,
    },
    ViewData {
        if_condition: Option<String>,
        max_rows: u64,
    },
    Restart,
    Introspect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
    Cancelled,
    Timeout,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRef {
    pub name: String,
    pub absolute_path: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output: String,
    pub log_path: String,
    pub graphs: Vec<GraphRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineInfo {
    pub available: bool,
    pub version: Option<String>,
    pub edition: Option<String>,
}

/// Column-major snapshot of the in-memory dataset: `data[i]` holds the
/// values of `columns[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub data: Vec<Vec<JsonValue>>,
    pub dtypes: BTreeMap<String, String>,
    pub total_rows: u64,
    pub displayed_rows: u64,
    pub max_rows: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    EngineUnavailable,
    BadRequest,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    EngineInfo(EngineInfo),
    RunCompleted {
        outcome: RunOutcome,
    },
    Data {
        table: DataTable,
    },
    Failed {
        code: FailureCode,
        message: String,
    },
    SessionEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trips() {
        let header = format_input_frame_header(421);
        assert_eq!(parse_input_frame_header(&header), Some(421));
    }

    #[test]
    fn frame_header_rejects_foreign_lines() {
        assert_eq!(parse_input_frame_header("display 42\n"), None);
        assert_eq!(parse_input_frame_header("STATA_MCP_REQUEST x\n"), None);
    }

    #[test]
    fn requests_round_trip_as_json() {
        let request = WorkerRequest::RunSelection {
            code: "display 42".to_string(),
            working_dir: Some("/tmp/project".to_string()),
            timeout_secs: 600,
        };
        let payload = serde_json::to_string(&request).expect("serialize");
        assert!(payload.contains("\"type\":\"run_selection\""));
        let parsed: WorkerRequest = serde_json::from_str(&payload).expect("parse");
        match parsed {
            WorkerRequest::RunSelection { code, timeout_secs, .. } => {
                assert_eq!(code, "display 42");
                assert_eq!(timeout_secs, 600);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn run_status_serializes_snake_case() {
        let outcome = RunOutcome {
            status: RunStatus::Cancelled,
            output: String::new(),
            log_path: String::new(),
            graphs: Vec::new(),
        };
        let payload = serde_json::to_string(&outcome).expect("serialize");
        assert!(payload.contains("\"status\":\"cancelled\""));
    }
}
