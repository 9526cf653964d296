use std::time::Duration;

/// Server-level failures surfaced to HTTP and MCP callers. Engine-level
/// failures are not errors: they travel inside a `RunOutcome` with a
/// non-success status.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    SessionNotFound(String),
    GraphNotFound(String),
    SessionBusy {
        session_id: String,
        state: &'static str,
    },
    Capacity {
        max_sessions: usize,
    },
    EngineUnavailable(String),
    Timeout {
        limit: Duration,
    },
    WorkerDead(String),
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::GraphNotFound(_) => "not_found",
            ApiError::SessionBusy { .. } => "session_busy",
            ApiError::Capacity { .. } => "capacity",
            ApiError::EngineUnavailable(_) => "engine_unavailable",
            ApiError::Timeout { .. } => "timeout",
            ApiError::WorkerDead(_) => "worker_dead",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(message) => write!(f, "{message}"),
            ApiError::SessionNotFound(id) => write!(f, "session not found: {id}"),
            ApiError::GraphNotFound(name) => write!(f, "graph not found: {name}"),
            ApiError::SessionBusy { session_id, state } => {
                write!(f, "session {session_id} is {state}; one request at a time")
            }
            ApiError::Capacity { max_sessions } => {
                write!(f, "session limit reached ({max_sessions}); destroy one first")
            }
            ApiError::EngineUnavailable(message) => write!(f, "engine unavailable: {message}"),
            ApiError::Timeout { limit } => {
                write!(f, "execution exceeded the {} s timeout", limit.as_secs())
            }
            ApiError::WorkerDead(message) => write!(f, "worker died: {message}"),
            ApiError::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_error_taxonomy() {
        assert_eq!(ApiError::BadRequest(String::new()).code(), "bad_request");
        assert_eq!(
            ApiError::SessionNotFound("x".into()).code(),
            "session_not_found"
        );
        assert_eq!(
            ApiError::SessionBusy {
                session_id: "x".into(),
                state: "busy",
            }
            .code(),
            "session_busy"
        );
        assert_eq!(ApiError::Capacity { max_sessions: 1 }.code(), "capacity");
        assert_eq!(
            ApiError::Timeout {
                limit: Duration::from_secs(2),
            }
            .code(),
            "timeout"
        );
        assert_eq!(ApiError::WorkerDead("gone".into()).code(), "worker_dead");
    }

    #[test]
    fn busy_message_names_session_state() {
        let err = ApiError::SessionBusy {
            session_id: "abc".into(),
            state: "terminating",
        };
        assert!(err.to_string().contains("terminating"));
    }
}
