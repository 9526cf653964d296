use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::graphs::GraphRegistry;
use crate::ipc::{ControlMessage, ServerIpcConnection};
use crate::worker_process::{WorkerError, WorkerHandle};
use crate::worker_protocol::{EngineInfo, FailureCode, WorkerReply, WorkerRequest};

pub const DEFAULT_SESSION_ID: &str = "default";

/// How often the idle sweeper wakes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How long `stop_execution` waits for the break to land before
/// answering `stop_requested` instead of `stopped`.
const STOP_CONFIRM_WAIT: Duration = Duration::from_secs(2);
const STOP_CONFIRM_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Busy,
    Terminating,
    Dead,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Terminating => "terminating",
            SessionState::Dead => "dead",
        }
    }
}

struct SessionMeta {
    state: SessionState,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    busy_since: Option<Instant>,
    active_log: PathBuf,
}

pub struct SessionEntry {
    pub id: String,
    meta: Mutex<SessionMeta>,
    worker: Mutex<WorkerHandle>,
    control: ServerIpcConnection,
    session_log: PathBuf,
    pub graphs: GraphRegistry,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: &'static str,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub engine_available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub state: &'static str,
    pub session_id: String,
    pub elapsed_ms: u64,
}

impl SessionEntry {
    fn new(id: String, worker: WorkerHandle) -> Self {
        let now = Utc::now();
        let control = worker.control();
        let session_log = worker.session_log.clone();
        Self {
            id,
            meta: Mutex::new(SessionMeta {
                state: SessionState::Ready,
                created_at: now,
                last_used_at: now,
                busy_since: None,
                active_log: session_log.clone(),
            }),
            worker: Mutex::new(worker),
            control,
            session_log,
            graphs: GraphRegistry::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.meta.lock().unwrap().state
    }

    pub fn engine_info(&self) -> EngineInfo {
        self.control.latest_engine_info().unwrap_or_default()
    }

    pub fn summary(&self) -> SessionSummary {
        let meta = self.meta.lock().unwrap();
        SessionSummary {
            session_id: self.id.clone(),
            state: meta.state.as_str(),
            created_at: meta.created_at,
            last_used_at: meta.last_used_at,
            engine_available: self.engine_info().available,
        }
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        let meta = self.meta.lock().unwrap();
        ExecutionStatus {
            state: meta.state.as_str(),
            session_id: self.id.clone(),
            elapsed_ms: meta
                .busy_since
                .map(|since| since.elapsed().as_millis() as u64)
                .unwrap_or(0),
        }
    }

    pub fn active_log_path(&self) -> PathBuf {
        self.meta.lock().unwrap().active_log.clone()
    }

    pub fn set_active_log(&self, path: PathBuf) {
        self.meta.lock().unwrap().active_log = path;
    }

    pub fn session_log_path(&self) -> PathBuf {
        self.session_log.clone()
    }

    /// Liveness probe that never blocks behind an in-flight run: if the
    /// worker mutex is held, a run is using the worker, so it is live.
    pub fn worker_alive(&self) -> bool {
        match self.worker.try_lock() {
            Ok(mut worker) => worker.is_alive(),
            Err(_) => true,
        }
    }

    fn begin_dispatch(&self) -> Result<(), ApiError> {
        let mut meta = self.meta.lock().unwrap();
        match transition_to_busy(meta.state) {
            Ok(next) => {
                meta.state = next;
                // Invariant: last_used_at advances at dispatch
                // acceptance, never on completion.
                meta.last_used_at = Utc::now();
                meta.busy_since = Some(Instant::now());
                Ok(())
            }
            Err(state) => Err(busy_error(&self.id, state)),
        }
    }

    fn finish_dispatch(&self, worker_died: bool) {
        let mut meta = self.meta.lock().unwrap();
        meta.busy_since = None;
        meta.state = match meta.state {
            // Destroy may have raced us; don't resurrect.
            SessionState::Terminating | SessionState::Dead if !worker_died => meta.state,
            _ if worker_died => SessionState::Dead,
            _ => SessionState::Ready,
        };
    }

    fn mark(&self, state: SessionState) {
        self.meta.lock().unwrap().state = state;
    }
}

/// Decide the `ready -> busy` transition; errors carry the state that
/// refused the dispatch.
fn transition_to_busy(state: SessionState) -> Result<SessionState, SessionState> {
    match state {
        SessionState::Ready => Ok(SessionState::Busy),
        other => Err(other),
    }
}

fn busy_error(session_id: &str, state: SessionState) -> ApiError {
    match state {
        SessionState::Dead => ApiError::WorkerDead(format!(
            "session {session_id} lost its worker; destroy and recreate it"
        )),
        other => ApiError::SessionBusy {
            session_id: session_id.to_string(),
            state: other.as_str(),
        },
    }
}

fn is_evictable(
    state: SessionState,
    last_used_at: DateTime<Utc>,
    now: DateTime<Utc>,
    idle_timeout: Duration,
) -> bool {
    state == SessionState::Ready
        && now.signed_duration_since(last_used_at).num_seconds() >= idle_timeout.as_secs() as i64
}

pub struct SessionManager {
    config: ServerConfig,
    table: Mutex<HashMap<String, Arc<SessionEntry>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    StopRequested,
    NoExecution,
}

impl StopOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StopOutcome::Stopped => "stopped",
            StopOutcome::StopRequested => "stop_requested",
            StopOutcome::NoExecution => "no_execution",
        }
    }
}

impl SessionManager {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn multi_session(&self) -> bool {
        self.config.multi_session
    }

    pub fn max_sessions(&self) -> usize {
        self.config.max_sessions
    }

    fn live_session_count(&self) -> usize {
        let table = self.table.lock().unwrap();
        table
            .values()
            .filter(|entry| entry.state() != SessionState::Dead)
            .count()
    }

    pub fn available_slots(&self) -> usize {
        self.config
            .max_sessions
            .saturating_sub(self.live_session_count())
    }

    /// Allocate a fresh session with its own worker. Blocking (worker
    /// spawn + engine startup); call from a blocking context.
    pub fn create_session(&self) -> Result<Arc<SessionEntry>, ApiError> {
        let id = ulid::Ulid::new().to_string().to_lowercase();
        self.create_session_with_id(&id)
    }

    fn create_session_with_id(&self, id: &str) -> Result<Arc<SessionEntry>, ApiError> {
        if self.live_session_count() >= self.config.max_sessions {
            return Err(ApiError::Capacity {
                max_sessions: self.config.max_sessions,
            });
        }
        let worker = WorkerHandle::spawn(&self.config, id)
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let entry = Arc::new(SessionEntry::new(id.to_string(), worker));
        {
            let mut table = self.table.lock().unwrap();
            if let Some(existing) = table.get(id).cloned()
                && existing.state() != SessionState::Dead
            {
                // Lost a creation race (two callers demanding the
                // default session at once); keep the incumbent.
                drop(table);
                entry.worker.lock().unwrap().shutdown();
                return Ok(existing);
            }
            table.insert(id.to_string(), entry.clone());
        }
        tracing::info!(session_id = %id, "session created");
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.table.lock().unwrap().get(id).cloned()
    }

    /// The implicit session legacy clients land on. Created on demand;
    /// a dead one is swept and replaced.
    pub fn ensure_default(&self) -> Result<Arc<SessionEntry>, ApiError> {
        if let Some(entry) = self.get(DEFAULT_SESSION_ID) {
            if entry.state() != SessionState::Dead {
                return Ok(entry);
            }
            self.destroy(DEFAULT_SESSION_ID);
        }
        self.create_session_with_id(DEFAULT_SESSION_ID)
    }

    /// Resolve an optional `session_id`. In single-session mode every
    /// id targets the implicit session.
    pub fn resolve(&self, session_id: Option<&str>) -> Result<Arc<SessionEntry>, ApiError> {
        if !self.config.multi_session {
            return self.ensure_default();
        }
        match session_id {
            None => self.ensure_default(),
            Some(id) if id.is_empty() || id == DEFAULT_SESSION_ID => self.ensure_default(),
            Some(id) => self
                .get(id)
                .ok_or_else(|| ApiError::SessionNotFound(id.to_string())),
        }
    }

    /// Look up without creating: for read-only endpoints that must 404
    /// rather than allocate.
    pub fn peek(&self, session_id: Option<&str>) -> Result<Arc<SessionEntry>, ApiError> {
        if !self.config.multi_session {
            return self
                .get(DEFAULT_SESSION_ID)
                .ok_or_else(|| ApiError::SessionNotFound(DEFAULT_SESSION_ID.to_string()));
        }
        let id = session_id.unwrap_or(DEFAULT_SESSION_ID);
        self.get(id)
            .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let entries: Vec<Arc<SessionEntry>> = {
            let table = self.table.lock().unwrap();
            table.values().cloned().collect()
        };
        let mut summaries: Vec<SessionSummary> =
            entries.iter().map(|entry| entry.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Dispatch one request on a session, upholding the one-in-flight
    /// invariant. Blocking; call from a blocking context.
    pub fn dispatch(
        &self,
        entry: &Arc<SessionEntry>,
        request: WorkerRequest,
        timeout: Duration,
    ) -> Result<WorkerReply, ApiError> {
        // Health probes answer from the worker's pushed engine report;
        // they never occupy the session.
        if matches!(request, WorkerRequest::Introspect) {
            return Ok(WorkerReply::EngineInfo(entry.engine_info()));
        }
        entry.begin_dispatch()?;

        let is_run = matches!(
            request,
            WorkerRequest::RunSelection { .. } | WorkerRequest::RunFile { .. }
        );
        let result = {
            let mut worker = entry.worker.lock().unwrap();
            if is_run {
                worker.submit_run(&request, timeout)
            } else {
                worker.submit_control(&request)
            }
        };

        match result {
            Ok(reply) => {
                entry.finish_dispatch(false);
                if let WorkerReply::RunCompleted { outcome } = &reply {
                    entry.graphs.record_run(outcome);
                }
                match reply {
                    WorkerReply::Failed { code, message } => Err(match code {
                        FailureCode::EngineUnavailable => ApiError::EngineUnavailable(message),
                        FailureCode::BadRequest => ApiError::BadRequest(message),
                        FailureCode::Internal => ApiError::Internal(message),
                    }),
                    other => Ok(other),
                }
            }
            Err(WorkerError::Timeout(limit)) => {
                entry.finish_dispatch(true);
                tracing::warn!(session_id = %entry.id, "run escalated to worker kill after timeout");
                Err(ApiError::Timeout { limit })
            }
            Err(WorkerError::Died(message)) => {
                entry.finish_dispatch(true);
                Err(ApiError::WorkerDead(message))
            }
            Err(err) => {
                entry.finish_dispatch(true);
                Err(ApiError::Internal(err.to_string()))
            }
        }
    }

    /// Cooperative break for the in-flight run. Never fatal: busy
    /// sessions get a break signal, idle ones report `no_execution`.
    /// When the Engine reaches its checkpoint inside the confirmation
    /// window the caller gets `stopped`; otherwise `stop_requested`
    /// with the break still pending.
    pub fn stop_execution(&self, session_id: Option<&str>) -> Result<StopOutcome, ApiError> {
        let entry = match self.peek(session_id) {
            Ok(entry) => entry,
            Err(ApiError::SessionNotFound(_)) if session_id.is_none() => {
                return Ok(StopOutcome::NoExecution);
            }
            Err(err) => return Err(err),
        };
        if entry.state() != SessionState::Busy {
            return Ok(StopOutcome::NoExecution);
        }
        let _ = entry.control.send(ControlMessage::Break);
        tracing::info!(session_id = %entry.id, "break requested");

        let deadline = Instant::now() + STOP_CONFIRM_WAIT;
        while Instant::now() < deadline {
            std::thread::sleep(STOP_CONFIRM_POLL);
            match entry.state() {
                SessionState::Busy => continue,
                SessionState::Ready => {
                    tracing::info!(session_id = %entry.id, "break landed");
                    return Ok(StopOutcome::Stopped);
                }
                // Terminating/dead: the run ended, but not through the
                // cooperative break.
                _ => break,
            }
        }
        Ok(StopOutcome::StopRequested)
    }

    /// Idempotent destroy: absent sessions are already destroyed.
    pub fn destroy(&self, id: &str) -> bool {
        let entry = {
            let mut table = self.table.lock().unwrap();
            table.remove(id)
        };
        let Some(entry) = entry else {
            return false;
        };
        entry.mark(SessionState::Terminating);
        // Shutdown can block behind an in-flight run; the control
        // message unblocks it, the kill finishes the job.
        let _ = entry.control.send(ControlMessage::Shutdown);
        {
            let mut worker = entry.worker.lock().unwrap();
            worker.shutdown();
        }
        entry.mark(SessionState::Dead);
        tracing::info!(session_id = %id, "session destroyed");
        true
    }

    /// Destroy sessions idle past the configured timeout. Busy sessions
    /// are never evicted; eviction is monotonic because the state flips
    /// to terminating under the meta lock before any teardown starts.
    pub fn sweep_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.session_timeout;
        let now = Utc::now();
        let candidates: Vec<Arc<SessionEntry>> = {
            let table = self.table.lock().unwrap();
            table.values().cloned().collect()
        };

        let mut evicted = Vec::new();
        for entry in candidates {
            let should_evict = {
                let mut meta = entry.meta.lock().unwrap();
                if is_evictable(meta.state, meta.last_used_at, now, idle_timeout) {
                    meta.state = SessionState::Terminating;
                    true
                } else {
                    false
                }
            };
            if should_evict {
                tracing::info!(session_id = %entry.id, "evicting idle session");
                self.destroy(&entry.id);
                evicted.push(entry.id.clone());
            }
        }
        evicted
    }

    pub fn shutdown_all(&self) {
        let ids: Vec<String> = {
            let table = self.table.lock().unwrap();
            table.keys().cloned().collect()
        };
        for id in ids {
            self.destroy(&id);
        }
    }
}

/// Background eviction loop; lives for the whole server.
pub async fn run_sweeper(manager: Arc<SessionManager>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let manager = manager.clone();
        let _ = tokio::task::spawn_blocking(move || manager.sweep_idle()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_transition_only_from_ready() {
        assert_eq!(
            transition_to_busy(SessionState::Ready),
            Ok(SessionState::Busy)
        );
        assert_eq!(
            transition_to_busy(SessionState::Busy),
            Err(SessionState::Busy)
        );
        assert_eq!(
            transition_to_busy(SessionState::Terminating),
            Err(SessionState::Terminating)
        );
        assert_eq!(
            transition_to_busy(SessionState::Dead),
            Err(SessionState::Dead)
        );
    }

    #[test]
    fn busy_error_distinguishes_dead_sessions() {
        assert_eq!(busy_error("s", SessionState::Busy).code(), "session_busy");
        assert_eq!(
            busy_error("s", SessionState::Terminating).code(),
            "session_busy"
        );
        assert_eq!(busy_error("s", SessionState::Dead).code(), "worker_dead");
    }

    #[test]
    fn eviction_requires_ready_state_and_stale_dispatch() {
        let timeout = Duration::from_secs(60);
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(120);
        let fresh = now - chrono::Duration::seconds(10);

        assert!(is_evictable(SessionState::Ready, stale, now, timeout));
        assert!(!is_evictable(SessionState::Ready, fresh, now, timeout));
        // Busy sessions are never evicted, no matter how stale the
        // dispatch timestamp is.
        assert!(!is_evictable(SessionState::Busy, stale, now, timeout));
        assert!(!is_evictable(SessionState::Terminating, stale, now, timeout));
        assert!(!is_evictable(SessionState::Dead, stale, now, timeout));
    }

    #[test]
    fn stop_outcome_strings_match_contract() {
        assert_eq!(StopOutcome::Stopped.as_str(), "stopped");
        assert_eq!(StopOutcome::StopRequested.as_str(), "stop_requested");
        assert_eq!(StopOutcome::NoExecution.as_str(), "no_execution");
    }

    #[test]
    fn session_state_strings_are_lowercase() {
        assert_eq!(SessionState::Ready.as_str(), "ready");
        assert_eq!(SessionState::Busy.as_str(), "busy");
        assert_eq!(SessionState::Terminating.as_str(), "terminating");
        assert_eq!(SessionState::Dead.as_str(), "dead");
    }
}
