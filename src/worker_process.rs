use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::config::ServerConfig;
use crate::engine::{ENGINE_BINARY_ENV, GRAPHS_DIR_ENV, SESSION_ID_ENV, SESSION_LOG_ENV};
use crate::ipc::{
    ControlMessage, IPC_READ_FD_ENV, IPC_WRITE_FD_ENV, IpcServer, IpcWaitError,
    ServerIpcConnection,
};
use crate::worker_protocol::{
    EngineInfo, RunStatus, WORKER_MODE_ARG, WorkerReply, WorkerRequest,
    format_input_frame_header,
};

/// How long the worker gets to come up and report whether the Engine
/// initialized. Engine startup includes license checks and can be slow.
const WORKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// After a break is signalled on timeout, how long the Engine gets to
/// reach its next checkpoint before the worker process is killed.
pub const BREAK_GRACE: Duration = Duration::from_secs(5);

/// Housekeeping requests (introspect, view_data, restart) are bounded
/// separately from user runs.
const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const SHUTDOWN_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum WorkerError {
    Io(std::io::Error),
    Spawn(String),
    Protocol(String),
    Timeout(Duration),
    Died(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Io(err) => write!(f, "worker io error: {err}"),
            WorkerError::Spawn(message) => write!(f, "worker spawn error: {message}"),
            WorkerError::Protocol(message) => write!(f, "worker protocol error: {message}"),
            WorkerError::Timeout(duration) => write!(
                f,
                "worker response timed out after {} ms",
                duration.as_millis()
            ),
            WorkerError::Died(message) => write!(f, "worker died: {message}"),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        WorkerError::Io(err)
    }
}

/// Server-side handle to one worker subprocess (and therefore one
/// Engine). Requests are framed onto the worker's stdin; replies and
/// control messages use the IPC side-band.
pub struct WorkerHandle {
    child: Child,
    stdin: std::process::ChildStdin,
    ipc: ServerIpcConnection,
    session_id: String,
    pub session_log: PathBuf,
    pub graphs_dir: PathBuf,
    alive: bool,
}

impl WorkerHandle {
    pub fn spawn(config: &ServerConfig, session_id: &str) -> Result<Self, WorkerError> {
        let exe_path = std::env::current_exe()?;
        let session_log = config.session_log_path(session_id);
        let graphs_dir = config.session_graphs_dir(session_id);
        std::fs::create_dir_all(config.logs_dir())?;
        std::fs::create_dir_all(&graphs_dir)?;

        let mut ipc_server = IpcServer::bind()?;

        let mut command = Command::new(&exe_path);
        command
            .arg(WORKER_MODE_ARG)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .env(SESSION_ID_ENV, session_id)
            .env(SESSION_LOG_ENV, &session_log)
            .env(GRAPHS_DIR_ENV, &graphs_dir);
        if let Some(binary) = config.stata_binary() {
            command.env(ENGINE_BINARY_ENV, binary);
        } else {
            command.env_remove(ENGINE_BINARY_ENV);
        }

        #[cfg(target_family = "unix")]
        {
            let Some(fds) = ipc_server.take_child_fds() else {
                return Err(WorkerError::Spawn("ipc child fds missing".to_string()));
            };
            command
                .env(IPC_READ_FD_ENV, fds.read_fd.to_string())
                .env(IPC_WRITE_FD_ENV, fds.write_fd.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|err| WorkerError::Spawn(format!("failed to spawn worker: {err}")))?;

        // The child inherited its pipe ends; close ours so EOF is
        // observable in both directions.
        #[cfg(target_family = "unix")]
        close_inherited_fds(&command);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("worker stdin unavailable".to_string()))?;

        let ipc = ipc_server.connect()?;
        match ipc.wait_for_engine_info(WORKER_STARTUP_TIMEOUT) {
            Ok(_) => {}
            Err(IpcWaitError::Timeout) => {
                kill_process_tree(child.id());
                let _ = child.kill();
                let _ = child.wait();
                return Err(WorkerError::Spawn(
                    "worker did not report engine status in time".to_string(),
                ));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WorkerError::Spawn(format!(
                    "worker exited during startup: {err:?}"
                )));
            }
        }

        Ok(Self {
            child,
            stdin,
            ipc,
            session_id: session_id.to_string(),
            session_log,
            graphs_dir,
            alive: true,
        })
    }

    /// Cloneable control channel; `stop_execution` uses this to break a
    /// run without waiting on the worker mutex the run itself holds.
    pub fn control(&self) -> ServerIpcConnection {
        self.ipc.clone()
    }

    pub fn engine_info(&self) -> EngineInfo {
        self.ipc.latest_engine_info().unwrap_or_default()
    }

    pub fn is_alive(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => {
                self.alive = false;
                false
            }
            Ok(None) => !self.ipc.session_ended(),
            Err(_) => false,
        }
    }

    fn write_frame(&mut self, request: &WorkerRequest) -> Result<(), WorkerError> {
        let payload = serde_json::to_string(request)
            .map_err(|err| WorkerError::Protocol(format!("request serialize failed: {err}")))?;
        let header = format_input_frame_header(payload.len());
        self.stdin.write_all(header.as_bytes())?;
        self.stdin.write_all(payload.as_bytes())?;
        self.stdin.flush()?;
        Ok(())
    }

    /// Submit a user run and enforce its wall-clock timeout. The timer
    /// runs here, independent of the worker's responsiveness:
    /// stage 1 signals a break, stage 2 waits out the grace period,
    /// stage 3 kills the worker process tree. After stage 3 the caller
    /// must consider this handle dead.
    pub fn submit_run(
        &mut self,
        request: &WorkerRequest,
        timeout: Duration,
    ) -> Result<WorkerReply, WorkerError> {
        self.ipc.clear_stale_replies();
        self.write_frame(request)?;
        match self.ipc.wait_for_reply(timeout) {
            Ok(reply) => Ok(reply),
            Err(IpcWaitError::Timeout) => {
                let _ = self.ipc.send(ControlMessage::Break);
                match self.ipc.wait_for_reply(BREAK_GRACE) {
                    Ok(WorkerReply::RunCompleted { mut outcome }) => {
                        // The break landed; the run is over, but the
                        // caller asked for a deadline, so report it as
                        // a timeout rather than a cancellation.
                        outcome.status = RunStatus::Timeout;
                        outcome.output.push_str(&format!(
                            "\n*** TIMEOUT: execution exceeded {} seconds ***\n",
                            timeout.as_secs()
                        ));
                        Ok(WorkerReply::RunCompleted { outcome })
                    }
                    Ok(other) => Ok(other),
                    Err(_) => {
                        self.kill();
                        Err(WorkerError::Timeout(timeout))
                    }
                }
            }
            Err(IpcWaitError::SessionEnd) => {
                self.kill();
                Err(WorkerError::Died("worker session ended mid-run".to_string()))
            }
            Err(IpcWaitError::Disconnected) => {
                self.kill();
                Err(WorkerError::Died("worker ipc disconnected".to_string()))
            }
        }
    }

    /// Housekeeping requests get a fixed bound and no break escalation.
    pub fn submit_control(&mut self, request: &WorkerRequest) -> Result<WorkerReply, WorkerError> {
        self.ipc.clear_stale_replies();
        self.write_frame(request)?;
        match self.ipc.wait_for_reply(CONTROL_REQUEST_TIMEOUT) {
            Ok(reply) => Ok(reply),
            Err(IpcWaitError::Timeout) => Err(WorkerError::Timeout(CONTROL_REQUEST_TIMEOUT)),
            Err(err) => {
                self.kill();
                Err(WorkerError::Died(format!("worker unavailable: {err:?}")))
            }
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.ipc.send(ControlMessage::Shutdown);
        std::thread::sleep(SHUTDOWN_WAIT);
        self.kill();
    }

    pub fn kill(&mut self) {
        if self.alive {
            tracing::debug!(session_id = %self.session_id, "killing worker process tree");
        }
        kill_process_tree(self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.alive = false;
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(target_family = "unix")]
fn close_inherited_fds(command: &Command) {
    // The fds were handed to the child via env; close the server's
    // copies of the child ends so pipe EOFs propagate.
    for key in [IPC_READ_FD_ENV, IPC_WRITE_FD_ENV] {
        let value = command
            .get_envs()
            .find(|(k, _)| k.to_str() == Some(key))
            .and_then(|(_, v)| v)
            .and_then(|v| v.to_str())
            .and_then(|raw| raw.parse::<i32>().ok());
        if let Some(fd) = value {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Kill a worker and everything under it. The Engine runs in its own
/// process group, so a group signal alone cannot reach it; walk the
/// process table instead, the worker itself last.
pub fn kill_process_tree(root_pid: u32) {
    #[cfg(target_family = "unix")]
    {
        use sysinfo::{ProcessesToUpdate, System};

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut descendants: Vec<u32> = Vec::new();
        let mut frontier = vec![root_pid];
        while let Some(parent) = frontier.pop() {
            for (pid, process) in system.processes() {
                if process
                    .parent()
                    .is_some_and(|p| p.as_u32() == parent)
                {
                    let child_pid = pid.as_u32();
                    if !descendants.contains(&child_pid) {
                        descendants.push(child_pid);
                        frontier.push(child_pid);
                    }
                }
            }
        }

        for pid in descendants {
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
                // Engine children lead their own groups; sweep those too.
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        unsafe {
            libc::kill(root_pid as i32, libc::SIGKILL);
        }
    }
    #[cfg(not(target_family = "unix"))]
    {
        let _ = root_pid;
    }
}
