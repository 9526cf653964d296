use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;

use crate::filter::{auto_name_graph_commands, join_line_continuations, sanitize_submission};
use crate::graphs::render_graphs_block;
use crate::worker_protocol::{DataTable, EngineInfo, GraphRef, RunOutcome, RunStatus};

pub const ENGINE_BINARY_ENV: &str = "STATA_MCP_ENGINE_BINARY";
pub const SESSION_ID_ENV: &str = "STATA_MCP_SESSION_ID";
pub const SESSION_LOG_ENV: &str = "STATA_MCP_SESSION_LOG";
pub const GRAPHS_DIR_ENV: &str = "STATA_MCP_GRAPHS_DIR";

/// Internal console markers. Every line carrying this prefix (or the
/// echo of the command that printed it) is stripped from user-visible
/// output and from streamed log tails.
pub const MARKER_PREFIX: &str = "<<stata-mcp:";

pub const EXECUTION_STARTED_MARKER: &str = "*** Execution started";
pub const EXECUTION_ENDED_MARKER: &str = "*** Execution ended";

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(30);
const GRAPH_EXPORT_WIDTH: u32 = 800;
const GRAPH_EXPORT_HEIGHT: u32 = 600;

#[derive(Debug)]
pub enum EngineError {
    Io(std::io::Error),
    Unavailable(String),
    Protocol(String),
    Exited(String),
    Timeout(Duration),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Io(err) => write!(f, "engine io error: {err}"),
            EngineError::Unavailable(message) => write!(f, "engine unavailable: {message}"),
            EngineError::Protocol(message) => write!(f, "engine protocol error: {message}"),
            EngineError::Exited(message) => write!(f, "engine exited: {message}"),
            EngineError::Timeout(duration) => {
                write!(f, "engine did not answer within {} ms", duration.as_millis())
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err)
    }
}

/// Everything the worker process needs to host one Engine, resolved
/// from the environment the server set up before spawning us.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub session_id: String,
    pub binary: Option<PathBuf>,
    pub session_log: PathBuf,
    pub graphs_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl WorkerContext {
    pub fn from_env() -> Self {
        let session_id =
            std::env::var(SESSION_ID_ENV).unwrap_or_else(|_| "default".to_string());
        let binary = std::env::var(ENGINE_BINARY_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let session_log = std::env::var(SESSION_LOG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::temp_dir().join(format!("stata-mcp-session-{session_id}.log"))
            });
        let graphs_dir = std::env::var(GRAPHS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("stata-mcp-graphs"));
        let scratch_dir =
            std::env::temp_dir().join(format!("stata-mcp-worker-{}", std::process::id()));
        Self {
            session_id,
            binary,
            session_log,
            graphs_dir,
            scratch_dir,
        }
    }
}

/// Shared handle that lets the IPC thread interrupt the Engine while
/// the execution thread is blocked waiting on it.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    pid: Arc<AtomicU32>,
    break_seen: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.break_seen.store(true, Ordering::SeqCst);
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        #[cfg(target_family = "unix")]
        unsafe {
            // Break is cooperative: SIGINT reaches the Engine's break
            // hook, which stops at the next checkpoint.
            libc::kill(-(pid as i32), libc::SIGINT);
        }
    }

    fn take_break_seen(&self) -> bool {
        self.break_seen.swap(false, Ordering::SeqCst)
    }

    fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }
}

struct BatchResult {
    rc: i64,
    console: String,
}

pub struct RunRequest {
    pub code: String,
    pub working_dir: Option<String>,
    pub timeout: Duration,
    pub log_path: PathBuf,
}

pub struct EngineSession {
    ctx: WorkerContext,
    child: Child,
    stdin: ChildStdin,
    stdout_rx: mpsc::Receiver<String>,
    interrupt: InterruptHandle,
    info: EngineInfo,
    seq: u64,
}

impl EngineSession {
    pub fn start(ctx: WorkerContext, interrupt: InterruptHandle) -> Result<Self, EngineError> {
        let Some(binary) = ctx.binary.clone() else {
            return Err(EngineError::Unavailable(
                "no Stata installation found; set --stata-path".to_string(),
            ));
        };
        if !binary.is_file() {
            return Err(EngineError::Unavailable(format!(
                "stata binary not found at {}",
                binary.display()
            )));
        }

        fs::create_dir_all(&ctx.scratch_dir)?;
        fs::create_dir_all(&ctx.graphs_dir)?;
        if let Some(parent) = ctx.session_log.parent() {
            fs::create_dir_all(parent)?;
        }
        // Session log is truncated exactly here (creation/restart) and
        // never while a run is in flight.
        fs::write(&ctx.session_log, b"")?;

        let mut command = Command::new(&binary);
        command
            .arg("-q")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(&ctx.scratch_dir);
        #[cfg(target_family = "unix")]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a break targets the Engine and its
            // children without touching the worker itself.
            command.process_group(0);
        }
        let mut child = command.spawn().map_err(|err| {
            EngineError::Unavailable(format!("failed to launch {}: {err}", binary.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("engine stdout unavailable".to_string()))?;

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("engine-stdout".to_string())
            .spawn(move || {
                use std::io::BufRead;
                let reader = std::io::BufReader::new(stdout);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|err| EngineError::Protocol(format!("stdout reader spawn failed: {err}")))?;

        interrupt.set_pid(child.id());

        let mut session = Self {
            ctx,
            child,
            stdin,
            stdout_rx: rx,
            interrupt,
            info: EngineInfo::default(),
            seq: 0,
        };
        session.initialize()?;
        Ok(session)
    }

    fn initialize(&mut self) -> Result<(), EngineError> {
        // `set more off` first: a fresh Engine that pages long output
        // would otherwise deadlock the very first run.
        self.write_console_line("set more off")?;
        let probe = self.execute_batch(
            "quietly set more off\ndisplay \"<<stata-mcp:version:`c(stata_version)':`c(flavor)'>>\"\n",
            Instant::now() + STARTUP_TIMEOUT,
        )?;
        let (version, edition) = parse_version_marker(&probe.console)
            .ok_or_else(|| EngineError::Protocol("version probe produced no marker".to_string()))?;
        self.info = EngineInfo {
            available: true,
            version: Some(version),
            edition: Some(edition),
        };
        Ok(())
    }

    pub fn info(&self) -> EngineInfo {
        self.info.clone()
    }

    pub fn session_log(&self) -> &Path {
        &self.ctx.session_log
    }

    /// Execute one prepared do-file body and wait for the completion
    /// sentinel. The sentinel and the return-code probe are typed at
    /// console level so they run even when the body aborts early.
    fn execute_batch(&mut self, body: &str, deadline: Instant) -> Result<BatchResult, EngineError> {
        self.seq += 1;
        let seq = self.seq;
        let wrapper = self.ctx.scratch_dir.join(format!("batch_{seq}.do"));
        fs::write(&wrapper, body)?;

        let do_line = format!("do \"{}\"", path_for_engine(&wrapper));
        let sentinel = format!("display \"<<stata-mcp:done:{seq}:\" _rc \">>\"");
        self.write_console_line(&do_line)?;
        self.write_console_line(&sentinel)?;

        let done_prefix = format!("<<stata-mcp:done:{seq}:");
        let mut console = String::new();
        let result = loop {
            let now = Instant::now();
            if now >= deadline {
                break Err(EngineError::Timeout(Duration::ZERO));
            }
            match self.stdout_rx.recv_timeout(deadline - now) {
                Ok(line) => {
                    if let Some(idx) = line.find(&done_prefix) {
                        let tail = &line[idx + done_prefix.len()..];
                        let rc_text = tail.split(">>").next().unwrap_or("").trim();
                        let rc = rc_text.parse::<i64>().unwrap_or(-1);
                        break Ok(BatchResult { rc, console });
                    }
                    // Skip the echo of our own sentinel command.
                    if line.contains(MARKER_PREFIX) && line.trim_start().starts_with('.') {
                        continue;
                    }
                    console.push_str(&line);
                    console.push('\n');
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    break Err(EngineError::Timeout(Duration::ZERO));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break Err(EngineError::Exited(
                        "engine closed stdout mid-batch".to_string(),
                    ));
                }
            }
        };
        let _ = fs::remove_file(&wrapper);
        result
    }

    fn write_console_line(&mut self, line: &str) -> Result<(), EngineError> {
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }

    /// Run user code. Output is read back from the log file the wrapper
    /// opened, which is also what the streaming layer tails.
    pub fn run(&mut self, request: &RunRequest) -> Result<RunOutcome, EngineError> {
        let code = auto_name_graph_commands(&sanitize_submission(&join_line_continuations(
            &request.code,
        )));

        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log_offset = fs::metadata(&request.log_path).map(|m| m.len()).unwrap_or(0);

        let graphs_before = self.list_graph_names()?;
        self.interrupt.take_break_seen();

        let mut body = String::new();
        body.push_str("capture log close _all\n");
        body.push_str(&format!(
            "log using \"{}\", append text\n",
            path_for_engine(&request.log_path)
        ));
        body.push_str(&format!(
            "display \"{EXECUTION_STARTED_MARKER}: `c(current_date)' `c(current_time)'\"\n"
        ));
        if let Some(working_dir) = normalized_working_dir(request.working_dir.as_deref()) {
            body.push_str(&format!("cd \"{working_dir}\"\n"));
        }
        body.push_str(&code);
        if !code.ends_with('\n') {
            body.push('\n');
        }

        let deadline = Instant::now() + request.timeout + Duration::from_secs(5);
        let batch = self.execute_batch(&body, deadline);

        // The wrapper leaves the log open on purpose: an aborted run
        // would otherwise lose its end marker. Close it here, writing
        // the marker first so the stream tailer sees the boundary.
        let finalize = format!(
            "display \"{EXECUTION_ENDED_MARKER}\"\ncapture log close _all\n"
        );
        let _ = self.execute_batch(&finalize, Instant::now() + HOUSEKEEPING_TIMEOUT);

        let batch = batch?;
        let break_seen = self.interrupt.take_break_seen();
        let status = match batch.rc {
            0 => RunStatus::Success,
            1 if break_seen => RunStatus::Cancelled,
            _ => RunStatus::Error,
        };

        let mut output = read_log_slice(&request.log_path, log_offset);
        let mut graphs = Vec::new();
        if status == RunStatus::Success {
            graphs = self.export_new_graphs(&graphs_before)?;
            if !graphs.is_empty() {
                output.push_str(&render_graphs_block(&graphs));
            }
        }

        Ok(RunOutcome {
            status,
            output,
            log_path: request.log_path.display().to_string(),
            graphs,
        })
    }

    fn list_graph_names(&mut self) -> Result<Vec<String>, EngineError> {
        let batch = self.execute_batch(
            "quietly graph dir\ndisplay \"<<stata-mcp:graphs:`r(list)'>>\"\n",
            Instant::now() + HOUSEKEEPING_TIMEOUT,
        )?;
        Ok(parse_graph_list_marker(&batch.console))
    }

    fn export_new_graphs(&mut self, before: &[String]) -> Result<Vec<GraphRef>, EngineError> {
        let after = self.list_graph_names()?;
        let mut refs = Vec::new();
        let mut sequence = 0u32;
        for name in after {
            if before.iter().any(|existing| existing == &name) {
                continue;
            }
            let target = self.ctx.graphs_dir.join(format!("{name}.png"));
            let body = format!(
                "graph export \"{}\", name({name}) replace width({GRAPH_EXPORT_WIDTH}) height({GRAPH_EXPORT_HEIGHT})\n",
                path_for_engine(&target)
            );
            let batch = self.execute_batch(&body, Instant::now() + HOUSEKEEPING_TIMEOUT)?;
            if batch.rc != 0 {
                continue;
            }
            sequence += 1;
            refs.push(GraphRef {
                name,
                absolute_path: path_for_engine(&target),
                created_at: chrono::Utc::now(),
                sequence,
            });
        }
        Ok(refs)
    }

    pub fn view_data(
        &mut self,
        if_condition: Option<&str>,
        max_rows: u64,
    ) -> Result<Result<DataTable, String>, EngineError> {
        let count = self.execute_batch(
            "quietly count\ndisplay \"<<stata-mcp:count:`r(N)'>>\"\n",
            Instant::now() + HOUSEKEEPING_TIMEOUT,
        )?;
        let total_rows = parse_count_marker(&count.console).unwrap_or(0);
        if total_rows == 0 {
            return Ok(Ok(empty_table(max_rows)));
        }

        let deadline = Instant::now() + HOUSEKEEPING_TIMEOUT;
        self.execute_batch("preserve\n", deadline)?;

        let result = self.view_data_inner(if_condition, max_rows, total_rows);

        // Always restore, even on a failed filter, or the session's
        // in-memory data would stay truncated.
        let _ = self.execute_batch("restore\n", Instant::now() + HOUSEKEEPING_TIMEOUT);
        result
    }

    fn view_data_inner(
        &mut self,
        if_condition: Option<&str>,
        max_rows: u64,
        total_rows: u64,
    ) -> Result<Result<DataTable, String>, EngineError> {
        let deadline = || Instant::now() + HOUSEKEEPING_TIMEOUT;

        let matching = match if_condition {
            Some(condition) if !condition.trim().is_empty() => {
                let keep = self.execute_batch(
                    &format!("keep if {}\n", condition.trim()),
                    deadline(),
                )?;
                if keep.rc != 0 {
                    return Ok(Err(format!(
                        "invalid condition syntax: {} (r({}))",
                        condition.trim(),
                        keep.rc
                    )));
                }
                let count = self.execute_batch(
                    "quietly count\ndisplay \"<<stata-mcp:count:`r(N)'>>\"\n",
                    deadline(),
                )?;
                parse_count_marker(&count.console).unwrap_or(0)
            }
            _ => total_rows,
        };

        if matching == 0 {
            let mut table = empty_table(max_rows);
            table.total_rows = 0;
            return Ok(Ok(table));
        }

        let displayed = matching.min(max_rows);
        if matching > displayed {
            self.execute_batch(&format!("quietly keep in 1/{displayed}\n"), deadline())?;
        }

        let csv_path = self.ctx.scratch_dir.join(format!("view_{}.csv", self.seq));
        let export = self.execute_batch(
            &format!(
                "export delimited using \"{}\", replace nolabel\n",
                path_for_engine(&csv_path)
            ),
            deadline(),
        )?;
        if export.rc != 0 {
            return Err(EngineError::Protocol(format!(
                "export delimited failed with r({})",
                export.rc
            )));
        }

        let csv = fs::read_to_string(&csv_path)?;
        let _ = fs::remove_file(&csv_path);
        let mut table = parse_exported_csv(&csv)
            .ok_or_else(|| EngineError::Protocol("exported csv was empty".to_string()))?;
        table.total_rows = matching;
        table.displayed_rows = displayed;
        table.max_rows = max_rows;
        Ok(Ok(table))
    }

    /// Tear down and re-initialize the Engine in place. Wipes all
    /// session state; the session log is truncated by the restart.
    pub fn restart(&mut self) -> Result<(), EngineError> {
        self.kill_engine();
        let fresh = EngineSession::start(self.ctx.clone(), self.interrupt.clone())?;
        let old = std::mem::replace(self, fresh);
        drop(old);
        Ok(())
    }

    fn kill_engine(&mut self) {
        #[cfg(target_family = "unix")]
        {
            let pid = self.child.id() as i32;
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.kill_engine();
    }
}

/// Paths handed to the Engine always use forward slashes, so quoting
/// never collides with escape sequences.
pub fn path_for_engine(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

pub fn has_do_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("do"))
}

/// How deep the subdirectory search for a bare do-file name goes.
const DO_FILE_SEARCH_DEPTH: usize = 2;

/// Resolve a do-file path to an absolute location. Callers routinely
/// hand over bare filenames or paths with the wrong slash flavor, so a
/// relative path is tried against the request's working directory and
/// the server's, as the raw value, joined, by basename, and through a
/// subdirectory search two levels deep. Returns the resolved path and
/// every candidate examined, for the failure message.
pub fn resolve_do_file_path(
    file_path: &str,
    working_dir: Option<&str>,
) -> (Option<PathBuf>, Vec<PathBuf>) {
    let raw = PathBuf::from(file_path);

    // Separator variants: a client on another OS may have sent the
    // other slash flavor.
    let mut forms: Vec<PathBuf> = vec![raw.clone()];
    if file_path.contains('\\') {
        forms.push(PathBuf::from(file_path.replace('\\', "/")));
    } else if cfg!(target_family = "windows") && file_path.contains('/') {
        forms.push(PathBuf::from(file_path.replace('/', "\\")));
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    for form in &forms {
        push_candidate(&mut candidates, form.clone());
    }

    if !raw.is_absolute() {
        let mut roots: Vec<PathBuf> = Vec::new();
        if let Some(dir) = working_dir.filter(|dir| !dir.trim().is_empty()) {
            roots.push(PathBuf::from(dir));
        }
        if let Ok(cwd) = std::env::current_dir() {
            roots.push(cwd);
        }
        let mut base_names: Vec<std::ffi::OsString> = Vec::new();
        for form in &forms {
            if let Some(name) = form.file_name().map(std::ffi::OsStr::to_os_string)
                && !base_names.contains(&name)
            {
                base_names.push(name);
            }
        }

        for root in &roots {
            for form in &forms {
                push_candidate(&mut candidates, root.join(form));
            }
            for name in &base_names {
                push_candidate(&mut candidates, root.join(name));
            }
        }
        for root in &roots {
            for name in &base_names {
                walk_for_file(root, name, DO_FILE_SEARCH_DEPTH, &mut candidates);
            }
        }
    }

    let mut tried = Vec::new();
    for candidate in candidates {
        tried.push(candidate.clone());
        if candidate.is_file() && has_do_extension(&candidate) {
            let resolved = candidate.canonicalize().unwrap_or(candidate);
            return (Some(resolved), tried);
        }
    }
    (None, tried)
}

fn push_candidate(candidates: &mut Vec<PathBuf>, candidate: PathBuf) {
    if !candidates.contains(&candidate) {
        candidates.push(candidate);
    }
}

fn walk_for_file(
    root: &Path,
    name: &std::ffi::OsStr,
    depth: usize,
    candidates: &mut Vec<PathBuf>,
) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let candidate = path.join(name);
        if candidate.is_file() {
            push_candidate(candidates, candidate);
        }
        if depth > 1 {
            walk_for_file(&path, name, depth - 1, candidates);
        }
    }
}

pub fn normalized_working_dir(working_dir: Option<&str>) -> Option<String> {
    let raw = working_dir?.trim();
    if raw.is_empty() {
        return None;
    }
    let mut normalized = raw.replace('\\', "/");
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    Some(normalized)
}

fn read_log_slice(log_path: &Path, offset: u64) -> String {
    let Ok(raw) = fs::read(log_path) else {
        return String::new();
    };
    let slice = if (offset as usize) < raw.len() {
        &raw[offset as usize..]
    } else {
        &[]
    };
    let text = String::from_utf8_lossy(slice);
    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines() {
        if is_internal_log_line(line) {
            continue;
        }
        kept.push(line);
    }
    while kept.first().is_some_and(|line| line.trim().is_empty()) {
        kept.remove(0);
    }
    while kept.last().is_some_and(|line| line.trim().is_empty()) {
        kept.pop();
    }
    let mut output = kept.join("\n");
    if !output.is_empty() {
        output.push('\n');
    }
    output
}

/// Lines the wrapper machinery produced rather than the user's code:
/// internal markers, their echoes, the boundary markers, and the
/// wrapper's own log bookkeeping.
pub fn is_internal_log_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.contains(MARKER_PREFIX) {
        return true;
    }
    if trimmed.contains(EXECUTION_STARTED_MARKER) || trimmed.contains(EXECUTION_ENDED_MARKER) {
        return true;
    }
    trimmed == ". capture log close _all"
        || trimmed.starts_with(". log using ")
        || trimmed.starts_with("log type:")
        || trimmed.starts_with("opened on:")
        || trimmed.starts_with("closed on:")
        || trimmed.starts_with("name:")
        || trimmed.starts_with("log:")
}

fn parse_marker<'a>(console: &'a str, key: &str) -> Option<&'a str> {
    let prefix = format!("{MARKER_PREFIX}{key}:");
    for line in console.lines() {
        if line.trim_start().starts_with('.') {
            continue;
        }
        if let Some(idx) = line.find(&prefix) {
            let tail = &line[idx + prefix.len()..];
            return tail.split(">>").next();
        }
    }
    None
}

fn parse_version_marker(console: &str) -> Option<(String, String)> {
    let payload = parse_marker(console, "version")?;
    let (version, edition) = payload.split_once(':')?;
    Some((version.trim().to_string(), edition.trim().to_string()))
}

fn parse_count_marker(console: &str) -> Option<u64> {
    parse_marker(console, "count")?.trim().parse().ok()
}

fn parse_graph_list_marker(console: &str) -> Vec<String> {
    parse_marker(console, "graphs")
        .map(|payload| {
            payload
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn empty_table(max_rows: u64) -> DataTable {
    DataTable {
        columns: Vec::new(),
        data: Vec::new(),
        dtypes: BTreeMap::new(),
        total_rows: 0,
        displayed_rows: 0,
        max_rows,
    }
}

/// Parse the Engine's `export delimited` output into a column-major
/// table. Numeric columns are detected by every non-missing cell
/// parsing as a number; missing cells (empty or `.`) become null.
fn parse_exported_csv(csv: &str) -> Option<DataTable> {
    let mut rows = csv_records(csv).into_iter();
    let columns = rows.next()?;
    if columns.is_empty() {
        return None;
    }

    let records: Vec<Vec<String>> = rows.collect();
    let mut data: Vec<Vec<JsonValue>> = vec![Vec::with_capacity(records.len()); columns.len()];
    let mut numeric: Vec<bool> = vec![true; columns.len()];

    for record in &records {
        for (idx, _) in columns.iter().enumerate() {
            let cell = record.get(idx).map(String::as_str).unwrap_or("");
            if !is_missing_cell(cell) && cell.parse::<f64>().is_err() {
                numeric[idx] = false;
            }
        }
    }

    for record in &records {
        for (idx, _) in columns.iter().enumerate() {
            let cell = record.get(idx).map(String::as_str).unwrap_or("");
            let value = if is_missing_cell(cell) {
                JsonValue::Null
            } else if numeric[idx] {
                cell.parse::<f64>()
                    .ok()
                    .and_then(|number| serde_json::Number::from_f64(number))
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            } else {
                JsonValue::String(cell.to_string())
            };
            data[idx].push(value);
        }
    }

    let mut dtypes = BTreeMap::new();
    for (idx, column) in columns.iter().enumerate() {
        let dtype = if numeric[idx] { "numeric" } else { "string" };
        dtypes.insert(column.clone(), dtype.to_string());
    }

    let displayed = records.len() as u64;
    Some(DataTable {
        columns,
        data,
        dtypes,
        total_rows: displayed,
        displayed_rows: displayed,
        max_rows: 0,
    })
}

fn is_missing_cell(cell: &str) -> bool {
    cell.is_empty() || cell == "."
}

/// Minimal parser for the Engine's own CSV dialect: comma separated,
/// double-quoted fields with `""` escapes, one record per line.
fn csv_records(csv: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = csv.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}
