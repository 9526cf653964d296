use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
#[cfg(target_family = "unix")]
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, OnceLock, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::worker_protocol::{EngineInfo, WorkerReply};

pub const IPC_READ_FD_ENV: &str = "STATA_MCP_IPC_READ_FD";
pub const IPC_WRITE_FD_ENV: &str = "STATA_MCP_IPC_WRITE_FD";

/// Control messages from the server to the worker. These ride the IPC
/// side-band rather than stdin so a break can overtake request frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Break,
    Shutdown,
}

#[derive(Default)]
struct ServerInbox {
    replies: VecDeque<WorkerReply>,
    engine_info: Option<EngineInfo>,
    session_end: bool,
    disconnected: bool,
}

#[derive(Default)]
struct WorkerInbox {
    queue: VecDeque<ControlMessage>,
    disconnected: bool,
}

#[derive(Debug)]
pub enum IpcWaitError {
    Timeout,
    SessionEnd,
    Disconnected,
}

/// Server end of a worker's IPC side-band. Replies land in an inbox
/// guarded by a mutex + condvar; waiting callers never hold the session
/// table lock.
#[derive(Clone)]
pub struct ServerIpcConnection {
    sender: mpsc::Sender<ControlMessage>,
    inbox: Arc<Mutex<ServerInbox>>,
    cvar: Arc<Condvar>,
}

impl ServerIpcConnection {
    fn new(transport: IpcTransport) -> Self {
        let (tx, rx) = mpsc::channel();
        let inbox = Arc::new(Mutex::new(ServerInbox::default()));
        let cvar = Arc::new(Condvar::new());

        let reader_inbox = inbox.clone();
        let reader_cvar = cvar.clone();
        let IpcTransport { reader, writer } = transport;
        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => {
                        let mut guard = reader_inbox.lock().unwrap();
                        guard.disconnected = true;
                        reader_cvar.notify_all();
                        break;
                    }
                    Ok(_) => {}
                }
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(reply) = serde_json::from_str::<WorkerReply>(trimmed) else {
                    continue;
                };
                let mut guard = reader_inbox.lock().unwrap();
                match reply {
                    WorkerReply::EngineInfo(info) => {
                        guard.engine_info = Some(info);
                    }
                    WorkerReply::SessionEnd => {
                        guard.session_end = true;
                    }
                    other => guard.replies.push_back(other),
                }
                reader_cvar.notify_all();
            }
        });

        spawn_writer(rx, writer);

        Self {
            sender: tx,
            inbox,
            cvar,
        }
    }

    pub fn send(&self, message: ControlMessage) -> Result<(), mpsc::SendError<ControlMessage>> {
        self.sender.send(message)
    }

    /// Block until the worker delivers the reply for the in-flight
    /// request, the worker session ends, or the deadline passes.
    pub fn wait_for_reply(&self, timeout: Duration) -> Result<WorkerReply, IpcWaitError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inbox.lock().unwrap();
        loop {
            if let Some(reply) = guard.replies.pop_front() {
                return Ok(reply);
            }
            if guard.session_end {
                return Err(IpcWaitError::SessionEnd);
            }
            if guard.disconnected {
                return Err(IpcWaitError::Disconnected);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(IpcWaitError::Timeout);
            }
            let remaining = deadline.saturating_duration_since(now);
            let (next_guard, wait) = self.cvar.wait_timeout(guard, remaining).unwrap();
            guard = next_guard;
            if wait.timed_out() && guard.replies.is_empty() {
                return Err(IpcWaitError::Timeout);
            }
        }
    }

    pub fn wait_for_engine_info(&self, timeout: Duration) -> Result<EngineInfo, IpcWaitError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inbox.lock().unwrap();
        loop {
            if let Some(info) = guard.engine_info.clone() {
                return Ok(info);
            }
            if guard.session_end {
                return Err(IpcWaitError::SessionEnd);
            }
            if guard.disconnected {
                return Err(IpcWaitError::Disconnected);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(IpcWaitError::Timeout);
            }
            let remaining = deadline.saturating_duration_since(now);
            let (next_guard, wait) = self.cvar.wait_timeout(guard, remaining).unwrap();
            guard = next_guard;
            if wait.timed_out() && guard.engine_info.is_none() {
                return Err(IpcWaitError::Timeout);
            }
        }
    }

    pub fn latest_engine_info(&self) -> Option<EngineInfo> {
        self.inbox.lock().unwrap().engine_info.clone()
    }

    pub fn session_ended(&self) -> bool {
        self.inbox.lock().unwrap().session_end
    }

    pub fn clear_stale_replies(&self) {
        self.inbox.lock().unwrap().replies.clear();
    }
}

/// Worker end: receives control messages, sends replies.
#[derive(Clone)]
pub struct WorkerIpcConnection {
    sender: mpsc::Sender<WorkerReply>,
    inbox: Arc<Mutex<WorkerInbox>>,
    cvar: Arc<Condvar>,
}

impl WorkerIpcConnection {
    fn new(transport: IpcTransport) -> Self {
        let (tx, rx) = mpsc::channel();
        let inbox = Arc::new(Mutex::new(WorkerInbox::default()));
        let cvar = Arc::new(Condvar::new());

        let reader_inbox = inbox.clone();
        let reader_cvar = cvar.clone();
        let IpcTransport { reader, writer } = transport;
        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => {
                        let mut guard = reader_inbox.lock().unwrap();
                        guard.disconnected = true;
                        reader_cvar.notify_all();
                        break;
                    }
                    Ok(_) => {}
                }
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                if let Ok(message) = serde_json::from_str::<ControlMessage>(trimmed) {
                    let mut guard = reader_inbox.lock().unwrap();
                    guard.queue.push_back(message);
                    reader_cvar.notify_all();
                }
            }
        });

        spawn_writer(rx, writer);

        Self {
            sender: tx,
            inbox,
            cvar,
        }
    }

    pub fn send(&self, reply: WorkerReply) -> Result<(), mpsc::SendError<WorkerReply>> {
        self.sender.send(reply)
    }

    /// Blocking receive; `None` means the server went away and the
    /// worker should exit.
    pub fn recv(&self) -> Option<ControlMessage> {
        let mut guard = self.inbox.lock().unwrap();
        loop {
            if let Some(message) = guard.queue.pop_front() {
                return Some(message);
            }
            if guard.disconnected {
                return None;
            }
            guard = self.cvar.wait(guard).unwrap();
        }
    }
}

fn spawn_writer<T>(rx: mpsc::Receiver<T>, mut writer: Box<dyn Write + Send>)
where
    T: Serialize + Send + 'static,
{
    thread::spawn(move || {
        for message in rx {
            if let Ok(payload) = serde_json::to_string(&message) {
                if writer.write_all(payload.as_bytes()).is_err() {
                    break;
                }
                if writer.write_all(b"\n").is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        }
    });
}

struct IpcTransport {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

pub struct IpcServer {
    #[cfg(target_family = "unix")]
    server_read: Option<std::io::PipeReader>,
    #[cfg(target_family = "unix")]
    server_write: Option<std::io::PipeWriter>,
    #[cfg(target_family = "unix")]
    child_fds: Option<IpcChildFds>,
}

#[cfg(target_family = "unix")]
pub(crate) struct IpcChildFds {
    pub(crate) read_fd: RawFd,
    pub(crate) write_fd: RawFd,
}

impl IpcServer {
    pub fn bind() -> io::Result<Self> {
        #[cfg(target_family = "unix")]
        {
            let (server_read, server_write, child_read, child_write) = create_pipe_pair()?;
            Ok(Self {
                server_read: Some(server_read),
                server_write: Some(server_write),
                child_fds: Some(IpcChildFds {
                    read_fd: child_read,
                    write_fd: child_write,
                }),
            })
        }
        #[cfg(not(target_family = "unix"))]
        {
            // Anonymous pipe handle inheritance has no stable stdlib
            // story on Windows; worker isolation is Unix-only here.
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "worker IPC requires Unix pipe handle inheritance",
            ))
        }
    }

    #[cfg(target_family = "unix")]
    pub fn connect(self) -> io::Result<ServerIpcConnection> {
        let Some(server_read) = self.server_read else {
            return Err(io::Error::other("missing ipc read pipe"));
        };
        let Some(server_write) = self.server_write else {
            return Err(io::Error::other("missing ipc write pipe"));
        };
        Ok(ServerIpcConnection::new(IpcTransport {
            reader: Box::new(server_read),
            writer: Box::new(server_write),
        }))
    }

    #[cfg(not(target_family = "unix"))]
    pub fn connect(self) -> io::Result<ServerIpcConnection> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "worker IPC requires Unix pipe handle inheritance",
        ))
    }

    #[cfg(target_family = "unix")]
    pub fn take_child_fds(&mut self) -> Option<IpcChildFds> {
        self.child_fds.take()
    }
}

#[cfg(target_family = "unix")]
fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let new_flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_family = "unix")]
fn create_pipe_pair() -> io::Result<(std::io::PipeReader, std::io::PipeWriter, RawFd, RawFd)> {
    let (server_read, child_write) = std::io::pipe()?;
    let (child_read, server_write) = std::io::pipe()?;

    let child_read_fd = child_read.into_raw_fd();
    let child_write_fd = child_write.into_raw_fd();

    set_cloexec(child_read_fd, false)?;
    set_cloexec(child_write_fd, false)?;
    set_cloexec(server_read.as_raw_fd(), true)?;
    set_cloexec(server_write.as_raw_fd(), true)?;

    Ok((server_read, server_write, child_read_fd, child_write_fd))
}

/// Worker side: reconstruct the connection from the inherited pipe fds.
pub fn connect_from_env() -> io::Result<WorkerIpcConnection> {
    #[cfg(target_family = "unix")]
    {
        let read_fd = std::env::var(IPC_READ_FD_ENV)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "IPC read fd missing"))?;
        let write_fd = std::env::var(IPC_WRITE_FD_ENV)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "IPC write fd missing"))?;
        let read_fd: RawFd = read_fd
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid IPC read fd"))?;
        let write_fd: RawFd = write_fd
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid IPC write fd"))?;
        set_cloexec(read_fd, true)?;
        set_cloexec(write_fd, true)?;
        let reader = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let writer = unsafe { std::fs::File::from_raw_fd(write_fd) };
        Ok(WorkerIpcConnection::new(IpcTransport {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }))
    }
    #[cfg(not(target_family = "unix"))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "worker IPC requires Unix pipe handle inheritance",
        ))
    }
}

static IPC_GLOBAL: OnceLock<WorkerIpcConnection> = OnceLock::new();

pub fn set_global_ipc(conn: WorkerIpcConnection) {
    let _ = IPC_GLOBAL.set(conn);
}

pub fn global_ipc() -> Option<&'static WorkerIpcConnection> {
    IPC_GLOBAL.get()
}

pub fn emit_reply(reply: WorkerReply) {
    if let Some(ipc) = global_ipc() {
        let _ = ipc.send(reply);
    }
}

pub fn emit_session_end() {
    if let Some(ipc) = global_ipc() {
        let _ = ipc.send(WorkerReply::SessionEnd);
    }
}
