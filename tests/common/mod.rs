#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const STARTUP_WAIT: Duration = Duration::from_secs(30);

/// A running server instance bound to an ephemeral port, configured so
/// no Engine is ever found (deterministic `engine_available: false`).
pub struct TestServer {
    child: Child,
    pub addr: String,
    _workspace: tempfile::TempDir,
}

impl TestServer {
    pub fn start(extra_args: &[&str]) -> TestResult<Self> {
        let workspace = tempfile::tempdir()?;
        let mut command = Command::new(env!("CARGO_BIN_EXE_stata-mcp"));
        command
            .arg("--port")
            .arg("0")
            .arg("--workspace-root")
            .arg(workspace.path())
            .arg("--stata-path")
            .arg(workspace.path())
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let stderr = child.stderr.take().ok_or("missing stderr")?;

        // Drain stderr on a thread forever; the startup line comes back
        // over a channel, later output is discarded so the pipe never
        // fills up.
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let reader = BufReader::new(stderr);
            let mut announced = false;
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if !announced && let Some(idx) = line.find("listening on http://") {
                    let addr = line[idx + "listening on http://".len()..].trim().to_string();
                    announced = true;
                    let _ = tx.send(addr);
                }
            }
        });

        let addr = rx
            .recv_timeout(STARTUP_WAIT)
            .map_err(|_| "server did not announce its address in time")?;
        Ok(Self {
            child,
            addr,
            _workspace: workspace,
        })
    }

    pub fn get(&self, path: &str) -> TestResult<(u16, String)> {
        self.request("GET", path, None)
    }

    pub fn post(&self, path: &str, body: Option<&str>) -> TestResult<(u16, String)> {
        self.request("POST", path, body)
    }

    pub fn delete_session(&self, session_id: &str) -> TestResult<(u16, String)> {
        self.request("DELETE", &format!("/sessions/{session_id}"), None)
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> TestResult<(u16, String)> {
        let mut stream = TcpStream::connect(&self.addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            self.addr,
            body.len(),
        );
        stream.write_all(request.as_bytes())?;

        let mut raw = String::new();
        stream.read_to_string(&mut raw)?;
        let status: u16 = raw
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .ok_or("malformed status line")?;
        let payload = raw
            .split_once("\r\n\r\n")
            .map(|(_, tail)| decode_body(tail))
            .unwrap_or_default();
        Ok((status, payload))
    }
}

/// Good enough for this suite: strip HTTP/1.1 chunked framing when
/// present, otherwise pass the body through.
fn decode_body(tail: &str) -> String {
    let looks_chunked = tail
        .lines()
        .next()
        .is_some_and(|first| usize::from_str_radix(first.trim(), 16).is_ok());
    if !looks_chunked {
        return tail.to_string();
    }
    let mut out = String::new();
    let mut rest = tail;
    while let Some((size_line, after)) = rest.split_once("\r\n") {
        let Ok(size) = usize::from_str_radix(size_line.trim(), 16) else {
            break;
        };
        if size == 0 || after.len() < size {
            break;
        }
        out.push_str(&after[..size]);
        rest = after[size..].trim_start_matches("\r\n");
    }
    out
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
