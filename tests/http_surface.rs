mod common;

use common::{TestResult, TestServer};

#[test]
fn help_prints_usage_and_exits_cleanly() -> TestResult<()> {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_stata-mcp"))
        .arg("--help")
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"), "unexpected usage text: {stdout}");
    assert!(stdout.contains("--multi-session"));
    Ok(())
}

#[test]
fn unknown_flag_is_a_bootstrap_failure() -> TestResult<()> {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_stata-mcp"))
        .arg("--bogus-flag")
        .output()?;
    assert!(!output.status.success());
    Ok(())
}

#[test]
fn health_reports_engine_unavailable_without_stata() -> TestResult<()> {
    let server = TestServer::start(&[])?;
    let (status, body) = server.get("/health")?;
    assert_eq!(status, 200);
    assert!(body.contains("\"ok\":true"), "unexpected body: {body}");
    assert!(
        body.contains("\"engine_available\":false"),
        "unexpected body: {body}"
    );
    Ok(())
}

#[test]
fn session_surface_works_end_to_end_without_an_engine() -> TestResult<()> {
    let server = TestServer::start(&["--max-sessions", "3"])?;

    let (status, body) = server.get("/sessions")?;
    assert_eq!(status, 200);
    assert!(body.contains("\"max_sessions\":3"), "unexpected body: {body}");

    // Creating a session spawns a real worker process even when the
    // Engine itself is missing.
    let (status, body) = server.post("/sessions", None)?;
    assert_eq!(status, 200, "unexpected body: {body}");
    assert!(body.contains("\"session_id\""), "unexpected body: {body}");
    let session_id = body
        .split("\"session_id\":\"")
        .nth(1)
        .and_then(|tail| tail.split('"').next())
        .ok_or("no session id in response")?
        .to_string();

    let (status, body) = server.get(&format!("/sessions/{session_id}"))?;
    assert_eq!(status, 200);
    assert!(body.contains("\"state\":\"ready\""), "unexpected body: {body}");

    // A run on that session surfaces the missing Engine as a 503 with
    // a machine-readable code, not a server crash.
    let (status, body) = server.post(
        "/run_selection",
        Some(&format!(
            "{{\"selection\": \"display 42\", \"session_id\": \"{session_id}\"}}"
        )),
    )?;
    assert_eq!(status, 503, "unexpected body: {body}");
    assert!(
        body.contains("\"code\":\"engine_unavailable\""),
        "unexpected body: {body}"
    );

    let (status, body) = server.get(&format!("/sessions/{session_id}"))?;
    assert_eq!(status, 200);
    assert!(body.contains("\"state\":\"ready\""), "unexpected body: {body}");

    // Destroy, then destroy again: idempotent.
    let (status, _body) = server.delete_session(&session_id)?;
    assert_eq!(status, 200);
    let (status, body) = server.delete_session(&session_id)?;
    assert_eq!(status, 200);
    assert!(body.contains("\"destroyed\":false"), "unexpected body: {body}");

    Ok(())
}

#[test]
fn unknown_session_and_graph_lookups_are_not_found() -> TestResult<()> {
    let server = TestServer::start(&[])?;

    let (status, body) = server.get("/sessions/01jabcdef")?;
    assert_eq!(status, 404);
    assert!(
        body.contains("\"code\":\"session_not_found\""),
        "unexpected body: {body}"
    );

    let (status, _body) = server.get("/graphs/graph1")?;
    assert_eq!(status, 404);
    Ok(())
}

#[test]
fn stop_execution_is_never_fatal() -> TestResult<()> {
    let server = TestServer::start(&[])?;
    let (status, body) = server.post("/stop_execution", None)?;
    assert_eq!(status, 200);
    assert!(
        body.contains("\"status\":\"no_execution\"")
            || body.contains("\"status\":\"stop_requested\"")
            || body.contains("\"status\":\"stopped\""),
        "unexpected body: {body}"
    );
    Ok(())
}
