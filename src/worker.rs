use std::io::Read;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::engine::{
    EngineError, EngineSession, InterruptHandle, RunRequest, WorkerContext, has_do_extension,
    resolve_do_file_path,
};
use crate::ipc::{ControlMessage, connect_from_env, emit_reply, emit_session_end, set_global_ipc};
use crate::worker_protocol::{
    EngineInfo, FailureCode, RunOutcome, RunStatus, WORKER_MODE_ARG, WorkerReply, WorkerRequest,
    parse_input_frame_header,
};

pub fn is_worker_mode() -> bool {
    std::env::args().any(|arg| arg == WORKER_MODE_ARG || arg == format!("--{WORKER_MODE_ARG}"))
}

/// Worker-process entry. One Engine, one request at a time; the server
/// upholds the single-in-flight invariant, so requests execute right
/// on the stdin thread while breaks arrive on the IPC side-band.
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = WorkerContext::from_env();
    let conn = connect_from_env().map_err(|err| {
        eprintln!("worker ipc init error: {err}");
        err
    })?;
    set_global_ipc(conn.clone());

    let interrupt = InterruptHandle::default();
    let mut engine = match EngineSession::start(ctx.clone(), interrupt.clone()) {
        Ok(engine) => {
            emit_reply(WorkerReply::EngineInfo(engine.info()));
            Some(engine)
        }
        Err(err) => {
            eprintln!("worker engine start error: {err}");
            emit_reply(WorkerReply::EngineInfo(EngineInfo {
                available: false,
                version: None,
                edition: None,
            }));
            None
        }
    };

    let control_interrupt = interrupt.clone();
    thread::Builder::new()
        .name("worker-control".to_string())
        .spawn(move || {
            loop {
                match conn.recv() {
                    Some(ControlMessage::Break) => control_interrupt.interrupt(),
                    Some(ControlMessage::Shutdown) | None => {
                        // Without the server there is nobody to answer;
                        // exit so the session manager can respawn.
                        emit_session_end();
                        std::process::exit(0);
                    }
                }
            }
        })
        .map_err(|err| format!("failed to spawn worker control thread: {err}"))?;

    let stdin = std::io::stdin();
    let mut reader = std::io::BufReader::new(stdin);
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = {
            use std::io::BufRead;
            reader.read_line(&mut line)?
        };
        if bytes == 0 {
            emit_session_end();
            break;
        }
        let Some(len) = parse_input_frame_header(&line) else {
            continue;
        };
        let mut buffer = vec![0u8; len];
        reader.read_exact(&mut buffer)?;
        let payload = String::from_utf8_lossy(&buffer).to_string();
        let request = match serde_json::from_str::<WorkerRequest>(&payload) {
            Ok(request) => request,
            Err(err) => {
                emit_reply(WorkerReply::Failed {
                    code: FailureCode::Internal,
                    message: format!("malformed worker request: {err}"),
                });
                continue;
            }
        };

        let (reply, engine_died) = handle_request(&ctx, &interrupt, &mut engine, request);
        emit_reply(reply);
        if engine_died {
            emit_session_end();
            break;
        }
    }

    Ok(())
}

fn handle_request(
    ctx: &WorkerContext,
    interrupt: &InterruptHandle,
    engine: &mut Option<EngineSession>,
    request: WorkerRequest,
) -> (WorkerReply, bool) {
    match request {
        WorkerRequest::Introspect => {
            let info = engine
                .as_ref()
                .map(EngineSession::info)
                .unwrap_or_default();
            (WorkerReply::EngineInfo(info), false)
        }
        WorkerRequest::Restart => restart(ctx, interrupt, engine),
        WorkerRequest::RunSelection {
            code,
            working_dir,
            timeout_secs,
        } => {
            let Some(session) = engine.as_mut() else {
                return (engine_unavailable(), false);
            };
            let request = RunRequest {
                code,
                working_dir,
                timeout: Duration::from_secs(timeout_secs),
                log_path: session.session_log().to_path_buf(),
            };
            run_reply(session.run(&request))
        }
        WorkerRequest::RunFile {
            path,
            working_dir,
            timeout_secs,
            log_path,
        } => {
            let Some(session) = engine.as_mut() else {
                return (engine_unavailable(), false);
            };
            let raw = PathBuf::from(&path);
            if raw.is_file() && !has_do_extension(&raw) {
                return (
                    WorkerReply::Failed {
                        code: FailureCode::BadRequest,
                        message: format!("file must be a Stata .do file: {path}"),
                    },
                    false,
                );
            }
            let (resolved, tried) = resolve_do_file_path(&path, working_dir.as_deref());
            let Some(file) = resolved else {
                let tried_display = tried
                    .iter()
                    .map(|candidate| candidate.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return (
                    WorkerReply::Failed {
                        code: FailureCode::BadRequest,
                        message: format!(
                            "file not found: {path}. Tried these paths: {tried_display}"
                        ),
                    },
                    false,
                );
            };
            let code = match std::fs::read_to_string(&file) {
                Ok(code) => code,
                Err(err) => {
                    return (
                        WorkerReply::Failed {
                            code: FailureCode::BadRequest,
                            message: format!("could not read {}: {err}", file.display()),
                        },
                        false,
                    );
                }
            };
            // Outputs land next to the do-file unless the caller says
            // otherwise, matching how the Engine itself runs scripts.
            let working_dir = working_dir.or_else(|| {
                file.parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map(|dir| dir.display().to_string())
            });
            let request = RunRequest {
                code,
                working_dir,
                timeout: Duration::from_secs(timeout_secs),
                log_path: PathBuf::from(log_path),
            };
            run_reply(session.run(&request))
        }
        WorkerRequest::ViewData {
            if_condition,
            max_rows,
        } => {
            let Some(session) = engine.as_mut() else {
                return (engine_unavailable(), false);
            };
            match session.view_data(if_condition.as_deref(), max_rows) {
                Ok(Ok(table)) => (WorkerReply::Data { table }, false),
                Ok(Err(message)) => (
                    WorkerReply::Failed {
                        code: FailureCode::BadRequest,
                        message,
                    },
                    false,
                ),
                Err(err) => failed_from_engine(err),
            }
        }
    }
}

fn restart(
    ctx: &WorkerContext,
    interrupt: &InterruptHandle,
    engine: &mut Option<EngineSession>,
) -> (WorkerReply, bool) {
    let result = match engine.as_mut() {
        Some(session) => session.restart(),
        None => {
            // Engine never came up; restart is the retry path.
            match EngineSession::start(ctx.clone(), interrupt.clone()) {
                Ok(session) => {
                    *engine = Some(session);
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
    };
    match result {
        Ok(()) => {
            let info = engine
                .as_ref()
                .map(EngineSession::info)
                .unwrap_or_default();
            emit_reply(WorkerReply::EngineInfo(info));
            (
                WorkerReply::RunCompleted {
                    outcome: RunOutcome {
                        status: RunStatus::Success,
                        output: "session restarted".to_string(),
                        log_path: ctx.session_log.display().to_string(),
                        graphs: Vec::new(),
                    },
                },
                false,
            )
        }
        Err(err) => {
            *engine = None;
            emit_reply(WorkerReply::EngineInfo(EngineInfo::default()));
            failed_from_engine(err)
        }
    }
}

fn run_reply(result: Result<RunOutcome, EngineError>) -> (WorkerReply, bool) {
    match result {
        Ok(outcome) => (WorkerReply::RunCompleted { outcome }, false),
        Err(err) => failed_from_engine(err),
    }
}

fn engine_unavailable() -> WorkerReply {
    WorkerReply::Failed {
        code: FailureCode::EngineUnavailable,
        message: "the Engine did not initialize in this worker".to_string(),
    }
}

fn failed_from_engine(err: EngineError) -> (WorkerReply, bool) {
    let died = matches!(err, EngineError::Exited(_));
    let code = match err {
        EngineError::Unavailable(_) => FailureCode::EngineUnavailable,
        _ => FailureCode::Internal,
    };
    (
        WorkerReply::Failed {
            code,
            message: err.to_string(),
        },
        died,
    )
}
