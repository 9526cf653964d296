mod config;
mod engine;
mod error;
mod filter;
mod graphs;
mod ipc;
mod mcp;
mod server;
mod session;
mod worker;
mod worker_process;
mod worker_protocol;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{DisplayMode, LogFileLocation, LogLevel, ServerConfig, StataEdition};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // The worker and the Engine write to inherited pipes; if a reader
    // disappears, a write would raise SIGPIPE and kill the process on
    // Unix. Surface broken pipes as ordinary errors instead.
    ignore_sigpipe();

    if worker::is_worker_mode() {
        return worker::run();
    }

    let config = match parse_cli_args(std::env::args().skip(1).collect())? {
        Some(config) => config,
        None => return Ok(()),
    };
    init_tracing(&config)?;
    server::run(config).await
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn init_tracing(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let log_path = config.server_log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            config.log_level.as_filter(),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false)
                .with_target(false),
        )
        .init();
    Ok(())
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new(args: Vec<String>) -> Self {
        Self { args, index: 0 }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }
}

/// Match `--flag value` and `--flag=value` forms.
fn flag_value(
    arg: &str,
    flag: &str,
    parser: &mut ArgParser,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    if arg == flag {
        return parser.next_value(flag).map(Some);
    }
    if let Some(value) = arg.strip_prefix(flag)
        && let Some(value) = value.strip_prefix('=')
    {
        if value.is_empty() {
            return Err(format!("missing value for {flag}").into());
        }
        return Ok(Some(value.to_string()));
    }
    Ok(None)
}

fn parse_cli_args(
    args: Vec<String>,
) -> Result<Option<ServerConfig>, Box<dyn std::error::Error>> {
    let mut parser = ArgParser::new(args);
    let mut config = ServerConfig::default();

    while let Some(arg) = parser.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            "--force-port" => {
                config.force_port = true;
                continue;
            }
            "--multi-session" => {
                config.multi_session = true;
                continue;
            }
            "--no-multi-session" => {
                config.multi_session = false;
                continue;
            }
            _ => {}
        }

        if let Some(value) = flag_value(&arg, "--host", &mut parser)? {
            config.host = value;
        } else if let Some(value) = flag_value(&arg, "--port", &mut parser)? {
            config.port = value
                .parse()
                .map_err(|_| format!("invalid --port value: {value}"))?;
        } else if let Some(value) = flag_value(&arg, "--stata-path", &mut parser)? {
            config.stata_path = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--stata-edition", &mut parser)? {
            config.stata_edition = StataEdition::parse(&value)?;
        } else if let Some(value) = flag_value(&arg, "--log-file", &mut parser)? {
            config.log_file = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--log-file-location", &mut parser)? {
            config.log_file_location = LogFileLocation::parse(&value)?;
        } else if let Some(value) = flag_value(&arg, "--custom-log-directory", &mut parser)? {
            config.custom_log_directory = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--workspace-root", &mut parser)? {
            config.workspace_root = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(&arg, "--result-display-mode", &mut parser)? {
            config.result_display_mode = DisplayMode::parse(&value)?;
        } else if let Some(value) = flag_value(&arg, "--max-output-tokens", &mut parser)? {
            config.max_output_tokens = value
                .parse()
                .map_err(|_| format!("invalid --max-output-tokens value: {value}"))?;
        } else if let Some(value) = flag_value(&arg, "--log-level", &mut parser)? {
            config.log_level = LogLevel::parse(&value)?;
        } else if let Some(value) = flag_value(&arg, "--max-sessions", &mut parser)? {
            config.max_sessions = value
                .parse()
                .map_err(|_| format!("invalid --max-sessions value: {value}"))?;
        } else if let Some(value) = flag_value(&arg, "--session-timeout", &mut parser)? {
            let secs: u64 = value
                .parse()
                .map_err(|_| format!("invalid --session-timeout value: {value}"))?;
            config.session_timeout = std::time::Duration::from_secs(secs);
        } else {
            return Err(format!("unknown argument: {arg}").into());
        }
    }

    Ok(Some(config))
}

fn print_usage() {
    println!(
        "Usage:\n\
stata-mcp [options]\n\n\
--host <addr>: bind address (default: 127.0.0.1)\n\
--port <port>: bind port (default: 4000; scans upward when busy)\n\
--force-port: require the exact port; fail instead of scanning\n\
--stata-path <path>: Stata installation directory or console binary\n\
--stata-edition <mp|se|be>: console edition to launch (default: mp)\n\
--log-file <path>: server log destination\n\
--log-file-location <dofile|parent|workspace|extension|custom>: where run logs go (default: extension)\n\
--custom-log-directory <dir>: run log directory for --log-file-location custom\n\
--workspace-root <dir>: workspace root; also hosts the server data directory\n\
--result-display-mode <compact|full>: output filtering (default: compact)\n\
--max-output-tokens <n>: response token budget, 0 = unlimited (default: 10000)\n\
--log-level <DEBUG|INFO|WARN|ERROR>: server log level (default: INFO)\n\
--multi-session / --no-multi-session: parallel session mode (default: on)\n\
--max-sessions <n>: session cap in multi-session mode (default: 100)\n\
--session-timeout <secs>: idle eviction timeout (default: 3600)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<ServerConfig>, String> {
        parse_cli_args(args.iter().map(|s| s.to_string()).collect())
            .map_err(|err| err.to_string())
    }

    #[test]
    fn defaults_apply_without_arguments() {
        let config = parse(&[]).expect("parse").expect("config");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4000);
        assert!(config.multi_session);
        assert_eq!(config.max_output_tokens, 10_000);
    }

    #[test]
    fn flags_accept_space_and_equals_forms() {
        let config = parse(&["--port", "4010", "--host=0.0.0.0"])
            .expect("parse")
            .expect("config");
        assert_eq!(config.port, 4010);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn edition_and_mode_flags_parse() {
        let config = parse(&[
            "--stata-edition=se",
            "--result-display-mode=full",
            "--log-level=DEBUG",
            "--log-file-location=workspace",
        ])
        .expect("parse")
        .expect("config");
        assert_eq!(config.stata_edition, StataEdition::Se);
        assert_eq!(config.result_display_mode, DisplayMode::Full);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_file_location, LogFileLocation::Workspace);
    }

    #[test]
    fn no_multi_session_disables_multi_session() {
        let config = parse(&["--no-multi-session"]).expect("parse").expect("config");
        assert!(!config.multi_session);
    }

    #[test]
    fn session_timeout_parses_as_seconds() {
        let config = parse(&["--session-timeout", "120"])
            .expect("parse")
            .expect("config");
        assert_eq!(config.session_timeout, std::time::Duration::from_secs(120));
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        let err = parse(&["--bogus"]).expect_err("rejects");
        assert!(err.contains("unknown argument"));
    }

    #[test]
    fn missing_values_are_rejected() {
        let err = parse(&["--port"]).expect_err("rejects");
        assert!(err.contains("missing value for --port"));

        let err = parse(&["--stata-edition="]).expect_err("rejects");
        assert!(err.contains("missing value for --stata-edition"));
    }

    #[test]
    fn invalid_enum_values_are_rejected() {
        assert!(parse(&["--stata-edition=ic"]).is_err());
        assert!(parse(&["--log-level=LOUD"]).is_err());
        assert!(parse(&["--result-display-mode=verbose"]).is_err());
    }
}
