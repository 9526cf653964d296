use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 10_000;
pub const DEFAULT_MAX_SESSIONS: usize = 100;
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 600;

/// How many ports above the requested one we probe before giving up
/// when `--force-port` is not set.
pub const PORT_SCAN_ATTEMPTS: u16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StataEdition {
    Mp,
    Se,
    Be,
}

impl StataEdition {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "mp" => Ok(StataEdition::Mp),
            "se" => Ok(StataEdition::Se),
            "be" => Ok(StataEdition::Be),
            other => Err(format!(
                "invalid stata edition: {other} (expected mp|se|be)"
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StataEdition::Mp => "mp",
            StataEdition::Se => "se",
            StataEdition::Be => "be",
        }
    }

    /// Console binary names to try, most specific first. The BE edition
    /// historically shipped as plain `stata`.
    fn binary_candidates(self) -> &'static [&'static str] {
        match self {
            StataEdition::Mp => &["stata-mp"],
            StataEdition::Se => &["stata-se"],
            StataEdition::Be => &["stata-be", "stata"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFileLocation {
    DoFile,
    Parent,
    Workspace,
    Extension,
    Custom,
}

impl LogFileLocation {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "dofile" => Ok(LogFileLocation::DoFile),
            "parent" => Ok(LogFileLocation::Parent),
            "workspace" => Ok(LogFileLocation::Workspace),
            "extension" => Ok(LogFileLocation::Extension),
            "custom" => Ok(LogFileLocation::Custom),
            other => Err(format!(
                "invalid log file location: {other} (expected dofile|parent|workspace|extension|custom)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Compact,
    Full,
}

impl DisplayMode {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "compact" => Ok(DisplayMode::Compact),
            "full" => Ok(DisplayMode::Full),
            other => Err(format!(
                "invalid result display mode: {other} (expected compact|full)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!(
                "invalid log level: {other} (expected DEBUG|INFO|WARN|ERROR)"
            )),
        }
    }

    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub force_port: bool,
    pub stata_path: Option<PathBuf>,
    pub stata_edition: StataEdition,
    pub log_file: Option<PathBuf>,
    pub log_file_location: LogFileLocation,
    pub custom_log_directory: Option<PathBuf>,
    pub workspace_root: Option<PathBuf>,
    pub result_display_mode: DisplayMode,
    pub max_output_tokens: u64,
    pub log_level: LogLevel,
    pub multi_session: bool,
    pub max_sessions: usize,
    pub session_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            force_port: false,
            stata_path: None,
            stata_edition: StataEdition::Mp,
            log_file: None,
            log_file_location: LogFileLocation::Extension,
            custom_log_directory: None,
            workspace_root: None,
            result_display_mode: DisplayMode::Compact,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            log_level: LogLevel::Info,
            multi_session: true,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
        }
    }
}

impl ServerConfig {
    /// Root for everything the server writes on its own behalf: session
    /// logs, exported graphs, spill files.
    pub fn data_dir(&self) -> PathBuf {
        match &self.workspace_root {
            Some(root) if !root.as_os_str().is_empty() => root.join(".stata-mcp"),
            _ => std::env::temp_dir().join("stata-mcp"),
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn graphs_dir(&self) -> PathBuf {
        self.data_dir().join("graphs")
    }

    pub fn session_graphs_dir(&self, session_id: &str) -> PathBuf {
        self.graphs_dir().join(session_id)
    }

    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.logs_dir().join(format!("session_{session_id}.log"))
    }

    pub fn server_log_path(&self) -> PathBuf {
        match &self.log_file {
            Some(path) if !path.as_os_str().is_empty() => path.clone(),
            _ => self.data_dir().join("stata_mcp_server.log"),
        }
    }

    /// Log destination for a `run_file` request, honoring the
    /// `--log-file-location` policy. The session id is baked into the
    /// filename so parallel sessions running the same do-file never
    /// contend for one log.
    pub fn run_log_path(&self, do_file: &Path, session_id: &str) -> PathBuf {
        let base = do_file
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "do".to_string());
        let file_name = format!("{base}_{session_id}_mcp.log");
        let do_file_dir = do_file
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let dir = match self.log_file_location {
            LogFileLocation::DoFile => do_file_dir,
            LogFileLocation::Parent => do_file_dir
                .parent()
                .filter(|dir| dir.is_dir())
                .map(Path::to_path_buf)
                .unwrap_or(do_file_dir),
            LogFileLocation::Workspace => match &self.workspace_root {
                Some(root) if root.is_dir() => root.clone(),
                _ => do_file_dir,
            },
            LogFileLocation::Extension => self.logs_dir(),
            LogFileLocation::Custom => match &self.custom_log_directory {
                Some(dir) if dir.is_dir() => dir.clone(),
                _ => do_file_dir,
            },
        };
        dir.join(file_name)
    }

    /// Resolve the Stata console binary. An explicit `--stata-path` may
    /// point at the binary itself or at an installation directory;
    /// otherwise the usual install locations are probed.
    pub fn stata_binary(&self) -> Option<PathBuf> {
        if let Some(path) = &self.stata_path {
            if path.is_file() {
                return Some(path.clone());
            }
            for name in self.stata_edition.binary_candidates() {
                let candidate = path.join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
            return None;
        }

        for root in default_install_roots() {
            for name in self.stata_edition.binary_candidates() {
                let candidate = root.join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

fn default_install_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(env_root) = std::env::var("SYSDIR_STATA")
        && !env_root.trim().is_empty()
    {
        roots.push(PathBuf::from(env_root));
    }
    if cfg!(target_os = "macos") {
        roots.push(PathBuf::from("/Applications/Stata/StataMP.app/Contents/MacOS"));
        roots.push(PathBuf::from("/Applications/Stata/StataSE.app/Contents/MacOS"));
        roots.push(PathBuf::from("/Applications/Stata/StataBE.app/Contents/MacOS"));
        roots.push(PathBuf::from("/Applications/Stata"));
    } else {
        for version in (14..=19).rev() {
            roots.push(PathBuf::from(format!("/usr/local/stata{version}")));
        }
        roots.push(PathBuf::from("/usr/local/stata"));
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edition_parse_accepts_known_values() {
        assert_eq!(StataEdition::parse("mp"), Ok(StataEdition::Mp));
        assert_eq!(StataEdition::parse("SE"), Ok(StataEdition::Se));
        assert_eq!(StataEdition::parse(" be "), Ok(StataEdition::Be));
        assert!(StataEdition::parse("ic").is_err());
    }

    #[test]
    fn log_level_parse_accepts_warning_alias() {
        assert_eq!(LogLevel::parse("WARNING"), Ok(LogLevel::Warn));
        assert_eq!(LogLevel::parse("debug"), Ok(LogLevel::Debug));
        assert!(LogLevel::parse("TRACE").is_err());
    }

    #[test]
    fn run_log_path_dofile_policy_uses_do_file_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let do_file = temp.path().join("analysis.do");
        let config = ServerConfig {
            log_file_location: LogFileLocation::DoFile,
            ..ServerConfig::default()
        };
        let log = config.run_log_path(&do_file, "default");
        assert_eq!(log, temp.path().join("analysis_default_mcp.log"));
    }

    #[test]
    fn run_log_path_workspace_policy_falls_back_without_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let do_file = temp.path().join("analysis.do");
        let config = ServerConfig {
            log_file_location: LogFileLocation::Workspace,
            workspace_root: None,
            ..ServerConfig::default()
        };
        let log = config.run_log_path(&do_file, "abc");
        assert_eq!(log, temp.path().join("analysis_abc_mcp.log"));
    }

    #[test]
    fn run_log_path_custom_policy_uses_custom_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let custom = tempfile::tempdir().expect("tempdir");
        let do_file = temp.path().join("model.do");
        let config = ServerConfig {
            log_file_location: LogFileLocation::Custom,
            custom_log_directory: Some(custom.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let log = config.run_log_path(&do_file, "s1");
        assert_eq!(log, custom.path().join("model_s1_mcp.log"));
    }

    #[test]
    fn session_log_path_includes_session_id() {
        let config = ServerConfig::default();
        let log = config.session_log_path("01hq");
        assert!(log.ends_with("logs/session_01hq.log"));
    }

    #[test]
    fn explicit_stata_path_without_binary_resolves_to_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = ServerConfig {
            stata_path: Some(temp.path().to_path_buf()),
            ..ServerConfig::default()
        };
        assert_eq!(config.stata_binary(), None);
    }
}
