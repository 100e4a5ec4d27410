use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::SupervisorError;

pub const DEFAULT_MAX_LOG_LINES: usize = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RUNTIME_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_CONSOLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_COMMAND: &str = "stop";
pub const DEFAULT_WHITELIST_FILE: &str = "mc_server_web.txt";
pub const DEFAULT_LOG_FILE: &str = "logs/latest.log";
pub const DEFAULT_RUNTIME_MARKERS: &[&str] = &["java"];

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_millis(name: &str, min: u64, max: u64) -> Option<Duration> {
    env_u64(name).map(|v| Duration::from_millis(v.clamp(min, max)))
}

/// Comma-separated list, entries trimmed, blanks dropped.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Expand a leading `~` and any `$VAR` / `${VAR}` references.
/// Unknown variables are left as written.
pub fn expand_path(raw: &str) -> PathBuf {
    expand_with(raw, |k| std::env::var(k).ok())
}

fn expand_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    if rest == "~" || rest.starts_with("~/") {
        if let Some(home) = lookup("HOME").or_else(|| lookup("USERPROFILE")) {
            out.push_str(&home);
            rest = &rest[1..];
        }
    }

    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match (name.is_empty(), lookup(name)) {
            (false, Some(value)) => out.push_str(&value),
            _ => out.push_str(&rest[idx..idx + 1 + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    PathBuf::from(out)
}

/// Knobs for the supervision engine.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Roots whose immediate subdirectories are server instances.
    pub server_folders: Vec<PathBuf>,
    /// Candidate startup script names, tried in order.
    pub startup_scripts: Vec<String>,
    pub max_log_lines: usize,
    pub poll_interval: Duration,
    /// How long a server gets to exit after the stop command.
    pub stop_timeout: Duration,
    /// Extra time a runtime-marker child gets to save before it is killed.
    pub runtime_grace: Duration,
    pub runtime_markers: Vec<String>,
    /// Upper bound on writing an admin command to a server's console.
    pub console_timeout: Duration,
    pub stop_command: String,
    pub whitelist_file: String,
    /// Log file location relative to an instance folder.
    pub log_file: PathBuf,
}

impl SupervisorConfig {
    pub fn new(server_folders: Vec<PathBuf>, startup_scripts: Vec<String>) -> Self {
        Self {
            server_folders,
            startup_scripts,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            runtime_grace: DEFAULT_RUNTIME_GRACE,
            runtime_markers: DEFAULT_RUNTIME_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            console_timeout: DEFAULT_CONSOLE_TIMEOUT,
            stop_command: DEFAULT_STOP_COMMAND.to_string(),
            whitelist_file: DEFAULT_WHITELIST_FILE.to_string(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }

    /// Build from `MCWEB_*` environment variables. Folders and scripts are
    /// required; everything else falls back to defaults.
    pub fn from_env() -> Result<Self, SupervisorError> {
        let folders = env_string("MCWEB_FOLDERS").ok_or_else(|| {
            SupervisorError::ConfigInvalid("MCWEB_FOLDERS is required".to_string())
        })?;
        let scripts = env_string("MCWEB_SCRIPTS").ok_or_else(|| {
            SupervisorError::ConfigInvalid("MCWEB_SCRIPTS is required".to_string())
        })?;

        let mut cfg = Self::new(
            split_list(&folders).iter().map(|f| expand_path(f)).collect(),
            split_list(&scripts),
        );

        if let Some(v) = env_usize("MCWEB_MAX_LOG_LINES") {
            cfg.max_log_lines = v.clamp(1, 10_000);
        }
        if let Some(v) = env_millis("MCWEB_POLL_INTERVAL_MS", 100, 60_000) {
            cfg.poll_interval = v;
        }
        if let Some(v) = env_millis("MCWEB_STOP_TIMEOUT_MS", 100, 10 * 60 * 1000) {
            cfg.stop_timeout = v;
        }
        if let Some(v) = env_millis("MCWEB_RUNTIME_GRACE_MS", 0, 10 * 60 * 1000) {
            cfg.runtime_grace = v;
        }
        if let Some(v) = env_millis("MCWEB_CONSOLE_TIMEOUT_MS", 100, 60_000) {
            cfg.console_timeout = v;
        }
        if let Some(v) = env_string("MCWEB_RUNTIME_MARKERS") {
            cfg.runtime_markers = split_list(&v);
        }
        if let Some(v) = env_string("MCWEB_STOP_COMMAND") {
            cfg.stop_command = v;
        }
        if let Some(v) = env_string("MCWEB_WHITELIST_FILE") {
            cfg.whitelist_file = v;
        }
        if let Some(v) = env_string("MCWEB_LOG_FILE") {
            cfg.log_file = PathBuf::from(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        let invalid = |msg: String| Err(SupervisorError::ConfigInvalid(msg));

        if self.server_folders.is_empty() {
            return invalid("no server folders configured".to_string());
        }
        for folder in &self.server_folders {
            if !folder.is_dir() {
                return invalid(format!("server folder {} does not exist", folder.display()));
            }
        }
        if self.startup_scripts.is_empty() {
            return invalid("no startup script names configured".to_string());
        }
        for name in &self.startup_scripts {
            if !is_plain_file_name(name) {
                return invalid(format!("startup script name {name:?} must be a bare file name"));
            }
        }
        if !is_plain_file_name(&self.whitelist_file) {
            return invalid(format!(
                "whitelist file name {:?} must be a bare file name",
                self.whitelist_file
            ));
        }
        if self.log_file.is_absolute() {
            return invalid("log file path must be relative to the server folder".to_string());
        }
        if self.max_log_lines == 0 {
            return invalid("max log lines must be at least 1".to_string());
        }
        if self.stop_command.trim().is_empty() {
            return invalid("stop command must not be empty".to_string());
        }
        Ok(())
    }

    pub fn log_path(&self, folder: &Path) -> PathBuf {
        folder.join(&self.log_file)
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}
