use specta::Type;

const MAX_MESSAGE_BYTES: usize = 2 * 1024;
const MAX_HINT_BYTES: usize = 512;
const TRUNCATION_MARK: &str = " [...]";

/// Every way a supervisor operation can fail.
///
/// Everything except `ConfigInvalid` is a per-request outcome that the caller
/// turns into a response; `ConfigInvalid` only comes out of startup.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Unknown name, unsafe name, or a server the requester may not see.
    /// All three look the same from outside.
    #[error("server not found")]
    NotFound,

    #[error("server {0} is already running")]
    AlreadyRunning(String),

    #[error("server {0} is not running")]
    NotRunning(String),

    /// The server stopped draining its console before the command fit in.
    #[error("server {0} is not reading console input")]
    ConsoleUnresponsive(String),

    #[error("server {0} does not contain a startup script")]
    NoStartupScript(String),

    #[error("failed to start server {name}: {reason}")]
    StartFailed { name: String, reason: String },

    /// Soft failure: the forced shutdown path is already running.
    #[error("server {0} failed to fully shut down in time")]
    StopTimeout(String),

    #[error("not authorized")]
    Unauthorized,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::NotFound => "not_found",
            SupervisorError::AlreadyRunning(_) => "already_running",
            SupervisorError::NotRunning(_) => "not_running",
            SupervisorError::ConsoleUnresponsive(_) => "console_unresponsive",
            SupervisorError::NoStartupScript(_) => "no_startup_script",
            SupervisorError::StartFailed { .. } => "start_failed",
            SupervisorError::StopTimeout(_) => "stop_timeout",
            SupervisorError::Unauthorized => "unauthorized",
            SupervisorError::ConfigInvalid(_) => "config_invalid",
        }
    }

    /// The end state was (or will be) reached anyway.
    pub fn is_soft(&self) -> bool {
        matches!(self, SupervisorError::StopTimeout(_))
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SupervisorError::StopTimeout(_) => {
                Some("the server is being force-stopped; it is likely down, confirm independently")
            }
            SupervisorError::ConsoleUnresponsive(_) => {
                Some("the server may be hung; stopping it force-kills it if it doesn't respond")
            }
            SupervisorError::NoStartupScript(_) => {
                Some("add one of the configured startup scripts to the server folder")
            }
            _ => None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: truncate_utf8(&self.to_string(), MAX_MESSAGE_BYTES),
            hint: self.hint().map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
        }
    }
}

/// Structured form of an error handed back across the request boundary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Cut `s` down to `max_bytes` on a char boundary, marking the cut.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let budget = max_bytes.saturating_sub(TRUNCATION_MARK.len());
    let end = (0..=budget)
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0);
    format!("{}{TRUNCATION_MARK}", &s[..end])
}
