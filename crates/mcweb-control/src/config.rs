use std::path::PathBuf;

use mcweb_core::{SupervisorConfig, SupervisorError, config::expand_path};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_USER_IDS: &str = "user_ids.txt";
pub const DEFAULT_DATASTORE: &str = "datastore.json";

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(|v| expand_path(&v))
        .unwrap_or_else(|| PathBuf::from(default))
}

/// Everything the control process reads at startup.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub port: u16,
    pub user_ids: PathBuf,
    pub datastore: PathBuf,
    pub supervisor: SupervisorConfig,
}

impl ControlConfig {
    pub fn from_env() -> Result<Self, SupervisorError> {
        let port = match std::env::var("MCWEB_PORT") {
            Ok(raw) => parse_port(&raw)?,
            Err(_) => DEFAULT_PORT,
        };
        Ok(Self {
            port,
            user_ids: env_path("MCWEB_USER_IDS", DEFAULT_USER_IDS),
            datastore: env_path("MCWEB_DATASTORE", DEFAULT_DATASTORE),
            supervisor: SupervisorConfig::from_env()?,
        })
    }
}

pub fn parse_port(raw: &str) -> Result<u16, SupervisorError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(SupervisorError::ConfigInvalid(format!(
            "MCWEB_PORT must be a port number, got {raw:?}"
        ))),
    }
}
