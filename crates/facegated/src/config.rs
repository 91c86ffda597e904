use facegate_core::{ConfigError, GateConfig};
use std::time::Duration;

/// Daemon configuration: the gate settings plus service-boundary knobs.
pub struct Config {
    pub gate: GateConfig,
    /// Upper bound on a single enroll/recognize/verify request.
    pub request_timeout: Duration,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
    /// Write annotated probes and reports for every Recognize call.
    pub save_results: bool,
}

impl Config {
    /// Load the gate config (`FACEGATE_CONFIG` + `FACEGATE_*`) and daemon settings.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            gate: GateConfig::load(None)?,
            request_timeout: Duration::from_secs(env_u64("FACEGATE_REQUEST_TIMEOUT_SECS", 30)),
            session_bus: env_bool("FACEGATE_SESSION_BUS", false),
            save_results: env_bool("FACEGATE_SAVE_RESULTS", true),
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
