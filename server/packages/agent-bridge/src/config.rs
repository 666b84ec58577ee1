use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::WireFormat;

pub const ENV_CLAUDE_BIN: &str = "AGENT_BRIDGE_CLAUDE_BIN";
pub const ENV_WORKING_DIR: &str = "AGENT_BRIDGE_WORKING_DIR";
pub const ENV_HEARTBEAT_SECS: &str = "AGENT_BRIDGE_HEARTBEAT_SECS";
pub const ENV_KILL_GRACE_MS: &str = "AGENT_BRIDGE_KILL_GRACE_MS";
pub const ENV_WIRE_FORMAT: &str = "AGENT_BRIDGE_WIRE_FORMAT";

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_HEARTBEAT_TICK: Duration = Duration::from_secs(1);
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Stderr fragments that mean the agent cannot make progress.
const DEFAULT_FATAL_STDERR_PATTERNS: &[&str] = &[
    "Invalid API key",
    "Please run /login",
    "OAuth token has expired",
    "Credit balance is too low",
    "No conversation found with session ID",
];

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub claude_bin: PathBuf,
    /// Working directory used when a request does not name one.
    pub default_working_dir: Option<PathBuf>,
    pub heartbeat_interval: Duration,
    pub heartbeat_tick: Duration,
    /// Time between SIGTERM and SIGKILL during teardown.
    pub kill_grace: Duration,
    pub include_partial_messages: bool,
    pub wire_format: WireFormat,
    pub fatal_stderr_patterns: Vec<String>,
    pub channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            claude_bin: PathBuf::from("claude"),
            default_working_dir: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_tick: DEFAULT_HEARTBEAT_TICK,
            kill_grace: DEFAULT_KILL_GRACE,
            include_partial_messages: true,
            wire_format: WireFormat::Hybrid,
            fatal_stderr_patterns: DEFAULT_FATAL_STDERR_PATTERNS
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl BridgeConfig {
    /// Defaults overlaid with `AGENT_BRIDGE_*` environment variables. Values
    /// that fail to parse are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(bin) = value(ENV_CLAUDE_BIN) {
            config.claude_bin = PathBuf::from(bin);
        }
        if let Some(dir) = value(ENV_WORKING_DIR) {
            config.default_working_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = value(ENV_HEARTBEAT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_interval = Duration::from_secs(secs),
                _ => tracing::warn!(key = ENV_HEARTBEAT_SECS, value = %raw, "ignoring invalid value"),
            }
        }
        if let Some(raw) = value(ENV_KILL_GRACE_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.kill_grace = Duration::from_millis(ms),
                Err(_) => tracing::warn!(key = ENV_KILL_GRACE_MS, value = %raw, "ignoring invalid value"),
            }
        }
        if let Some(raw) = value(ENV_WIRE_FORMAT) {
            match raw.parse::<WireFormat>() {
                Ok(format) => config.wire_format = format,
                Err(err) => tracing::warn!(key = ENV_WIRE_FORMAT, error = %err, "ignoring invalid value"),
            }
        }
        config
    }

    pub fn is_fatal_stderr(&self, line: &str) -> bool {
        self.fatal_stderr_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && line.contains(pattern.as_str()))
    }
}
