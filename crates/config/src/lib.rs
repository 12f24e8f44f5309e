//! Runtime configuration for the Deepnest agent runtime.
//!
//! All knobs carry serde defaults so a partial config file (or an empty
//! one) deserializes into something usable, and every knob can be
//! overridden through a `DEEPNEST_*` environment variable. Validation runs
//! at agent construction, not lazily at first use.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tunable limits and timeouts for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Maximum tool handlers running concurrently within one batch.
    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,

    /// Maximum reason-act steps per turn before the driver gives up.
    #[serde(default = "default_max_steps_per_turn")]
    pub max_steps_per_turn: usize,

    /// Retries for transient model errors, on top of the first attempt.
    #[serde(default = "default_model_request_retries")]
    pub model_request_retries: usize,

    /// Per model request deadline.
    #[serde(default = "default_model_request_timeout_ms")]
    pub model_request_timeout_ms: u64,

    /// Per tool handler deadline.
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,

    /// End-to-end turn deadline.
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,

    /// Where the file session store keeps its records.
    #[serde(default = "default_session_storage_dir")]
    pub session_storage_dir: PathBuf,

    /// Skip the consent hook entirely.
    #[serde(default)]
    pub bypass_tool_consent: bool,

    /// Optional floor between model requests, enforced per client instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_time_between_calls_ms: Option<u64>,
}

fn default_max_parallel_tools() -> usize {
    4
}
fn default_max_steps_per_turn() -> usize {
    50
}
fn default_model_request_retries() -> usize {
    3
}
fn default_model_request_timeout_ms() -> u64 {
    60_000
}
fn default_tool_timeout_ms() -> u64 {
    30_000
}
fn default_turn_timeout_ms() -> u64 {
    300_000
}
fn default_session_storage_dir() -> PathBuf {
    PathBuf::from("./deepnest_sessions")
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        // serde's field defaults are the single source of truth.
        serde_json::from_value(serde_json::json!({}))
            .unwrap_or_else(|_| unreachable!("empty options object always deserializes"))
    }
}

impl RuntimeOptions {
    /// Apply `DEEPNEST_*` environment overrides on top of `self`.
    ///
    /// Unparseable values are skipped with a warning rather than failing
    /// startup.
    pub fn with_env_overrides(mut self) -> Self {
        override_usize("DEEPNEST_MAX_PARALLEL_TOOLS", &mut self.max_parallel_tools);
        override_usize("DEEPNEST_MAX_STEPS_PER_TURN", &mut self.max_steps_per_turn);
        override_usize(
            "DEEPNEST_MODEL_REQUEST_RETRIES",
            &mut self.model_request_retries,
        );
        override_u64(
            "DEEPNEST_MODEL_REQUEST_TIMEOUT_MS",
            &mut self.model_request_timeout_ms,
        );
        override_u64("DEEPNEST_TOOL_TIMEOUT_MS", &mut self.tool_timeout_ms);
        override_u64("DEEPNEST_TURN_TIMEOUT_MS", &mut self.turn_timeout_ms);

        if let Ok(dir) = std::env::var("DEEPNEST_SESSION_STORAGE_DIR") {
            self.session_storage_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var("DEEPNEST_BYPASS_TOOL_CONSENT") {
            match raw.parse::<bool>() {
                Ok(v) => self.bypass_tool_consent = v,
                Err(_) => warn!(value = %raw, "Ignoring unparseable DEEPNEST_BYPASS_TOOL_CONSENT"),
            }
        }
        if let Ok(raw) = std::env::var("DEEPNEST_MIN_TIME_BETWEEN_CALLS_MS") {
            match raw.parse::<u64>() {
                Ok(v) => self.min_time_between_calls_ms = Some(v),
                Err(_) => {
                    warn!(value = %raw, "Ignoring unparseable DEEPNEST_MIN_TIME_BETWEEN_CALLS_MS")
                }
            }
        }

        self
    }

    /// Reject configurations that cannot drive a turn at all.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_parallel_tools == 0 {
            return Err("max_parallel_tools must be at least 1".into());
        }
        if self.max_steps_per_turn == 0 {
            return Err("max_steps_per_turn must be at least 1".into());
        }
        if self.turn_timeout_ms < self.tool_timeout_ms {
            return Err("turn_timeout_ms must not be smaller than tool_timeout_ms".into());
        }
        Ok(())
    }

    pub fn model_request_timeout(&self) -> Duration {
        Duration::from_millis(self.model_request_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn min_time_between_calls(&self) -> Option<Duration> {
        self.min_time_between_calls_ms.map(Duration::from_millis)
    }
}

fn override_usize(var: &str, slot: &mut usize) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(value = %raw, var, "Ignoring unparseable environment override"),
        }
    }
}

fn override_u64(var: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!(value = %raw, var, "Ignoring unparseable environment override"),
        }
    }
}
