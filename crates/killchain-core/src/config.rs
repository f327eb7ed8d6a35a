use crate::error::{KillchainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix of the per-position enable overrides (`ENABLEKC1`, `ENABLEKC2`, ...).
pub const ENABLE_PREFIX: &str = "ENABLEKC";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ControlPlaneConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Attempts per REST call before the run is aborted.
    #[serde(default = "default_rest_retries")]
    pub rest_retries: u32,
    #[serde(default = "default_two_seconds")]
    pub rest_retry_delay_secs: f64,
    #[serde(default = "default_two_seconds")]
    pub probe_interval_secs: f64,
}

fn default_url() -> String {
    "http://localhost:8888".to_string()
}

fn default_rest_retries() -> u32 {
    60
}

fn default_two_seconds() -> f64 {
    2.0
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: None,
            rest_retries: default_rest_retries(),
            rest_retry_delay_secs: default_two_seconds(),
            probe_interval_secs: default_two_seconds(),
        }
    }
}

impl ControlPlaneConfig {
    /// Base URL without trailing slashes.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub fn rest_retry_delay(&self) -> Duration {
        secs(self.rest_retry_delay_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        secs(self.probe_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// AdversaryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdversaryConfig {
    /// Comma-separated list, each item `Name`, `Name@Group` or `Name:Group`.
    #[serde(default)]
    pub list: String,
    #[serde(default = "default_group")]
    pub default_group: String,
    /// Used alone when `list` yields no items.
    #[serde(default = "default_fallback")]
    pub fallback: String,
    /// Raw per-position overrides, keyed by 1-based position.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enable: BTreeMap<usize, String>,
}

fn default_group() -> String {
    "cluster".to_string()
}

fn default_fallback() -> String {
    "KC0 - Test".to_string()
}

impl Default for AdversaryConfig {
    fn default() -> Self {
        Self {
            list: String::new(),
            default_group: default_group(),
            fallback: default_fallback(),
            enable: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    #[serde(default = "default_planner")]
    pub planner: String,
    #[serde(default = "default_true")]
    pub autonomous: bool,
    #[serde(default = "default_true")]
    pub auto_close: bool,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,
    /// Dedup window: a running operation younger than this is reused.
    #[serde(default = "default_recent_window")]
    pub recent_window_min: u64,
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,
    #[serde(default = "default_two_seconds")]
    pub resolve_interval_secs: f64,
}

fn default_planner() -> String {
    "batch".to_string()
}

fn default_true() -> bool {
    true
}

fn default_name_prefix() -> String {
    "kc-auto-op".to_string()
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_poll_interval() -> f64 {
    3.0
}

fn default_recent_window() -> u64 {
    5
}

fn default_resolve_attempts() -> u32 {
    120
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            planner: default_planner(),
            autonomous: true,
            auto_close: true,
            name_prefix: default_name_prefix(),
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval(),
            recent_window_min: default_recent_window(),
            resolve_attempts: default_resolve_attempts(),
            resolve_interval_secs: default_two_seconds(),
        }
    }
}

impl OperationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }

    pub fn recent_window(&self) -> Duration {
        Duration::from_secs(self.recent_window_min.saturating_mul(60))
    }

    pub fn resolve_interval(&self) -> Duration {
        secs(self.resolve_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// SequenceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    #[serde(default = "default_two_seconds")]
    pub delay_between_secs: f64,
    #[serde(default = "default_true")]
    pub stop_on_fail: bool,
    #[serde(default = "default_true")]
    pub require_agent: bool,
    /// Keep the process alive after the summary until a termination signal.
    #[serde(default = "default_true")]
    pub hold_after_run: bool,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            delay_between_secs: default_two_seconds(),
            stop_on_fail: true,
            require_agent: true,
            hold_after_run: true,
        }
    }
}

impl SequenceConfig {
    pub fn delay_between(&self) -> Duration {
        secs(self.delay_between_secs)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub adversaries: AdversaryConfig,
    #[serde(default)]
    pub operation: OperationConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Overlay environment variables on top of the current values.
    ///
    /// Takes the variables as an iterator so callers can pass
    /// `std::env::vars()` or a fixed map in tests. Empty values are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, raw) = (key.as_ref(), value.as_ref());

            if let Some(pos) = key.strip_prefix(ENABLE_PREFIX) {
                // ENABLEKC<N> is kept even when empty; the resolver decides.
                if let Ok(pos) = pos.parse::<usize>() {
                    if pos > 0 {
                        self.adversaries.enable.insert(pos, raw.to_string());
                    }
                }
                continue;
            }

            let value = raw.trim();
            if value.is_empty() {
                continue;
            }
            match key {
                "CALDERA_URL" => self.control_plane.url = value.to_string(),
                "CALDERA_KEY" => self.control_plane.api_key = Some(value.to_string()),
                "REST_RETRIES" => self.control_plane.rest_retries = parse_num(key, value)?,
                "REST_RETRY_DELAY" => {
                    self.control_plane.rest_retry_delay_secs = parse_num(key, value)?
                }
                "PROBE_INTERVAL" => self.control_plane.probe_interval_secs = parse_num(key, value)?,
                "GROUP" => self.adversaries.default_group = value.to_string(),
                "ADV_LIST" => self.adversaries.list = value.to_string(),
                "ADV_NAME" => self.adversaries.fallback = value.to_string(),
                "PLANNER" => self.operation.planner = value.to_string(),
                "AUTONOMOUS" => self.operation.autonomous = parse_flag(key, value)?,
                "AUTO_CLOSE" => self.operation.auto_close = parse_flag(key, value)?,
                "OP_NAME_PREFIX" => self.operation.name_prefix = value.to_string(),
                "OP_TIMEOUT" => self.operation.timeout_secs = parse_num(key, value)?,
                "POLL_INTERVAL" => self.operation.poll_interval_secs = parse_num(key, value)?,
                "RECENT_WINDOW_MIN" => self.operation.recent_window_min = parse_num(key, value)?,
                "RESOLVE_ATTEMPTS" => self.operation.resolve_attempts = parse_num(key, value)?,
                "RESOLVE_INTERVAL" => {
                    self.operation.resolve_interval_secs = parse_num(key, value)?
                }
                "DELAY_BETWEEN" => self.sequence.delay_between_secs = parse_num(key, value)?,
                "STOP_ON_FAIL" => self.sequence.stop_on_fail = parse_flag(key, value)?,
                "REQUIRE_AGENT" => self.sequence.require_agent = parse_flag(key, value)?,
                "HOLD_AFTER_RUN" => self.sequence.hold_after_run = parse_flag(key, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if !self.control_plane.url.starts_with("http://")
            && !self.control_plane.url.starts_with("https://")
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "control plane url '{}' must start with http:// or https://",
                    self.control_plane.url
                ),
            });
        }

        if self.control_plane.rest_retries == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "rest_retries=0 means no REST call can ever succeed".to_string(),
            });
        }

        if self.operation.timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "operation timeout is 0s; every operation will time out".to_string(),
            });
        }

        if self.operation.poll_interval_secs <= 0.0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "poll interval <= 0 turns polling into a busy loop".to_string(),
            });
        }

        if self.adversaries.list.split(',').all(|t| t.trim().is_empty()) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "adversary list is empty; falling back to '{}'",
                    self.adversaries.fallback
                ),
            });
        }

        if self.operation.recent_window_min == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "recent_window_min=0 disables operation dedup".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn secs(s: f64) -> Duration {
    Duration::try_from_secs_f64(s).unwrap_or(Duration::ZERO)
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| KillchainError::Config(format!("{key}='{value}' is not a valid number")))
}

/// Parse a boolean setting. Accepts `1/true/yes/on` and `0/false/no/off`.
pub fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(KillchainError::Config(format!(
            "{key}='{other}' is not a boolean"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
