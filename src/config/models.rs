//! Configuration data structures.
//!
//! These types deserialize from TOML / JSON / YAML files and from `QUIESCE_*`
//! environment variables. Every field has a default so an empty environment
//! yields a runnable configuration.
use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::core::shutdown::DEFAULT_HANG_REPORT_INTERVAL;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_hang_report_interval() -> Duration {
    DEFAULT_HANG_REPORT_INTERVAL
}

/// Output format of the log subscriber
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// What to do when the transport reports a state change outside the lifecycle graph
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvalidTransitionPolicy {
    /// Log the violation and abort the process.
    #[default]
    Abort,
    /// Log the violation and keep serving.
    Log,
}

/// Shutdown behaviour
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Delay before, and between, reports listing connections that hold up shutdown.
    #[serde(
        default = "default_hang_report_interval",
        with = "humantime_serde"
    )]
    pub hang_report_interval: Duration,
    /// Flip readiness back to `false` before draining. Off by default: the
    /// probe keeps reporting ready for the whole drain.
    #[serde(default)]
    pub unready_on_shutdown: bool,
    #[serde(default)]
    pub invalid_transition_policy: InvalidTransitionPolicy,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            hang_report_interval: default_hang_report_interval(),
            unready_on_shutdown: false,
            invalid_transition_policy: InvalidTransitionPolicy::default(),
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// IP address to bind. An empty string selects a loopback address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind; 0 asks the OS for an ephemeral port.
    #[serde(default)]
    pub port: u16,
    /// Free-form text appended to the `/home` document.
    #[serde(default)]
    pub about: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            about: String::new(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl AppConfig {
    /// Configuration bound to `127.0.0.1` on an ephemeral port.
    pub fn loopback() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ..Self::default()
        }
    }
}

impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string_pretty(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}
