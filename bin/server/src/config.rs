//! Centralized server configuration.
//!
//! Strongly-typed configuration loaded via the `config` crate from
//! `MAXQ_*` environment variables, with per-field defaults.

use maxq_engine::controller::ControllerConfig;
use maxq_engine::scheduler::SchedulerConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP port for the HTTP listener.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding the SQLite database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory holding flow definitions.
    #[serde(default = "default_flows_root")]
    pub flows_root: PathBuf,

    /// Global cap on concurrently running steps.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: i64,

    /// Per-stream stdout/stderr capture limit in bytes.
    #[serde(default = "default_max_log_capture")]
    pub max_log_capture: usize,

    /// Scheduler polling period in milliseconds.
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,

    /// Maximum claim candidates per scheduler tick.
    #[serde(default = "default_scheduler_batch_size")]
    pub scheduler_batch_size: i64,

    /// Grace between SIGTERM and SIGKILL on abort, in milliseconds.
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,

    /// Grace between SIGTERM and SIGKILL on pause, in milliseconds.
    #[serde(default = "default_pause_grace_ms")]
    pub pause_grace_ms: u64,

    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    5003
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_flows_root() -> PathBuf {
    PathBuf::from("./flows")
}

fn default_max_concurrent_steps() -> i64 {
    10
}

fn default_max_log_capture() -> usize {
    8192
}

fn default_scheduler_interval_ms() -> u64 {
    200
}

fn default_scheduler_batch_size() -> i64 {
    10
}

fn default_abort_grace_ms() -> u64 {
    5000
}

fn default_pause_grace_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
            flows_root: default_flows_root(),
            max_concurrent_steps: default_max_concurrent_steps(),
            max_log_capture: default_max_log_capture(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
            scheduler_batch_size: default_scheduler_batch_size(),
            abort_grace_ms: default_abort_grace_ms(),
            pause_grace_ms: default_pause_grace_ms(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `MAXQ_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("MAXQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Base URL advertised to children via `MAXQ_API`.
    #[must_use]
    pub fn api_base(&self) -> String {
        format!("http://127.0.0.1:{}/api/v1", self.port)
    }

    /// Scheduler view of this configuration.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_millis(self.scheduler_interval_ms),
            batch_size: self.scheduler_batch_size,
            max_concurrent_steps: self.max_concurrent_steps,
            max_capture_bytes: self.max_log_capture,
            flows_root: self.flows_root.clone(),
            api_base: self.api_base(),
        }
    }

    /// Controller view of this configuration.
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            flows_root: self.flows_root.clone(),
            abort_grace: Duration::from_millis(self.abort_grace_ms),
            pause_grace: Duration::from_millis(self.pause_grace_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_has_documented_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5003);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.flows_root, PathBuf::from("./flows"));
        assert_eq!(config.max_concurrent_steps, 10);
        assert_eq!(config.max_log_capture, 8192);
        assert_eq!(config.scheduler_interval_ms, 200);
        assert_eq!(config.scheduler_batch_size, 10);
        assert_eq!(config.abort_grace_ms, 5000);
        assert_eq!(config.pause_grace_ms, 5000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn api_base_includes_the_port() {
        let config = ServerConfig {
            port: 6100,
            ..ServerConfig::default()
        };
        assert_eq!(config.api_base(), "http://127.0.0.1:6100/api/v1");
    }
}
