//! Harness configuration
//!
//! Defaults can be overridden through `HARNESS_*` environment variables
//! (optionally from a `.env` file) and then by command line arguments.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use shared::{SharedError, SharedResult};

use crate::monitor::MonitorSettings;

pub const ENV_PREFIX: &str = "HARNESS_";

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub poll_interval: Duration,
    pub watchdog_budget: Duration,
    /// Root allowance for a whole scenario
    pub scenario_budget: Duration,
    pub ssh_port_start: u16,
    pub ssh_port_end: u16,
    pub ready_states: Vec<String>,
    pub shutdown_timeout: Duration,
    /// Default timeout for event waits in scenarios
    pub wait_timeout: Duration,
    pub session_timeout: Duration,
    pub diagnostics_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            watchdog_budget: Duration::from_secs(10),
            scenario_budget: Duration::from_secs(120),
            ssh_port_start: 20000,
            ssh_port_end: 30000,
            ready_states: vec!["running".to_string()],
            shutdown_timeout: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(30),
            diagnostics_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::default()
    }

    /// Load `.env` if present, then apply `HARNESS_*` overrides to the defaults
    pub fn from_env() -> SharedResult<Self> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup, e.g. a map in tests
    pub fn from_lookup<F>(lookup: F) -> SharedResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(value) = get("POLL_INTERVAL_MS") {
            config.poll_interval = millis("POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = get("WATCHDOG_BUDGET_MS") {
            config.watchdog_budget = millis("WATCHDOG_BUDGET_MS", &value)?;
        }
        if let Some(value) = get("SCENARIO_BUDGET_SECS") {
            config.scenario_budget = Duration::from_secs(parse("SCENARIO_BUDGET_SECS", &value)?);
        }
        if let Some(value) = get("SSH_PORT_START") {
            config.ssh_port_start = parse("SSH_PORT_START", &value)?;
        }
        if let Some(value) = get("SSH_PORT_END") {
            config.ssh_port_end = parse("SSH_PORT_END", &value)?;
        }
        if let Some(value) = get("READY_STATES") {
            config.ready_states = value
                .split(',')
                .map(str::trim)
                .filter(|state| !state.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = get("SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout = millis("SHUTDOWN_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("WAIT_TIMEOUT_MS") {
            config.wait_timeout = millis("WAIT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("SESSION_TIMEOUT_MS") {
            config.session_timeout = millis("SESSION_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("DIAGNOSTICS_PATH") {
            config.diagnostics_path = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        if let Some(value) = get("LOG_LEVEL") {
            config.log_level = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SharedResult<()> {
        if self.ssh_port_start > self.ssh_port_end {
            return Err(invalid(
                "ssh_port_range",
                format!("{}-{}", self.ssh_port_start, self.ssh_port_end),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "0"));
        }
        if self.ready_states.is_empty() {
            return Err(invalid("ready_states", ""));
        }
        Ok(())
    }

    pub fn ssh_port_range(&self) -> RangeInclusive<u16> {
        self.ssh_port_start..=self.ssh_port_end
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: self.poll_interval,
            watchdog_budget: self.watchdog_budget,
            ready_states: self.ready_states.clone(),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

fn invalid(field: &str, value: impl Into<String>) -> SharedError {
    SharedError::InvalidConfig {
        field: field.to_string(),
        value: value.into(),
    }
}

fn parse<T: FromStr>(field: &str, value: &str) -> SharedResult<T> {
    value.trim().parse().map_err(|_| invalid(field, value))
}

fn millis(field: &str, value: &str) -> SharedResult<Duration> {
    parse(field, value).map(Duration::from_millis)
}

/// Fluent construction of a [`HarnessConfig`]
#[derive(Debug, Clone, Default)]
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    pub fn from_config(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn watchdog_budget(mut self, budget: Duration) -> Self {
        self.config.watchdog_budget = budget;
        self
    }

    pub fn scenario_budget(mut self, budget: Duration) -> Self {
        self.config.scenario_budget = budget;
        self
    }

    pub fn ssh_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.config.ssh_port_start = *range.start();
        self.config.ssh_port_end = *range.end();
        self
    }

    pub fn ready_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.ready_states = states.into_iter().map(Into::into).collect();
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = timeout;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    pub fn diagnostics_path(mut self, path: Option<PathBuf>) -> Self {
        self.config.diagnostics_path = path;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn build(self) -> SharedResult<HarnessConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
