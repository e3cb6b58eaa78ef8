//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Harness configuration model, loading, and validation."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;
use url::Url;

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_setup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_watch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_watch_failures() -> u32 {
    5
}

fn default_requeue_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Top-level configuration for a single suite run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(default)]
    pub teardown: TeardownConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`HarnessConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedHarnessConfig {
    pub config: HarnessConfig,
    pub source: PathBuf,
}

impl HarnessConfig {
    pub const ENV_CONFIG_PATH: &'static str = "ENVTEST_CONFIG";
    pub const ENV_EXISTING_ENDPOINT: &'static str = "ENVTEST_EXISTING_ENDPOINT";
    pub const ENV_STARTUP_TIMEOUT: &'static str = "ENVTEST_STARTUP_TIMEOUT_SECS";
    pub const ENV_STOP_TIMEOUT: &'static str = "ENVTEST_STOP_TIMEOUT_SECS";

    /// Load configuration from disk, respecting the `ENVTEST_CONFIG` override.
    ///
    /// When neither the override nor any candidate exists the defaults are
    /// used, so a suite can run without a configuration file.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedHarnessConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedHarnessConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedHarnessConfig {
                    config,
                    source: path,
                });
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(LoadedHarnessConfig {
            config,
            source: PathBuf::from("<defaults>"),
        })
    }

    /// Parse, override, and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading harness configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let mut config = toml::from_str::<HarnessConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the documented `ENVTEST_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(endpoint) = non_empty_env(Self::ENV_EXISTING_ENDPOINT) {
            let url = Url::parse(&endpoint)
                .with_context(|| format!("{} is not a valid URL", Self::ENV_EXISTING_ENDPOINT))?;
            self.control_plane.existing_endpoint = Some(url);
        }
        if let Some(secs) = non_empty_env(Self::ENV_STARTUP_TIMEOUT) {
            self.control_plane.startup_timeout = parse_secs(Self::ENV_STARTUP_TIMEOUT, &secs)?;
        }
        if let Some(secs) = non_empty_env(Self::ENV_STOP_TIMEOUT) {
            self.teardown.stop_timeout = parse_secs(Self::ENV_STOP_TIMEOUT, &secs)?;
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.control_plane.validate()?;
        self.teardown.validate()?;
        self.manager.validate()?;
        if self.setup.timeout.is_zero() {
            return Err(anyhow!("setup.timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for HarnessConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: HarnessConfig =
            toml::from_str(content).with_context(|| "failed to parse harness configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration> {
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got '{raw}'"))?;
    Ok(Duration::from_secs(secs))
}

/// Settings for the ephemeral control plane and its preloaded definitions.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    #[serde(default)]
    pub schema_directories: Vec<PathBuf>,
    #[serde(default)]
    pub error_if_schema_path_missing: bool,
    /// Attach to an already running control plane instead of starting one.
    #[serde(default)]
    pub existing_endpoint: Option<Url>,
    #[serde(default = "default_startup_timeout", rename = "startup_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub startup_timeout: Duration,
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// Companion processes started once the control plane is ready.
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            schema_directories: Vec::new(),
            error_if_schema_path_missing: false,
            existing_endpoint: None,
            startup_timeout: default_startup_timeout(),
            poll_interval: default_poll_interval(),
            processes: Vec::new(),
        }
    }
}

impl ControlPlaneConfig {
    /// Convenience builder used by suites that preload a single directory.
    pub fn with_schema_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.schema_directories.push(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.startup_timeout.is_zero() {
            return Err(anyhow!("control_plane.startup_timeout_ms must be greater than zero"));
        }
        if self.poll_interval.is_zero() || self.poll_interval >= self.startup_timeout {
            return Err(anyhow!(
                "control_plane.poll_interval_ms must be non-zero and shorter than the startup timeout"
            ));
        }
        if let Some(endpoint) = &self.existing_endpoint {
            if !matches!(endpoint.scheme(), "http" | "https") {
                return Err(anyhow!(
                    "control_plane.existing_endpoint must be http(s), got '{}'",
                    endpoint.scheme()
                ));
            }
        }
        let mut names = HashSet::new();
        for process in &self.processes {
            process.validate()?;
            if !names.insert(process.name.as_str()) {
                return Err(anyhow!("duplicate companion process name '{}'", process.name));
            }
        }
        Ok(())
    }
}

/// Declarative description of a child process owned by the harness.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("process name cannot be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(anyhow!("process '{}' must declare a command", self.name));
        }
        Ok(())
    }
}

/// Bounds applied to the whole setup sequence.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default = "default_setup_timeout", rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            timeout: default_setup_timeout(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownConfig {
    /// Wait granted to the run loop and child processes before forcing them down.
    #[serde(default = "default_grace_period", rename = "grace_period_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub grace_period: Duration,
    /// Upper bound for stopping the control plane itself.
    #[serde(default = "default_stop_timeout", rename = "stop_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stop_timeout: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl TeardownConfig {
    pub fn validate(&self) -> Result<()> {
        if self.grace_period.is_zero() || self.stop_timeout.is_zero() {
            return Err(anyhow!("teardown timeouts must be greater than zero"));
        }
        if self.grace_period > self.stop_timeout {
            return Err(anyhow!(
                "teardown.grace_period_ms ({:?}) must not exceed teardown.stop_timeout_ms ({:?})",
                self.grace_period,
                self.stop_timeout
            ));
        }
        Ok(())
    }
}

/// Tunables for the reconciliation manager's watch and dispatch loops.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_watch_timeout", rename = "watch_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub watch_timeout: Duration,
    #[serde(default = "default_max_watch_failures")]
    pub max_watch_failures: u32,
    #[serde(default = "default_requeue_backoff", rename = "requeue_backoff_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub requeue_backoff: Duration,
    /// Restrict every controller to a single namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            watch_timeout: default_watch_timeout(),
            max_watch_failures: default_max_watch_failures(),
            requeue_backoff: default_requeue_backoff(),
            namespace: None,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.watch_timeout < Duration::from_millis(10) {
            return Err(anyhow!("manager.watch_timeout_ms must be at least 10ms"));
        }
        if self.max_watch_failures == 0 {
            return Err(anyhow!("manager.max_watch_failures must be at least 1"));
        }
        Ok(())
    }
}

/// Available log formats for harness output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// When set, a rolling JSON log file is written here in addition to stdout.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
