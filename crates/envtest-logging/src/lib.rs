//! ---
//! envtest_section: "03-logging"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Structured logging adapters and sinks."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Tracing setup and lifecycle logging helpers shared by the harness crates.

use anyhow::Result;
use envtest_common::config::{LogFormat, LoggingConfig};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

#[macro_use]
pub mod macros;

#[doc(hidden)]
pub use tracing as __tracing;

const LOG_ENV: &str = "ENVTEST_LOG";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

fn resolve_filter(default_directive: &str) -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to {default_directive}");
            EnvFilter::new(default_directive)
        }),
        Err(_) => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive)),
    }
}

/// Initialize a baseline tracing subscriber suitable for command line use.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(resolve_filter("info"))
        .with(fmt::layer())
        .try_init();
}

/// Initialize a development subscriber that writes through the test harness
/// capture, so output is only shown for failing tests.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(resolve_filter("debug"))
        .with(fmt::layer().with_target(true).with_test_writer())
        .try_init();
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// `ENVTEST_LOG` overrides the filter, then `RUST_LOG`, finally `info`. When
/// [`LoggingConfig::directory`] is set a daily rolling JSON file is written
/// alongside stdout.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = match rolling_file_writer(service_name, config)? {
        Some((file_writer, file_guard)) => {
            let _ = FILE_GUARD.set(file_guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(file_writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(resolve_filter("info"))
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, format = ?config.format, file_logging = config.directory.is_some(), "tracing initialised");
    Ok(())
}

/// Daily rolling writer for `{prefix}-{service}.log` under the configured
/// directory, or `None` when file logging is off.
fn rolling_file_writer(
    service_name: &str,
    config: &LoggingConfig,
) -> Result<Option<(NonBlocking, WorkerGuard)>> {
    let Some(directory) = &config.directory else {
        return Ok(None);
    };
    std::fs::create_dir_all(directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());
    let appender = daily(directory, format!("{prefix}-{service_name}.log"));
    Ok(Some(tracing_appender::non_blocking(appender)))
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Suite name the event belongs to.
    pub suite: Option<&'a str>,
    /// Lifecycle phase the suite was in when the event was emitted.
    pub phase: Option<&'a str>,
    /// Teardown or setup stage, when applicable.
    pub stage: Option<&'a str>,
    /// Resource or process the event concerns.
    pub resource: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a suite name.
    pub fn with_suite(mut self, suite: &'a str) -> Self {
        self.suite = Some(suite);
        self
    }

    /// Attach a lifecycle phase.
    pub fn with_phase(mut self, phase: &'a str) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Attach a stage name.
    pub fn with_stage(mut self, stage: &'a str) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Attach a resource or process identifier.
    pub fn with_resource(mut self, resource: &'a str) -> Self {
        self.resource = Some(resource);
        self
    }
}

/// Outcome attached to lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The step completed.
    Success,
    /// The step failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    /// Stable label used in the `outcome` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event; faults are logged at ERROR, successes at INFO.
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let default_ctx = LogContext::default();
    let ctx = context.unwrap_or(&default_ctx);
    match outcome {
        LifecycleOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            suite = ctx.suite.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            stage = ctx.stage.unwrap_or(""),
            resource = ctx.resource.unwrap_or(""),
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            suite = ctx.suite.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            stage = ctx.stage.unwrap_or(""),
            resource = ctx.resource.unwrap_or(""),
            message = %message
        ),
    }
}
