//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Error taxonomy for suite setup, run loop, and teardown."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use envtest_apiserver::ServerError;
use envtest_runtime::{ClientError, ManagerError, SchemeError};
use envtest_schema::SchemaError;
use thiserror::Error;

use crate::phase::SuitePhase;

/// Fatal error raised while standing the environment up.
#[derive(Debug, Error)]
pub enum SetupFailure {
    #[error("{operation} is not allowed in phase {phase}")]
    PhaseViolation {
        operation: &'static str,
        phase: SuitePhase,
    },
    #[error("invalid harness configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("control plane failed to start: {0}")]
    ControlPlane(#[from] ServerError),
    #[error("{stage} did not complete within {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error("control plane at {endpoint} is not ready: {message}")]
    NotReady { endpoint: String, message: String },
    #[error("failed to install definition {definition}: {source}")]
    Install {
        definition: String,
        #[source]
        source: ClientError,
    },
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start process {name}: {source}")]
    Process {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build manager: {0}")]
    Manager(#[from] ManagerError),
    #[error("manager setup failed: {0}")]
    ManagerSetup(String),
}

/// Registration of domain types was rejected.
#[derive(Debug, Error)]
pub enum SchemeConflict {
    #[error("types are already registered for this suite")]
    AlreadyRegistered,
    #[error(transparent)]
    Rejected(#[from] SchemeError),
}

/// The manager run loop failed after it was started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("manager run loop failed: {message}")]
pub struct RunLoopFailure {
    pub message: String,
}

impl RunLoopFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One teardown stage that did not complete cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: String,
    pub message: String,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

/// Every teardown stage failure of one `stop` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct TeardownError {
    pub failures: Vec<StageFailure>,
}

impl TeardownError {
    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|failure| failure.stage.as_str())
    }
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "teardown finished with {} failed stage(s)", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

/// Broad category of a [`HarnessError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SetupFailure,
    SchemeConflict,
    RunLoopFailure,
    TeardownFailure,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Setup(#[from] SetupFailure),
    #[error(transparent)]
    Scheme(#[from] SchemeConflict),
    #[error(transparent)]
    RunLoop(#[from] RunLoopFailure),
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::Setup(_) => ErrorKind::SetupFailure,
            HarnessError::Scheme(_) => ErrorKind::SchemeConflict,
            HarnessError::RunLoop(_) => ErrorKind::RunLoopFailure,
            HarnessError::Teardown(_) => ErrorKind::TeardownFailure,
        }
    }

    /// Fatal errors end the suite; teardown failures are reported but do not
    /// change the outcome of specs that already ran.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::TeardownFailure)
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_teardown_failures_are_non_fatal() {
        let setup: HarnessError = SetupFailure::Config("bad".into()).into();
        let conflict: HarnessError = SchemeConflict::AlreadyRegistered.into();
        let run_loop: HarnessError = RunLoopFailure::new("boom").into();
        let teardown: HarnessError = TeardownError { failures: vec![] }.into();
        assert!(setup.is_fatal() && conflict.is_fatal() && run_loop.is_fatal());
        assert!(!teardown.is_fatal());
        assert_eq!(conflict.kind(), ErrorKind::SchemeConflict);
    }

    #[test]
    fn teardown_error_lists_every_stage() {
        let err = TeardownError {
            failures: vec![
                StageFailure {
                    stage: "manager".into(),
                    message: "timed out".into(),
                },
                StageFailure {
                    stage: "environment".into(),
                    message: "port busy".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "teardown finished with 2 failed stage(s); manager: timed out; environment: port busy"
        );
        assert_eq!(err.stages().collect::<Vec<_>>(), ["manager", "environment"]);
    }
}
