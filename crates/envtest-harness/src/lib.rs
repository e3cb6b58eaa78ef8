//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Suite lifecycle harness for integration tests against a local control plane."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! Suite lifecycle for integration tests that run reconcilers against a
//! real, local control plane.
//!
//! A suite owns one [`SuiteState`]. Setup boots the environment, registers
//! the suite's types, builds and starts a manager, and hands back the
//! manager's client. Specs then run through [`SuiteState::run_spec`] while
//! the manager loop is watched for failures, and [`SuiteState::stop`] tears
//! everything down in order:
//!
//! 1. the manager run loop is cancelled and joined,
//! 2. companion processes are terminated and reaped,
//! 3. the control plane is stopped and scratch storage removed.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use envtest_common::HarnessConfig;
//! use envtest_harness::SuiteState;
//! use envtest_runtime::{ReconcilerConfig, SchemeBuilder};
//!
//! let mut suite = SuiteState::new("widgets", HarnessConfig::default());
//! let client = suite
//!     .setup(&SchemeBuilder::new(), ReconcilerConfig::default(), |_manager| Ok(()))
//!     .await?;
//! suite.run_spec("control plane answers", |client| async move {
//!     client.readyz().await?;
//!     Ok(())
//! }).await;
//! drop(client);
//! suite.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod error;
pub mod phase;
pub mod poll;
pub mod process;
pub mod report;
pub mod suite;
pub mod teardown;

pub use bootstrap::{EnvironmentBootstrapper, EnvironmentResources, TestEnvironment, CONNECTION_ENV, CONNECTION_FILE, HOST_ENV};
pub use error::{
    ErrorKind, HarnessError, HarnessResult, RunLoopFailure, SchemeConflict, SetupFailure, StageFailure, TeardownError,
};
pub use phase::SuitePhase;
pub use poll::eventually;
pub use process::{ExitMode, ProcessRegistry};
pub use report::{SpecOutcome, SpecStatus, SuiteReport};
pub use suite::SuiteState;
pub use teardown::{EnvironmentStage, ManagerSlot, ManagerStage, ProcessStage, TeardownCoordinator, TeardownStage};
