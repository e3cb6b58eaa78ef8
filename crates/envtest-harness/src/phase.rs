//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Suite phases and the forward-only transition table."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::fmt;

use serde::Serialize;

/// Lifecycle phase of a suite run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuitePhase {
    /// Nothing has been acquired yet.
    NotStarted,
    /// The control plane is being started or is up without a scheme.
    Bootstrapping,
    /// Domain types are registered; no manager exists yet.
    SchemeRegistered,
    /// The manager has been built and may be running, but is not yet declared ready.
    ManagerStarting,
    /// Specs may run.
    Ready,
    /// Teardown is in progress.
    TearingDown,
    /// Teardown finished. Terminal.
    Stopped,
    /// A fatal setup error ended the run. Terminal.
    Aborted,
}

impl SuitePhase {
    /// Phases reachable from `self` in one step.
    pub fn successors(self) -> &'static [SuitePhase] {
        use SuitePhase::*;
        match self {
            NotStarted => &[Bootstrapping, TearingDown],
            Bootstrapping => &[SchemeRegistered, TearingDown, Aborted],
            SchemeRegistered => &[ManagerStarting, TearingDown, Aborted],
            ManagerStarting => &[Ready, TearingDown, Aborted],
            Ready => &[TearingDown],
            TearingDown => &[Stopped],
            Stopped | Aborted => &[],
        }
    }

    pub fn can_transition_to(self, next: SuitePhase) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// Setup phases, during which a fatal error aborts the run.
    pub fn is_setup(self) -> bool {
        matches!(
            self,
            SuitePhase::Bootstrapping | SuitePhase::SchemeRegistered | SuitePhase::ManagerStarting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SuitePhase::NotStarted => "not_started",
            SuitePhase::Bootstrapping => "bootstrapping",
            SuitePhase::SchemeRegistered => "scheme_registered",
            SuitePhase::ManagerStarting => "manager_starting",
            SuitePhase::Ready => "ready",
            SuitePhase::TearingDown => "tearing_down",
            SuitePhase::Stopped => "stopped",
            SuitePhase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SuitePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
