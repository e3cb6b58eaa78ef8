//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Aggregated spec results and suite exit status."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SpecStatus {
    Passed,
    Failed(String),
    Skipped(String),
}

impl SpecStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, SpecStatus::Passed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecOutcome {
    pub name: String,
    #[serde(flatten)]
    pub status: SpecStatus,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Result of one suite run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteReport {
    pub suite: String,
    pub specs: Vec<SpecOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_loop_failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_failure: Option<String>,
}

impl SuiteReport {
    pub fn new(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, name: impl Into<String>, status: SpecStatus, duration: Duration) {
        self.specs.push(SpecOutcome {
            name: name.into(),
            status,
            duration,
        });
    }

    pub fn passed(&self) -> usize {
        self.count(|status| matches!(status, SpecStatus::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, SpecStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|status| matches!(status, SpecStatus::Skipped(_)))
    }

    fn count(&self, predicate: impl Fn(&SpecStatus) -> bool) -> usize {
        self.specs.iter().filter(|spec| predicate(&spec.status)).count()
    }

    /// Every spec passed and setup, run loop, and teardown were clean.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
            && self.skipped() == 0
            && self.setup_failure.is_none()
            && self.run_loop_failure.is_none()
            && self.teardown_failure.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_failure_fails_the_suite_but_not_the_specs() {
        let mut report = SuiteReport::new("suite");
        report.record("a", SpecStatus::Passed, Duration::from_millis(3));
        assert!(report.is_success());

        report.teardown_failure = Some("processes: 1 process(es) not stopped".into());
        assert_eq!(report.passed(), 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn serializes_flat_outcomes() {
        let mut report = SuiteReport::new("suite");
        report.record("b", SpecStatus::Skipped("run loop failed".into()), Duration::from_millis(0));
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["specs"][0]["status"], "skipped");
        assert_eq!(value["specs"][0]["reason"], "run loop failed");
        assert_eq!(value["specs"][0]["duration_ms"], 0);
        assert!(value.get("setup_failure").is_none());
    }
}
