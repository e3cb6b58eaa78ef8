//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Ordered, bounded, best-effort teardown stages."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! Teardown runs a fixed list of stages in order. Each stage gets its own
//! time bound, a failing or panicking stage never prevents the next one from
//! running, and every failure ends up in one [`TeardownError`].

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use envtest_logging::{log_lifecycle_event, LifecycleOutcome, LogContext};
use envtest_runtime::{Client, ManagerError, ManagerHandle};
use futures::FutureExt;
use tracing::warn;

use crate::bootstrap::EnvironmentResources;
use crate::error::{StageFailure, TeardownError};
use crate::process::ProcessRegistry;

/// One step of teardown.
#[async_trait]
pub trait TeardownStage: Send {
    fn name(&self) -> &str;

    async fn run(&mut self) -> anyhow::Result<()>;
}

/// Runs stages in registration order.
pub struct TeardownCoordinator {
    stages: Vec<Box<dyn TeardownStage>>,
    stage_timeout: Duration,
}

impl std::fmt::Debug for TeardownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownCoordinator")
            .field("stages", &self.stage_names())
            .field("stage_timeout", &self.stage_timeout)
            .finish()
    }
}

impl TeardownCoordinator {
    /// `stage_timeout` bounds each stage individually.
    pub fn new(stage_timeout: Duration) -> Self {
        Self {
            stages: Vec::new(),
            stage_timeout,
        }
    }

    pub fn push(&mut self, stage: Box<dyn TeardownStage>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn run(self) -> Result<(), TeardownError> {
        let mut failures = Vec::new();
        for mut stage in self.stages {
            let name = stage.name().to_owned();
            let ctx = LogContext::new().with_phase("tearing_down").with_stage(&name);
            let bounded = tokio::time::timeout(
                self.stage_timeout,
                AssertUnwindSafe(stage.run()).catch_unwind(),
            )
            .await;
            let message = match bounded {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(err))) => Some(format!("{err:#}")),
                Ok(Err(_)) => Some("stage panicked".to_owned()),
                Err(_) => Some(format!("stage did not finish within {:?}", self.stage_timeout)),
            };
            match message {
                None => log_lifecycle_event(Some(&ctx), "teardown.stage", "stage complete", LifecycleOutcome::Success),
                Some(message) => {
                    log_lifecycle_event(Some(&ctx), "teardown.stage", &message, LifecycleOutcome::Fault);
                    failures.push(StageFailure {
                        stage: name.clone(),
                        message,
                    });
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }
}

/// What the manager stage has to release.
#[derive(Debug)]
pub enum ManagerSlot {
    /// Started; cancel it and wait for the loop.
    Running(ManagerHandle),
    /// Built but never started; only its client needs revoking.
    Built(Client),
    Empty,
}

/// Stage (a): cancel the manager run loop, bounded by the grace period.
#[derive(Debug)]
pub struct ManagerStage {
    slot: ManagerSlot,
    grace: Duration,
}

impl ManagerStage {
    pub fn new(slot: ManagerSlot, grace: Duration) -> Self {
        Self { slot, grace }
    }
}

#[async_trait]
impl TeardownStage for ManagerStage {
    fn name(&self) -> &str {
        "manager"
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        match std::mem::replace(&mut self.slot, ManagerSlot::Empty) {
            ManagerSlot::Empty => Ok(()),
            ManagerSlot::Built(client) => {
                client.revoke();
                Ok(())
            }
            ManagerSlot::Running(handle) => match handle.shutdown(self.grace).await {
                Ok(()) => Ok(()),
                Err(err @ (ManagerError::ShutdownTimeout(_) | ManagerError::TaskPanicked(_))) => {
                    Err(err.into())
                }
                Err(err) => {
                    // Loop failures are reported through the run-loop channel.
                    warn!(error = %err, "manager had already failed before teardown");
                    Ok(())
                }
            },
        }
    }
}

/// Stage (b): stop companion processes, force-killing after the grace period.
#[derive(Debug)]
pub struct ProcessStage {
    registry: ProcessRegistry,
    grace: Duration,
}

impl ProcessStage {
    pub fn new(registry: ProcessRegistry, grace: Duration) -> Self {
        Self { registry, grace }
    }
}

#[async_trait]
impl TeardownStage for ProcessStage {
    fn name(&self) -> &str {
        "processes"
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let failures = self.registry.kill_and_wait(self.grace).await;
        if failures.is_empty() {
            return Ok(());
        }
        let detail = failures
            .iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect::<Vec<_>>()
            .join(", ");
        anyhow::bail!("{} process(es) not stopped: {detail}", failures.len())
    }
}

/// Stage (c): stop the control plane and remove temporary storage.
#[derive(Debug)]
pub struct EnvironmentStage {
    resources: Option<EnvironmentResources>,
    stop_timeout: Duration,
}

impl EnvironmentStage {
    pub fn new(resources: Option<EnvironmentResources>, stop_timeout: Duration) -> Self {
        Self {
            resources,
            stop_timeout,
        }
    }
}

#[async_trait]
impl TeardownStage for EnvironmentStage {
    fn name(&self) -> &str {
        "environment"
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        match self.resources.take() {
            Some(resources) => resources.release(self.stop_timeout).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Recording {
        name: &'static str,
        ran: Arc<AtomicUsize>,
        behaviour: Behaviour,
    }

    enum Behaviour {
        Succeed,
        Fail,
        Hang,
        Panic,
    }

    #[async_trait]
    impl TeardownStage for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&mut self) -> anyhow::Result<()> {
            self.ran.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => anyhow::bail!("injected failure"),
                Behaviour::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                Behaviour::Panic => panic!("injected panic"),
            }
        }
    }

    fn stage(name: &'static str, ran: &Arc<AtomicUsize>, behaviour: Behaviour) -> Box<dyn TeardownStage> {
        Box::new(Recording {
            name,
            ran: Arc::clone(ran),
            behaviour,
        })
    }

    #[tokio::test]
    async fn every_stage_runs_and_failures_are_collected() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut coordinator = TeardownCoordinator::new(Duration::from_millis(100));
        coordinator
            .push(stage("hangs", &ran, Behaviour::Hang))
            .push(stage("fails", &ran, Behaviour::Fail))
            .push(stage("panics", &ran, Behaviour::Panic))
            .push(stage("succeeds", &ran, Behaviour::Succeed));
        assert_eq!(coordinator.stage_names(), ["hangs", "fails", "panics", "succeeds"]);

        let err = coordinator.run().await.unwrap_err();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(err.stages().collect::<Vec<_>>(), ["hangs", "fails", "panics"]);
        assert!(err.failures[0].message.contains("did not finish"));
        assert_eq!(err.failures[1].message, "injected failure");
    }

    #[tokio::test]
    async fn empty_slots_are_no_ops() {
        let mut coordinator = TeardownCoordinator::new(Duration::from_secs(1));
        coordinator
            .push(Box::new(ManagerStage::new(ManagerSlot::Empty, Duration::from_millis(10))))
            .push(Box::new(ProcessStage::new(ProcessRegistry::new(), Duration::from_millis(10))))
            .push(Box::new(EnvironmentStage::new(None, Duration::from_millis(10))));
        coordinator.run().await.unwrap();
    }
}
