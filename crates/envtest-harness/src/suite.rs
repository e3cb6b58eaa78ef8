//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Suite state machine threading environment, scheme, and manager handles."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! [`SuiteState`] is the single owner of everything a suite run acquires.
//!
//! Setup moves it forward through bootstrap, scheme registration, manager
//! build and start. Specs run only once it is [`SuitePhase::Ready`]. A fatal
//! setup error drops whatever was acquired and parks it in
//! [`SuitePhase::Aborted`]; [`SuiteState::stop`] tears a live suite down.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use envtest_common::{HarnessConfig, ProcessSpec};
use envtest_logging::{harness_error, harness_info, harness_warn, log_lifecycle_event, LifecycleOutcome, LogContext};
use envtest_runtime::{Client, Manager, ManagerError, ManagerHandle, ReconcilerConfig, Scheme, SchemeBuilder};
use envtest_schema::GroupVersionResource;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::{EnvironmentBootstrapper, TestEnvironment};
use crate::error::{HarnessError, HarnessResult, RunLoopFailure, SchemeConflict, SetupFailure};
use crate::phase::SuitePhase;
use crate::process::ProcessRegistry;
use crate::report::{SpecStatus, SuiteReport};
use crate::teardown::{EnvironmentStage, ManagerSlot, ManagerStage, ProcessStage, TeardownCoordinator};

/// Explicit state of one suite run.
#[derive(Debug)]
pub struct SuiteState {
    name: String,
    config: HarnessConfig,
    phase: SuitePhase,
    environment: Option<TestEnvironment>,
    scheme: Option<Arc<Scheme>>,
    manager: Option<Manager>,
    handle: Option<ManagerHandle>,
    client: Client,
    cancel: CancellationToken,
    run_loop_failure: Option<RunLoopFailure>,
    report: SuiteReport,
}

impl SuiteState {
    pub fn new(name: impl Into<String>, config: HarnessConfig) -> Self {
        let name = name.into();
        Self {
            report: SuiteReport::new(name.clone()),
            name,
            config,
            phase: SuitePhase::NotStarted,
            environment: None,
            scheme: None,
            manager: None,
            handle: None,
            client: Client::invalid(),
            cancel: CancellationToken::new(),
            run_loop_failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> SuitePhase {
        self.phase
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn environment(&self) -> Option<&TestEnvironment> {
        self.environment.as_ref()
    }

    pub fn scheme(&self) -> Option<Arc<Scheme>> {
        self.scheme.clone()
    }

    pub fn report(&self) -> &SuiteReport {
        &self.report
    }

    /// Client bound to the manager. Invalid before the manager is built and
    /// after teardown or abort.
    pub fn client(&self) -> Client {
        match self.phase {
            SuitePhase::ManagerStarting | SuitePhase::Ready => self.client.clone(),
            _ => Client::invalid(),
        }
    }

    /// Start the control plane and preload definitions. Allowed once.
    pub async fn bootstrap(&mut self) -> HarnessResult<&TestEnvironment> {
        self.advance(SuitePhase::Bootstrapping, "bootstrap")?;
        if let Err(err) = self.config.validate() {
            return Err(self.abort(SetupFailure::Config(format!("{err:#}")).into()));
        }
        let bootstrapper = EnvironmentBootstrapper::new(self.config.control_plane.clone());
        match bootstrapper.start().await {
            Ok(environment) => {
                self.lifecycle("bootstrap", "environment ready", LifecycleOutcome::Success);
                Ok(&*self.environment.insert(environment))
            }
            Err(err) => Err(self.abort(err.into())),
        }
    }

    /// Register the suite's domain types. A second call is a conflict.
    pub fn register_scheme(&mut self, builder: &SchemeBuilder) -> HarnessResult<Arc<Scheme>> {
        if self.scheme.is_some() {
            return Err(self.abort(SchemeConflict::AlreadyRegistered.into()));
        }
        if self.phase != SuitePhase::Bootstrapping || self.environment.is_none() {
            return Err(self.misuse("register_scheme"));
        }
        let scheme = match builder.build() {
            Ok(scheme) => Arc::new(scheme),
            Err(err) => return Err(self.abort(SchemeConflict::Rejected(err).into())),
        };
        self.warn_unserved(&scheme);
        self.advance(SuitePhase::SchemeRegistered, "register_scheme")?;
        self.scheme = Some(Arc::clone(&scheme));
        self.lifecycle("register_scheme", "types registered", LifecycleOutcome::Success);
        Ok(scheme)
    }

    fn warn_unserved(&self, scheme: &Scheme) {
        let Some(environment) = &self.environment else {
            return;
        };
        let served: Vec<GroupVersionResource> = environment
            .definitions()
            .iter()
            .flat_map(|definition| definition.served_resources())
            .collect();
        for registration in scheme.registrations() {
            let gvk = &registration.gvk;
            let gvr = GroupVersionResource::new(&gvk.group, &gvk.version, registration.plural);
            if !served.contains(&gvr) {
                harness_warn!(
                    context = self.context().with_resource(registration.type_name),
                    "{gvr} is registered but no preloaded definition serves it"
                );
            }
        }
    }

    /// Build the manager and let `configure` attach reconcilers. Nothing runs yet.
    pub fn build_manager<F>(&mut self, reconciler_config: ReconcilerConfig, configure: F) -> HarnessResult<Client>
    where
        F: FnOnce(&mut Manager) -> Result<(), ManagerError>,
    {
        if self.phase != SuitePhase::SchemeRegistered {
            return Err(self.misuse("build_manager"));
        }
        let (Some(environment), Some(scheme)) = (&self.environment, &self.scheme) else {
            return Err(self.misuse("build_manager"));
        };
        let built = Manager::build(
            environment.connection().clone(),
            Arc::clone(scheme),
            self.config.manager.clone(),
            reconciler_config,
        )
        .and_then(|mut manager| configure(&mut manager).map(|()| manager));
        let manager = match built {
            Ok(manager) => manager,
            Err(err) => return Err(self.abort(SetupFailure::Manager(err).into())),
        };
        self.advance(SuitePhase::ManagerStarting, "build_manager")?;
        self.client = manager.client();
        self.manager = Some(manager);
        self.lifecycle("build_manager", "manager built", LifecycleOutcome::Success);
        Ok(self.client.clone())
    }

    /// Start the manager loop and wait for its first full list. Moves to Ready.
    pub async fn start_manager(&mut self) -> HarnessResult<()> {
        let Some(manager) = self.manager.take() else {
            return Err(self.misuse("start_manager"));
        };
        if self.phase != SuitePhase::ManagerStarting {
            self.manager = Some(manager);
            return Err(self.misuse("start_manager"));
        }
        let handle = manager.start(self.cancel.child_token());
        let synced = handle
            .wait_until_synced(self.config.control_plane.startup_timeout)
            .await;
        self.handle = Some(handle);
        if let Err(err) = synced {
            return Err(self.abort(SetupFailure::ManagerSetup(err.to_string()).into()));
        }
        self.advance(SuitePhase::Ready, "start_manager")?;
        self.lifecycle("start_manager", "suite ready", LifecycleOutcome::Success);
        Ok(())
    }

    /// Run the whole setup sequence under the configured setup timeout.
    pub async fn setup<F>(
        &mut self,
        builder: &SchemeBuilder,
        reconciler_config: ReconcilerConfig,
        configure: F,
    ) -> HarnessResult<Client>
    where
        F: FnOnce(&mut Manager) -> Result<(), ManagerError>,
    {
        let limit = self.config.setup.timeout;
        let sequence = async {
            self.bootstrap().await?;
            self.register_scheme(builder)?;
            let client = self.build_manager(reconciler_config, configure)?;
            self.start_manager().await?;
            Ok::<_, HarnessError>(client)
        };
        let bounded = tokio::time::timeout(limit, sequence).await;
        match bounded {
            Ok(result) => result,
            Err(_) => Err(self.abort(
                SetupFailure::Timeout {
                    stage: "setup",
                    after: limit,
                }
                .into(),
            )),
        }
    }

    /// Start a companion process in a live environment.
    pub fn spawn_process(&mut self, spec: &ProcessSpec) -> HarnessResult<u32> {
        if self.phase.is_terminal() || self.phase == SuitePhase::TearingDown {
            return Err(self.misuse("spawn_process"));
        }
        let Some(environment) = self.environment.as_mut() else {
            return Err(self.misuse("spawn_process"));
        };
        match environment.spawn_process(spec) {
            Ok(pid) => Ok(pid),
            Err(err) if self.phase.is_setup() => Err(self.abort(err.into())),
            Err(err) => Err(err.into()),
        }
    }

    /// Surface a run-loop failure. Once seen it stays latched for the rest of the run.
    pub fn check_run_loop(&mut self) -> Result<(), RunLoopFailure> {
        if let Some(failure) = &self.run_loop_failure {
            return Err(failure.clone());
        }
        let Some(handle) = &self.handle else {
            return Ok(());
        };
        match handle.check() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.latch_run_loop(err.to_string())),
        }
    }

    fn latch_run_loop(&mut self, message: String) -> RunLoopFailure {
        let failure = RunLoopFailure::new(message);
        let ctx = self.context();
        harness_error!(context = ctx, "{failure}");
        self.report.run_loop_failure = Some(failure.message.clone());
        self.run_loop_failure = Some(failure.clone());
        failure
    }

    /// Run one spec against the suite client and record its outcome.
    ///
    /// Specs only run while the suite is ready and the manager loop is
    /// healthy. A loop failure while the spec runs fails that spec, and every
    /// later spec is skipped.
    pub async fn run_spec<F, Fut>(&mut self, name: &str, spec: F) -> SpecStatus
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let started = Instant::now();
        let status = if self.phase != SuitePhase::Ready {
            SpecStatus::Skipped(format!("suite is {}", self.phase))
        } else if let Err(failure) = self.check_run_loop() {
            SpecStatus::Skipped(failure.to_string())
        } else {
            self.execute(spec).await
        };
        match &status {
            SpecStatus::Passed => harness_info!(context = self.context(), "spec '{name}' passed"),
            SpecStatus::Failed(reason) => harness_error!(context = self.context(), "spec '{name}' failed: {reason}"),
            SpecStatus::Skipped(reason) => harness_warn!(context = self.context(), "spec '{name}' skipped: {reason}"),
        }
        self.report.record(name, status.clone(), started.elapsed());
        status
    }

    async fn execute<F, Fut>(&mut self, spec: F) -> SpecStatus
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let body = AssertUnwindSafe(spec(self.client.clone())).catch_unwind();
        let loop_failed = async {
            match &self.handle {
                Some(handle) => match handle.failed().await {
                    Some(message) => message,
                    None => std::future::pending().await,
                },
                None => std::future::pending().await,
            }
        };
        let outcome = tokio::select! {
            finished = body => Ok(finished),
            message = loop_failed => Err(message),
        };
        match outcome {
            Ok(Ok(Ok(()))) => SpecStatus::Passed,
            Ok(Ok(Err(err))) => SpecStatus::Failed(format!("{err:#}")),
            Ok(Err(_)) => SpecStatus::Failed("spec panicked".to_owned()),
            Err(message) => {
                let failure = self.latch_run_loop(message);
                SpecStatus::Failed(failure.to_string())
            }
        }
    }

    /// Tear everything down: manager, then processes, then the environment.
    ///
    /// Every stage runs even if an earlier one fails; failures come back as
    /// one aggregated error. A suite can be stopped once; an aborted suite
    /// has nothing left to release.
    pub async fn stop(&mut self) -> HarnessResult<()> {
        if self.phase == SuitePhase::Aborted {
            return Ok(());
        }
        if self.phase == SuitePhase::Stopped {
            return Err(self.misuse("stop"));
        }
        // Record a pending loop failure before the handle goes away.
        let _ = self.check_run_loop();
        self.advance(SuitePhase::TearingDown, "stop")?;

        let grace = self.config.teardown.grace_period;
        let stop_timeout = self.config.teardown.stop_timeout;
        let slot = match (self.handle.take(), self.manager.take()) {
            (Some(handle), _) => ManagerSlot::Running(handle),
            (None, Some(manager)) => ManagerSlot::Built(manager.client()),
            (None, None) => ManagerSlot::Empty,
        };
        let (processes, resources) = match self.environment.take() {
            Some(environment) => {
                let (processes, resources) = environment.into_parts();
                (processes, Some(resources))
            }
            None => (ProcessRegistry::new(), None),
        };

        let mut coordinator = TeardownCoordinator::new(stop_timeout);
        coordinator
            .push(Box::new(ManagerStage::new(slot, grace)))
            .push(Box::new(ProcessStage::new(processes, grace)))
            .push(Box::new(EnvironmentStage::new(resources, stop_timeout)));
        let result = coordinator.run().await;

        self.cancel.cancel();
        self.client.revoke();
        self.client = Client::invalid();
        self.scheme = None;
        self.advance(SuitePhase::Stopped, "stop")?;
        match result {
            Ok(()) => {
                self.lifecycle("stop", "suite stopped", LifecycleOutcome::Success);
                Ok(())
            }
            Err(err) => {
                self.report.teardown_failure = Some(err.to_string());
                self.lifecycle("stop", &err.to_string(), LifecycleOutcome::Fault);
                Err(err.into())
            }
        }
    }

    fn context(&self) -> LogContext<'_> {
        LogContext::new()
            .with_suite(&self.name)
            .with_phase(self.phase.as_str())
    }

    fn lifecycle(&self, event: &str, message: &str, outcome: LifecycleOutcome) {
        log_lifecycle_event(Some(&self.context()), event, message, outcome);
    }

    fn advance(&mut self, next: SuitePhase, operation: &'static str) -> HarnessResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(self.misuse(operation));
        }
        harness_info!(context = self.context(), "{} -> {}", self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Phase misuse is a setup failure; during setup it also aborts the run.
    fn misuse(&mut self, operation: &'static str) -> HarnessError {
        let err = SetupFailure::PhaseViolation {
            operation,
            phase: self.phase,
        };
        if self.phase.is_setup() {
            self.abort(err.into())
        } else {
            err.into()
        }
    }

    /// Drop everything acquired so far and park the suite in `Aborted`.
    ///
    /// Dropping is enough to release resources: the manager handle cancels
    /// its loop, children are killed on drop, and the control plane and
    /// scratch directory go with the environment.
    fn abort(&mut self, err: HarnessError) -> HarnessError {
        if !self.phase.can_transition_to(SuitePhase::Aborted) {
            return err;
        }
        self.lifecycle("abort", &err.to_string(), LifecycleOutcome::Fault);
        if let Some(manager) = self.manager.take() {
            manager.client().revoke();
        }
        self.handle = None;
        self.environment = None;
        self.scheme = None;
        self.cancel.cancel();
        self.client.revoke();
        self.client = Client::invalid();
        self.report.setup_failure = Some(err.to_string());
        self.phase = SuitePhase::Aborted;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_out_of_order_are_setup_failures() {
        let mut suite = SuiteState::new("order", HarnessConfig::default());
        assert!(!suite.client().is_valid());

        let err = suite
            .build_manager(ReconcilerConfig::default(), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SetupFailure);
        // Not yet in a setup phase, so nothing to abort.
        assert_eq!(suite.phase(), SuitePhase::NotStarted);

        let status = suite.run_spec("too early", |_| async { Ok(()) }).await;
        assert!(matches!(status, SpecStatus::Skipped(_)));
    }

    #[tokio::test]
    async fn stopping_an_unstarted_suite_is_clean() {
        let mut suite = SuiteState::new("idle", HarnessConfig::default());
        suite.stop().await.unwrap();
        assert_eq!(suite.phase(), SuitePhase::Stopped);
        let again = suite.stop().await.unwrap_err();
        assert_eq!(again.kind(), crate::ErrorKind::SetupFailure);
    }
}
