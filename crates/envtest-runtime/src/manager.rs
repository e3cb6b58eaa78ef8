//! ---
//! envtest_section: "04-configuration-orchestration"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Reconciliation manager: build, background run loop, bounded shutdown."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! The manager owns one controller per registered reconciler and runs them on
//! a background task. Building is synchronous; the run loop only starts with
//! [`Manager::start`], which hands back a [`ManagerHandle`] for observing and
//! stopping it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use envtest_common::ManagerConfig;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientError, ConnectionConfig};
use crate::controller::{panic_message, ControllerRuntime, RunController, TypedController};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::resource::Resource;
use crate::scheme::{Scheme, SchemeError};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("invalid manager configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Scheme(#[from] SchemeError),
    #[error("a controller named {0} is already registered")]
    DuplicateController(String),
    #[error("controller {controller} gave up after {attempts} failed watch attempts: {message}")]
    WatchFailed {
        controller: String,
        attempts: u32,
        message: String,
    },
    #[error("reconciler for {controller} panicked: {message}")]
    ReconcilerPanic { controller: String, message: String },
    #[error("manager run loop failed: {0}")]
    RunLoop(String),
    #[error("manager did not stop within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("controllers did not finish their initial list within {0:?}")]
    SyncTimeout(Duration),
    #[error("manager task panicked: {0}")]
    TaskPanicked(String),
    #[error("manager stopped")]
    Stopped,
}

/// Observable state of the background run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerStatus {
    Starting,
    Running,
    Stopped,
    Failed(String),
}

impl ManagerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ManagerStatus::Stopped | ManagerStatus::Failed(_))
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            ManagerStatus::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// A manager that has been built but not started.
pub struct Manager {
    client: Client,
    scheme: Arc<Scheme>,
    options: ManagerConfig,
    reconciler_config: ReconcilerConfig,
    controllers: Vec<Box<dyn RunController>>,
    names: HashSet<String>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("client", &self.client)
            .field("controllers", &self.names)
            .finish()
    }
}

impl Manager {
    /// Construct a manager bound to `connection`. Nothing runs until [`Manager::start`].
    pub fn build(
        connection: ConnectionConfig,
        scheme: Arc<Scheme>,
        options: ManagerConfig,
        reconciler_config: ReconcilerConfig,
    ) -> Result<Self, ManagerError> {
        options
            .validate()
            .map_err(|err| ManagerError::Config(err.to_string()))?;
        if reconciler_config.max_concurrent_reconciles == 0 {
            return Err(ManagerError::Config(
                "max_concurrent_reconciles must be at least 1".into(),
            ));
        }
        if !matches!(connection.host.scheme(), "http" | "https") {
            return Err(ManagerError::Config(format!(
                "unsupported control plane scheme '{}'",
                connection.host.scheme()
            )));
        }
        let host = connection.host.to_string();
        let client =
            Client::with_revocation(connection, Arc::clone(&scheme), CancellationToken::new())?;
        debug!(host = %host, types = scheme.len(), "manager built");
        Ok(Self {
            client,
            scheme,
            options,
            reconciler_config,
            controllers: Vec::new(),
            names: HashSet::new(),
        })
    }

    /// Register a reconciler for kind `K`. `K` must already be in the scheme.
    pub fn add_reconciler<K, R>(&mut self, reconciler: R) -> Result<&mut Self, ManagerError>
    where
        K: Resource,
        R: Reconciler<K>,
    {
        self.scheme.registration::<K>()?;
        let name = format!("{}.{}", K::PLURAL, K::GROUP);
        if !self.names.insert(name.clone()) {
            return Err(ManagerError::DuplicateController(name));
        }
        info!(controller = %name, "reconciler registered");
        self.controllers
            .push(Box::new(TypedController::<K>::new(name, Arc::new(reconciler))));
        Ok(self)
    }

    /// Client bound to this manager; it stays valid until the manager is shut down.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn scheme(&self) -> Arc<Scheme> {
        Arc::clone(&self.scheme)
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Launch the run loop on its own task. It runs until `cancel` fires or a
    /// controller fails; a failure stops every other controller as well.
    pub fn start(self, cancel: CancellationToken) -> ManagerHandle {
        let Manager {
            client,
            options,
            reconciler_config,
            controllers,
            ..
        } = self;
        let cancel = cancel.child_token();
        let (status_tx, status_rx) = watch::channel(ManagerStatus::Starting);
        let (synced_tx, synced_rx) = watch::channel(0usize);
        let runtime = ControllerRuntime {
            client: client.clone(),
            options,
            reconciler_config: Arc::new(reconciler_config),
            cancel: cancel.clone(),
            synced: Arc::new(synced_tx),
        };
        let expected = controllers.len();
        let task = tokio::spawn(run_manager(controllers, runtime, status_tx));
        ManagerHandle {
            client,
            cancel,
            status: status_rx,
            synced: synced_rx,
            controllers: expected,
            task: Some(task),
        }
    }
}

async fn run_manager(
    controllers: Vec<Box<dyn RunController>>,
    runtime: ControllerRuntime,
    status: watch::Sender<ManagerStatus>,
) -> Result<(), ManagerError> {
    let cancel = runtime.cancel.clone();
    let mut tasks = JoinSet::new();
    for controller in &controllers {
        let name = controller.name().to_owned();
        let run = controller.run(runtime.clone());
        debug!(controller = %name, "starting controller");
        tasks.spawn(async move { (name, run.await) });
    }
    status.send_replace(ManagerStatus::Running);
    info!(controllers = controllers.len(), "manager running");

    if tasks.is_empty() {
        cancel.cancelled().await;
    }

    let mut outcome = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok((name, result)) => {
                debug!(controller = %name, ok = result.is_ok(), "controller exited");
                result
            }
            Err(err) => Err(ManagerError::TaskPanicked(panic_message(err))),
        };
        if let Err(err) = result {
            if outcome.is_ok() {
                error!(error = %err, "controller failed; stopping manager");
                status.send_replace(ManagerStatus::Failed(err.to_string()));
                cancel.cancel();
                outcome = Err(err);
            } else {
                warn!(error = %err, "additional controller failure");
            }
        }
    }

    if outcome.is_ok() {
        status.send_replace(ManagerStatus::Stopped);
        info!("manager stopped");
    }
    outcome
}

const UNREPORTED_EXIT: &str = "manager run loop ended without reporting a final status";

/// A running manager. Dropping it cancels the loop and invalidates its client.
#[derive(Debug)]
pub struct ManagerHandle {
    client: Client,
    cancel: CancellationToken,
    status: watch::Receiver<ManagerStatus>,
    synced: watch::Receiver<usize>,
    controllers: usize,
    task: Option<JoinHandle<Result<(), ManagerError>>>,
}

impl ManagerHandle {
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn status(&self) -> ManagerStatus {
        self.status.borrow().clone()
    }

    /// Non-blocking check for a captured run-loop failure.
    pub fn check(&self) -> Result<(), ManagerError> {
        let closed = self.status.has_changed().is_err();
        match &*self.status.borrow() {
            ManagerStatus::Failed(message) => Err(ManagerError::RunLoop(message.clone())),
            status if closed && !status.is_terminal() => {
                Err(ManagerError::RunLoop(UNREPORTED_EXIT.to_owned()))
            }
            _ => Ok(()),
        }
    }

    /// Resolve once the loop has ended. Returns the failure message, or `None`
    /// when the loop stopped cleanly.
    pub async fn failed(&self) -> Option<String> {
        let mut status = self.status.clone();
        let ended = status
            .wait_for(ManagerStatus::is_terminal)
            .await
            .map(|current| (*current).clone());
        match ended {
            Ok(current) => current.failure().map(str::to_owned),
            // The loop task is gone (panicked or aborted) without a final status.
            Err(_) => match &*self.status.borrow() {
                ManagerStatus::Stopped => None,
                ManagerStatus::Failed(message) => Some(message.clone()),
                _ => Some(UNREPORTED_EXIT.to_owned()),
            },
        }
    }

    /// Wait until every controller has completed its initial list.
    pub async fn wait_until_synced(&self, timeout: Duration) -> Result<(), ManagerError> {
        let expected = self.controllers;
        let mut synced = self.synced.clone();
        let mut status = self.status.clone();
        let wait = async {
            tokio::select! {
                reached = synced.wait_for(|count| *count >= expected) => {
                    reached.map(|_| ()).map_err(|_| ManagerError::Stopped)
                }
                ended = status.wait_for(ManagerStatus::is_terminal) => {
                    let ended = ended.map(|current| (*current).clone());
                    match ended {
                        Ok(ManagerStatus::Failed(message)) => Err(ManagerError::RunLoop(message)),
                        _ => Err(ManagerError::Stopped),
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ManagerError::SyncTimeout(timeout))?
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the loop and wait up to `grace` for it to finish. The task is
    /// aborted when the grace period runs out. The client is revoked either way.
    pub async fn shutdown(mut self, grace: Duration) -> Result<(), ManagerError> {
        self.cancel.cancel();
        let outcome = match self.task.take() {
            None => Ok(()),
            Some(mut task) => match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => Err(ManagerError::TaskPanicked(panic_message(err))),
                Err(_) => {
                    warn!(grace_ms = grace.as_millis() as u64, "manager ignored cancellation; aborting");
                    task.abort();
                    Err(ManagerError::ShutdownTimeout(grace))
                }
            },
        };
        self.client.revoke();
        outcome
    }
}

impl Drop for ManagerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.client.revoke();
    }
}
