//! ---
//! envtest_section: "04-configuration-orchestration"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Per-kind watch loop and de-duplicating work queue."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use envtest_common::ManagerConfig;
use envtest_schema::{ObjectKey, WatchEvent};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientError};
use crate::manager::ManagerError;
use crate::reconciler::{Action, ReconcileContext, Reconciler, ReconcilerConfig, Request};
use crate::resource::Resource;

#[derive(Debug, Default)]
struct QueueState {
    /// Queued and not yet picked up.
    pending: HashSet<Request>,
    /// Being reconciled right now.
    active: HashSet<Request>,
    /// Added again while active; re-queued when the pass finishes.
    dirty: HashSet<Request>,
}

/// Work queue that holds each request at most once.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    tx: mpsc::UnboundedSender<Request>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Request>>,
    state: Mutex<QueueState>,
    closed: CancellationToken,
}

impl WorkQueue {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: AsyncMutex::new(rx),
            state: Mutex::new(QueueState::default()),
            closed: CancellationToken::new(),
        })
    }

    pub(crate) fn add(&self, request: Request) {
        if self.closed.is_cancelled() {
            return;
        }
        let mut state = self.state.lock();
        if state.active.contains(&request) {
            state.dirty.insert(request);
            return;
        }
        if state.pending.insert(request.clone()) {
            let _ = self.tx.send(request);
        }
    }

    pub(crate) fn add_after(self: &Arc<Self>, request: Request, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.closed.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(request),
            }
        });
    }

    /// Next request to process, or `None` once the queue is shut down.
    pub(crate) async fn next(&self) -> Option<Request> {
        let mut rx = self.rx.lock().await;
        let request = tokio::select! {
            _ = self.closed.cancelled() => None,
            request = rx.recv() => request,
        }?;
        let mut state = self.state.lock();
        state.pending.remove(&request);
        state.active.insert(request.clone());
        Some(request)
    }

    pub(crate) fn done(&self, request: &Request) {
        let requeue = {
            let mut state = self.state.lock();
            state.active.remove(request);
            state.dirty.remove(request)
        };
        if requeue {
            self.add(request.clone());
        }
    }

    pub(crate) fn shutdown(&self) {
        self.closed.cancel();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// Shared inputs of every controller run by one manager.
#[derive(Clone)]
pub(crate) struct ControllerRuntime {
    pub client: Client,
    pub options: ManagerConfig,
    pub reconciler_config: Arc<ReconcilerConfig>,
    pub cancel: CancellationToken,
    pub synced: Arc<watch::Sender<usize>>,
}

/// Type-erased controller so the manager can hold controllers for many kinds.
pub(crate) trait RunController: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, runtime: ControllerRuntime) -> BoxFuture<'static, Result<(), ManagerError>>;
}

pub(crate) struct TypedController<K: Resource> {
    name: String,
    reconciler: Arc<dyn Reconciler<K>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Resource> TypedController<K> {
    pub(crate) fn new(name: String, reconciler: Arc<dyn Reconciler<K>>) -> Self {
        Self {
            name,
            reconciler,
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> RunController for TypedController<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, runtime: ControllerRuntime) -> BoxFuture<'static, Result<(), ManagerError>> {
        Box::pin(run_controller::<K>(
            self.name.clone(),
            Arc::clone(&self.reconciler),
            runtime,
        ))
    }
}

fn request_for(object: &Value) -> Option<Request> {
    let name = object.pointer("/metadata/name")?.as_str()?;
    let namespace = object
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(str::to_owned);
    Some(Request::new(ObjectKey {
        namespace,
        name: name.to_owned(),
    }))
}

fn request_for_event(event: &WatchEvent) -> Option<Request> {
    request_for(&event.object)
}

pub(crate) fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// List everything, queue it, and return the revision to watch from.
async fn relist<K: Resource>(
    client: &Client,
    namespace: Option<&str>,
    queue: &WorkQueue,
) -> Result<String, ClientError> {
    let list = client.list_raw(&K::gvr(), namespace).await?;
    for item in &list.items {
        if let Some(request) = request_for(item) {
            queue.add(request);
        }
    }
    Ok(list.metadata.resource_version)
}

async fn run_controller<K: Resource>(
    name: String,
    reconciler: Arc<dyn Reconciler<K>>,
    runtime: ControllerRuntime,
) -> Result<(), ManagerError> {
    let ControllerRuntime {
        client,
        options,
        reconciler_config,
        cancel,
        synced,
    } = runtime;
    let namespace = options.namespace.clone();
    let queue = WorkQueue::new();
    let context = Arc::new(ReconcileContext {
        controller: name.clone(),
        client: client.clone(),
        config: Arc::clone(&reconciler_config),
        cancel: cancel.clone(),
    });

    let mut workers = JoinSet::new();
    for worker in 0..reconciler_config.max_concurrent_reconciles.max(1) {
        workers.spawn(run_worker(
            worker,
            Arc::clone(&queue),
            Arc::clone(&reconciler),
            Arc::clone(&context),
            options.requeue_backoff,
        ));
    }

    let gvr = K::gvr();
    let mut failures: u32 = 0;
    let mut has_synced = false;
    let mut resource_version: Option<String> = None;
    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        let step = match resource_version.as_deref() {
            None => tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                listed = relist::<K>(&client, namespace.as_deref(), &queue) => listed.map(Some),
            },
            Some(since) => tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                joined = workers.join_next() => {
                    let message = match joined {
                        Some(Err(err)) => panic_message(err),
                        _ => "worker exited unexpectedly".to_owned(),
                    };
                    error!(controller = %name, %message, "reconciler worker died");
                    break Err(ManagerError::ReconcilerPanic { controller: name.clone(), message });
                }
                watched = client.watch_raw(&gvr, namespace.as_deref(), since, options.watch_timeout) => {
                    match watched {
                        Ok(batch) => {
                            for event in &batch.events {
                                if let Some(request) = request_for_event(event) {
                                    debug!(controller = %name, object = %request.key, event = ?event.event_type, "change observed");
                                    queue.add(request);
                                }
                            }
                            Ok(Some(batch.resource_version))
                        }
                        Err(err) if err.is_expired() => {
                            warn!(controller = %name, "watch history expired; relisting");
                            Ok(None)
                        }
                        Err(err) => Err(err),
                    }
                }
            },
        };

        match step {
            Ok(Some(rv)) => {
                failures = 0;
                if !has_synced {
                    has_synced = true;
                    synced.send_modify(|count| *count += 1);
                    info!(controller = %name, resource_version = %rv, "initial list complete");
                }
                resource_version = Some(rv);
            }
            Ok(None) => resource_version = None,
            Err(ClientError::Invalidated) => {
                debug!(controller = %name, "client revoked; stopping watch");
                break Ok(());
            }
            Err(err) => {
                failures += 1;
                warn!(controller = %name, error = %err, failures, "watch request failed");
                if failures >= options.max_watch_failures {
                    break Err(ManagerError::WatchFailed {
                        controller: name.clone(),
                        attempts: failures,
                        message: err.to_string(),
                    });
                }
                tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(options.requeue_backoff) => {}
                }
            }
        }
    };

    queue.shutdown();
    if result.is_err() {
        workers.abort_all();
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                let message = panic_message(err);
                error!(controller = %name, %message, "reconciler panicked during shutdown");
                if result.is_ok() {
                    return Err(ManagerError::ReconcilerPanic {
                        controller: name,
                        message,
                    });
                }
            }
        }
    }
    debug!(controller = %name, ok = result.is_ok(), "controller loop exited");
    result
}

async fn run_worker<K: Resource>(
    worker: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler<K>>,
    context: Arc<ReconcileContext>,
    backoff: Duration,
) {
    while let Some(request) = queue.next().await {
        let outcome = reconciler.reconcile(&context, request.clone()).await;
        queue.done(&request);
        match outcome {
            Ok(Action::Done) => {
                debug!(controller = %context.controller, worker, object = %request.key, "reconciled");
            }
            Ok(Action::RequeueAfter(delay)) => queue.add_after(request, delay),
            Err(err) => {
                warn!(controller = %context.controller, worker, object = %request.key, error = %err, "reconcile failed; requeueing");
                queue.add_after(request, backoff);
            }
        }
    }
}
