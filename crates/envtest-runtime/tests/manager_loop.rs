//! ---
//! envtest_section: "15-testing-qa-runbook"
//! envtest_subsection: "integration-tests"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Manager and client exercised against a live in-memory control plane."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use envtest_apiserver::{ControlPlane, RunningControlPlane};
use envtest_common::ManagerConfig;
use envtest_runtime::{
    async_trait, Action, Client, ClientError, ConnectionConfig, Manager, ManagerError, ReconcileContext,
    ReconcileError, Reconciler, ReconcilerConfig, Request, Resource, SchemeBuilder,
};
use envtest_schema::{CustomResourceDefinition, ObjectKey, ObjectMeta};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GadgetSpec {
    replicas: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct GadgetStatus {
    ready_replicas: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Gadget {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: GadgetSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<GadgetStatus>,
}

impl Resource for Gadget {
    const GROUP: &'static str = "runtime.example.io";
    const VERSION: &'static str = "v1";
    const KIND: &'static str = "Gadget";
    const PLURAL: &'static str = "gadgets";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

fn gadget_crd() -> CustomResourceDefinition {
    serde_json::from_value(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": "gadgets.runtime.example.io"},
        "spec": {
            "group": "runtime.example.io",
            "names": {"kind": "Gadget", "plural": "gadgets"},
            "scope": "Namespaced",
            "versions": [{"name": "v1", "served": true, "storage": true, "subresources": {"status": {}}}]
        }
    }))
    .expect("fixture definition")
}

/// Mirrors `spec.replicas` into `status.ready_replicas`.
struct MirrorReplicas {
    passes: Arc<AtomicUsize>,
}

#[async_trait]
impl Reconciler<Gadget> for MirrorReplicas {
    async fn reconcile(&self, ctx: &ReconcileContext, request: Request) -> Result<Action, ReconcileError> {
        self.passes.fetch_add(1, Ordering::SeqCst);
        let mut gadget = match ctx.client.get::<Gadget>(&request.key).await {
            Ok(gadget) => gadget,
            Err(err) if err.is_not_found() => return Ok(Action::Done),
            Err(err) => return Err(err.into()),
        };
        let desired = GadgetStatus {
            ready_replicas: gadget.spec.replicas,
        };
        if gadget.status.as_ref() != Some(&desired) {
            gadget.status = Some(desired);
            ctx.client.update_status(&gadget).await?;
        }
        Ok(Action::Done)
    }
}

struct Explodes;

#[async_trait]
impl Reconciler<Gadget> for Explodes {
    async fn reconcile(&self, _ctx: &ReconcileContext, _request: Request) -> Result<Action, ReconcileError> {
        panic!("reconciler blew up");
    }
}

async fn control_plane() -> anyhow::Result<(RunningControlPlane, ConnectionConfig)> {
    let plane = ControlPlane::bind("127.0.0.1:0".parse()?).await?.spawn();
    plane.store().install_definition(gadget_crd())?;
    let connection = ConnectionConfig::new(Url::parse(&plane.base_url())?);
    Ok((plane, connection))
}

fn manager_options() -> ManagerConfig {
    ManagerConfig {
        watch_timeout: Duration::from_secs(1),
        requeue_backoff: Duration::from_millis(20),
        ..ManagerConfig::default()
    }
}

async fn wait_for_status(client: &Client, key: &ObjectKey, replicas: i64) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let gadget: Gadget = client.get(key).await?;
        if gadget.status.map(|status| status.ready_replicas) == Some(replicas) {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("status never reached {replicas} replicas");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciler_converges_created_and_updated_objects() -> anyhow::Result<()> {
    let (plane, connection) = control_plane().await?;
    let scheme = Arc::new(SchemeBuilder::new().register::<Gadget>().build()?);
    let passes = Arc::new(AtomicUsize::new(0));

    let mut manager = Manager::build(connection, scheme, manager_options(), ReconcilerConfig::default())?;
    manager.add_reconciler::<Gadget, _>(MirrorReplicas {
        passes: Arc::clone(&passes),
    })?;
    let client = manager.client();
    let handle = manager.start(CancellationToken::new());
    handle.wait_until_synced(Duration::from_secs(5)).await?;

    let created = client
        .create(&Gadget {
            metadata: ObjectMeta::namespaced("default", "g1"),
            spec: GadgetSpec { replicas: 2 },
            status: None,
        })
        .await?;
    assert_eq!(created.metadata.generation, Some(1));
    wait_for_status(&client, &created.key(), 2).await?;

    let mut current: Gadget = client.get(&created.key()).await?;
    current.spec.replicas = 5;
    let updated = client.update(&current).await?;
    assert_eq!(updated.metadata.generation, Some(2));
    wait_for_status(&client, &created.key(), 5).await?;
    assert!(passes.load(Ordering::SeqCst) >= 2);

    let stale = client.update(&current).await.unwrap_err();
    assert!(stale.is_conflict(), "{stale}");

    handle.check()?;
    handle.shutdown(Duration::from_secs(5)).await?;
    assert!(matches!(
        client.get::<Gadget>(&created.key()).await,
        Err(ClientError::Invalidated)
    ));
    plane.stop(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciler_panic_fails_the_run_loop() -> anyhow::Result<()> {
    let (plane, connection) = control_plane().await?;
    let scheme = Arc::new(SchemeBuilder::new().register::<Gadget>().build()?);
    let mut manager = Manager::build(connection, scheme, manager_options(), ReconcilerConfig::default())?;
    manager.add_reconciler::<Gadget, _>(Explodes)?;
    let client = manager.client();
    let handle = manager.start(CancellationToken::new());
    handle.wait_until_synced(Duration::from_secs(5)).await?;

    client
        .create(&Gadget {
            metadata: ObjectMeta::namespaced("default", "boom"),
            ..Gadget::default()
        })
        .await?;

    let failure = tokio::time::timeout(Duration::from_secs(10), handle.failed())
        .await?
        .ok_or_else(|| anyhow::anyhow!("run loop stopped without a failure"))?;
    assert!(failure.contains("reconciler blew up"), "{failure}");
    assert!(matches!(handle.check(), Err(ManagerError::RunLoop(_))));

    let shutdown = handle.shutdown(Duration::from_secs(5)).await;
    assert!(matches!(shutdown, Err(ManagerError::ReconcilerPanic { .. })));
    assert!(!client.is_valid());
    plane.stop(Duration::from_secs(5)).await?;
    Ok(())
}
