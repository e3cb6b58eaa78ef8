//! ---
//! envtest_section: "15-testing-qa-runbook"
//! envtest_subsection: "integration-tests"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Shared TrainingJob type, reconciler, and suite configuration for end-to-end tests."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use envtest_common::{ControlPlaneConfig, HarnessConfig, ManagerConfig, SetupConfig, TeardownConfig};
use envtest_runtime::{
    async_trait, Action, ReconcileContext, ReconcileError, Reconciler, Request, Resource, SchemeBuilder,
};
use envtest_schema::ObjectMeta;
use serde::{Deserialize, Serialize};

pub fn fixture(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(relative)
}

/// Harness settings tuned for a fast local run against `schemas`.
pub fn suite_config(schemas: PathBuf) -> HarnessConfig {
    HarnessConfig {
        control_plane: ControlPlaneConfig {
            error_if_schema_path_missing: true,
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
            ..ControlPlaneConfig::default()
        }
        .with_schema_directory(schemas),
        setup: SetupConfig {
            timeout: Duration::from_secs(30),
        },
        teardown: TeardownConfig {
            grace_period: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
        },
        manager: ManagerConfig {
            watch_timeout: Duration::from_secs(1),
            requeue_backoff: Duration::from_millis(20),
            ..ManagerConfig::default()
        },
        ..HarnessConfig::default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobSpec {
    pub workers: i64,
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobStatus {
    pub phase: String,
    pub active_workers: i64,
    pub observed_generation: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingJob {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TrainingJobSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TrainingJobStatus>,
}

impl Resource for TrainingJob {
    const GROUP: &'static str = "training.example.io";
    const VERSION: &'static str = "v1alpha1";
    const KIND: &'static str = "TrainingJob";
    const PLURAL: &'static str = "trainingjobs";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl TrainingJob {
    pub fn new(name: &str, workers: i64) -> Self {
        Self {
            metadata: ObjectMeta::namespaced("default", name),
            spec: TrainingJobSpec {
                workers,
                image: "trainer:latest".to_owned(),
            },
            status: None,
        }
    }
}

pub fn scheme() -> SchemeBuilder {
    SchemeBuilder::new().register::<TrainingJob>()
}

/// Marks a job running with one active worker per requested worker.
pub struct TrainingJobReconciler;

#[async_trait]
impl Reconciler<TrainingJob> for TrainingJobReconciler {
    async fn reconcile(&self, ctx: &ReconcileContext, request: Request) -> Result<Action, ReconcileError> {
        let mut job = match ctx.client.get::<TrainingJob>(&request.key).await {
            Ok(job) => job,
            Err(err) if err.is_not_found() => return Ok(Action::Done),
            Err(err) => return Err(err.into()),
        };
        let desired = TrainingJobStatus {
            phase: if job.spec.workers > 0 { "Running" } else { "Pending" }.to_owned(),
            active_workers: job.spec.workers.max(0),
            observed_generation: job.metadata.generation.unwrap_or_default(),
        };
        if job.status.as_ref() != Some(&desired) {
            job.status = Some(desired);
            ctx.client.update_status(&job).await?;
        }
        Ok(Action::Done)
    }
}
