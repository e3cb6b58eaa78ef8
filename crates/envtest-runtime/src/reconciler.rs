//! ---
//! envtest_section: "04-configuration-orchestration"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Reconciler contract consumed by the manager."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envtest_schema::ObjectKey;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::client::{Client, ClientError};
use crate::resource::Resource;

fn default_max_concurrent_reconciles() -> usize {
    1
}

/// Controller settings handed to every reconciler unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,
    #[serde(default)]
    pub enable_gang_scheduling: bool,
    /// Free-form settings owned by the reconcilers.
    #[serde(default, flatten)]
    pub settings: IndexMap<String, Value>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: default_max_concurrent_reconciles(),
            enable_gang_scheduling: false,
            settings: IndexMap::new(),
        }
    }
}

impl ReconcilerConfig {
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

/// Identifies the object a reconcile pass is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub key: ObjectKey,
}

impl Request {
    pub fn new(key: ObjectKey) -> Self {
        Self { key }
    }
}

/// What the manager should do after a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Done,
    RequeueAfter(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{0}")]
    Failed(String),
}

impl ReconcileError {
    pub fn failed(message: impl Into<String>) -> Self {
        ReconcileError::Failed(message.into())
    }
}

/// Everything a reconciler may use during one pass.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub controller: String,
    pub client: Client,
    pub config: Arc<ReconcilerConfig>,
    /// Cancelled when the manager shuts down.
    pub cancel: CancellationToken,
}

/// Domain logic driving objects of kind `K` toward their desired state.
///
/// Returning an error requeues the request with backoff. A panic is treated
/// as an unrecoverable run-loop failure.
#[async_trait]
pub trait Reconciler<K: Resource>: Send + Sync + 'static {
    async fn reconcile(
        &self,
        ctx: &ReconcileContext,
        request: Request,
    ) -> Result<Action, ReconcileError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_keeps_unknown_settings() {
        let config: ReconcilerConfig = serde_json::from_value(json!({
            "enable_gang_scheduling": true,
            "gang_scheduler": "volcano"
        }))
        .unwrap();
        assert_eq!(config.max_concurrent_reconciles, 1);
        assert!(config.enable_gang_scheduling);
        assert_eq!(config.setting("gang_scheduler"), Some(&json!("volcano")));
    }
}
