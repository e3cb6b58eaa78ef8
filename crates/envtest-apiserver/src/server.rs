//! ---
//! envtest_section: "05-networking-external-interfaces"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "HTTP surface of the in-memory control plane."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use envtest_schema::{
    ApiResourceList, CustomResourceDefinition, GroupVersionResource, ListMeta, ObjectKey,
    ObjectList, WatchList, CRD_API_VERSION, CRD_GROUP, CRD_PLURAL, CRD_VERSION,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::store::{ObjectStore, StoreError};

/// Upper bound for a single long-poll watch request.
const MAX_WATCH_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind control plane to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("control plane i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("control plane did not stop within {0:?}")]
    StopTimeout(Duration),
    #[error("control plane task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A bound but not yet serving control plane.
pub struct ControlPlane {
    listener: TcpListener,
    address: SocketAddr,
    store: Arc<ObjectStore>,
}

impl ControlPlane {
    /// Bind the listener. A port already in use is reported, not retried.
    pub async fn bind(address: SocketAddr) -> Result<Self, ServerError> {
        Self::bind_with_store(address, Arc::new(ObjectStore::new())).await
    }

    pub async fn bind_with_store(
        address: SocketAddr,
        store: Arc<ObjectStore>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind { address, source })?;
        let address = listener.local_addr()?;
        Ok(Self {
            listener,
            address,
            store,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn store(&self) -> Arc<ObjectStore> {
        Arc::clone(&self.store)
    }

    /// Start serving on a background task.
    pub fn spawn(self) -> RunningControlPlane {
        let cancel = CancellationToken::new();
        let router = router(Arc::clone(&self.store));
        let shutdown = cancel.clone();
        let address = self.address;
        let server = axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        let task = tokio::spawn(async move {
            let result = server.await;
            if let Err(err) = &result {
                warn!(address = %address, error = %err, "control plane exited with error");
            }
            result
        });
        info!(address = %self.address, "control plane listening");

        RunningControlPlane {
            address: self.address,
            store: self.store,
            guard: cancel.drop_guard(),
            task,
        }
    }
}

/// Handle to a serving control plane. Dropping it stops the server.
pub struct RunningControlPlane {
    address: SocketAddr,
    store: Arc<ObjectStore>,
    guard: DropGuard,
    task: JoinHandle<std::io::Result<()>>,
}

impl std::fmt::Debug for RunningControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningControlPlane")
            .field("address", &self.address)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl RunningControlPlane {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// `http://<address>` base URL for clients.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn store(&self) -> Arc<ObjectStore> {
        Arc::clone(&self.store)
    }

    /// Stop accepting connections and wait for in-flight requests, bounded by `timeout`.
    pub async fn stop(self, timeout: Duration) -> Result<(), ServerError> {
        let RunningControlPlane {
            address,
            guard,
            mut task,
            ..
        } = self;
        drop(guard);
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => {
                joined??;
                info!(address = %address, "control plane stopped");
                Ok(())
            }
            Err(_) => {
                task.abort();
                warn!(address = %address, ?timeout, "control plane stop timed out; task aborted");
                Err(ServerError::StopTimeout(timeout))
            }
        }
    }
}

#[derive(Clone)]
struct ApiState {
    store: Arc<ObjectStore>,
}

/// Routes served by the control plane.
pub fn router(store: Arc<ObjectStore>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(healthz))
        .route("/version", get(version))
        .route("/apis", get(discovery))
        .route("/apis/*path", any(dispatch))
        .with_state(ApiState { store })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn version() -> Json<Value> {
    Json(json!({ "gitVersion": concat!("v", env!("CARGO_PKG_VERSION")), "platform": "envtest" }))
}

async fn discovery(State(state): State<ApiState>) -> Json<ApiResourceList> {
    Json(ApiResourceList::new(state.store.discovery()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    watch: Option<bool>,
    #[serde(default)]
    resource_version: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

/// Request path below `/apis/`, split into its addressing parts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResourcePath {
    gvr: GroupVersionResource,
    namespace: Option<String>,
    name: Option<String>,
    status: bool,
}

impl ResourcePath {
    fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (group, version, mut rest) = match segments.as_slice() {
            [group, version, rest @ ..] if !rest.is_empty() => (*group, *version, rest),
            _ => return None,
        };
        let mut namespace = None;
        if rest.len() >= 3 && rest[0] == "namespaces" {
            namespace = Some(rest[1].to_owned());
            rest = &rest[2..];
        }
        let (plural, name, status) = match rest {
            [plural] => (*plural, None, false),
            [plural, name] => (*plural, Some((*name).to_owned()), false),
            [plural, name, "status"] => (*plural, Some((*name).to_owned()), true),
            _ => return None,
        };
        Some(Self {
            gvr: GroupVersionResource::new(group, version, plural),
            namespace,
            name,
            status,
        })
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: name.to_owned(),
        }
    }

    fn is_definitions(&self) -> bool {
        self.gvr.group == CRD_GROUP && self.gvr.version == CRD_VERSION && self.gvr.resource == CRD_PLURAL
    }
}

struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_status();
        let code = StatusCode::from_u16(status.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (code, Json(status)).into_response()
    }
}

fn method_not_allowed(method: &Method, path: &str) -> Response {
    let status = envtest_schema::Status::failure(
        envtest_schema::StatusReason::MethodNotAllowed,
        format!("{method} is not supported on {path}"),
    );
    (StatusCode::METHOD_NOT_ALLOWED, Json(status)).into_response()
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError(StoreError::BadRequest(format!("malformed request body: {err}"))))
}

async fn dispatch(
    State(state): State<ApiState>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<ListQuery>,
    body: Bytes,
) -> Response {
    debug!(%method, path = %path, "api request");
    let Some(target) = ResourcePath::parse(&path) else {
        return ApiError(StoreError::UnknownResource(path)).into_response();
    };
    let result = if target.is_definitions() {
        definitions(&state, &method, &target, &body)
    } else {
        objects(&state, &method, &target, query, &body).await
    };
    match result {
        Ok(Some(response)) => response,
        Ok(None) => method_not_allowed(&method, &path),
        Err(err) => err.into_response(),
    }
}

fn definitions(
    state: &ApiState,
    method: &Method,
    target: &ResourcePath,
    body: &Bytes,
) -> Result<Option<Response>, ApiError> {
    let response = match (method, target.name.as_deref()) {
        (&Method::GET, None) => {
            let items = state
                .store
                .definitions()
                .into_iter()
                .filter_map(|crd| serde_json::to_value(crd).ok())
                .collect();
            Json(ObjectList {
                api_version: CRD_API_VERSION.to_owned(),
                kind: "CustomResourceDefinitionList".to_owned(),
                metadata: ListMeta {
                    resource_version: state.store.revision().to_string(),
                },
                items,
            })
            .into_response()
        }
        (&Method::POST, None) => {
            let crd: CustomResourceDefinition = parse_body(body)?;
            let installed = state.store.install_definition(crd)?;
            (StatusCode::CREATED, Json(installed)).into_response()
        }
        (&Method::GET, Some(name)) => Json(state.store.definition(name)?).into_response(),
        _ => return Ok(None),
    };
    Ok(Some(response))
}

async fn objects(
    state: &ApiState,
    method: &Method,
    target: &ResourcePath,
    query: ListQuery,
    body: &Bytes,
) -> Result<Option<Response>, ApiError> {
    let store = &state.store;
    let gvr = &target.gvr;
    let response = match (method, target.name.as_deref(), target.status) {
        (&Method::GET, None, _) if query.watch.unwrap_or(false) => {
            let watch = long_poll(store, target, &query).await?;
            Json(watch).into_response()
        }
        (&Method::GET, None, _) => {
            let resource = store.resolve(gvr)?;
            let (items, revision) = store.list(gvr, target.namespace.as_deref())?;
            Json(ObjectList {
                api_version: resource.gvk().api_version(),
                kind: format!("{}List", resource.kind),
                metadata: ListMeta {
                    resource_version: revision.to_string(),
                },
                items,
            })
            .into_response()
        }
        (&Method::POST, None, _) => {
            let object: Value = parse_body(body)?;
            let created = store.create(gvr, target.namespace.as_deref(), object)?;
            (StatusCode::CREATED, Json(created)).into_response()
        }
        (&Method::GET, Some(name), _) => Json(store.get(gvr, &target.key(name))?).into_response(),
        (&Method::PUT, Some(name), false) => {
            let object: Value = parse_body(body)?;
            Json(store.replace(gvr, &target.key(name), object)?).into_response()
        }
        (&Method::PUT, Some(name), true) => {
            let object: Value = parse_body(body)?;
            Json(store.replace_status(gvr, &target.key(name), object)?).into_response()
        }
        (&Method::DELETE, Some(name), false) => {
            Json(store.delete(gvr, &target.key(name))?).into_response()
        }
        _ => return Ok(None),
    };
    Ok(Some(response))
}

/// Wait until an event newer than `resourceVersion` exists or the timeout passes.
async fn long_poll(
    store: &ObjectStore,
    target: &ResourcePath,
    query: &ListQuery,
) -> Result<WatchList, ApiError> {
    let since = match query.resource_version.as_deref() {
        None | Some("") => store.revision(),
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            ApiError(StoreError::BadRequest(format!("invalid resourceVersion '{raw}'")))
        })?,
    };
    let timeout = query
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_WATCH_TIMEOUT)
        .min(MAX_WATCH_TIMEOUT);
    let deadline = tokio::time::Instant::now() + timeout;
    let mut revisions = store.subscribe();

    loop {
        let _ = revisions.borrow_and_update();
        let (events, revision) =
            store.events_since(&target.gvr, target.namespace.as_deref(), since)?;
        if !events.is_empty() {
            return Ok(WatchList {
                resource_version: revision.to_string(),
                events,
            });
        }
        let changed = tokio::time::timeout_at(deadline, revisions.changed()).await;
        if !matches!(changed, Ok(Ok(()))) {
            return Ok(WatchList {
                resource_version: since.max(revision).to_string(),
                events: Vec::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_item_paths() {
        let path =
            ResourcePath::parse("training.example.io/v1alpha1/namespaces/default/trainingjobs/a/status")
                .unwrap();
        assert_eq!(
            path.gvr,
            GroupVersionResource::new("training.example.io", "v1alpha1", "trainingjobs")
        );
        assert_eq!(path.namespace.as_deref(), Some("default"));
        assert_eq!(path.name.as_deref(), Some("a"));
        assert!(path.status);
    }

    #[test]
    fn parses_cluster_collections() {
        let path = ResourcePath::parse("apiextensions.k8s.io/v1/customresourcedefinitions").unwrap();
        assert!(path.is_definitions());
        assert!(path.namespace.is_none());
        assert!(path.name.is_none());
    }

    #[test]
    fn rejects_incomplete_paths() {
        assert!(ResourcePath::parse("training.example.io").is_none());
        assert!(ResourcePath::parse("training.example.io/v1").is_none());
        assert!(ResourcePath::parse("g/v/things/a/scale").is_none());
    }
}
