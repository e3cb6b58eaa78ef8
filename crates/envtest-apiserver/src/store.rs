//! ---
//! envtest_section: "05-networking-external-interfaces"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Revisioned in-memory object store backing the control plane."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! Objects are grouped by `(group, plural)` so every served version of a
//! resource reads the same data; the `apiVersion` of returned objects is
//! rewritten to the version the caller asked for.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{SecondsFormat, Utc};
use envtest_schema::{
    ApiResource, CustomResourceDefinition, GroupVersionKind, GroupVersionResource, ObjectKey,
    Status, StatusReason, WatchEvent, WatchEventType,
};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// Number of change events retained for watchers.
pub const DEFAULT_HISTORY_LIMIT: usize = 4096;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures returned by [`ObjectStore`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("the server could not find the requested resource ({0})")]
    UnknownResource(String),
    #[error("{resource} \"{name}\" not found")]
    NotFound { resource: String, name: String },
    #[error("{resource} \"{name}\" already exists")]
    AlreadyExists { resource: String, name: String },
    #[error("operation cannot be fulfilled on {resource} \"{name}\": {message}")]
    Conflict {
        resource: String,
        name: String,
        message: String,
    },
    #[error("{0}")]
    Invalid(String),
    /// The watcher asked for history that has already been discarded.
    #[error("too old resource version: {requested} ({oldest})")]
    Expired { requested: u64, oldest: u64 },
    #[error("{0}")]
    BadRequest(String),
}

impl StoreError {
    pub fn reason(&self) -> StatusReason {
        match self {
            StoreError::UnknownResource(_) | StoreError::NotFound { .. } => StatusReason::NotFound,
            StoreError::AlreadyExists { .. } => StatusReason::AlreadyExists,
            StoreError::Conflict { .. } => StatusReason::Conflict,
            StoreError::Invalid(_) => StatusReason::Invalid,
            StoreError::Expired { .. } => StatusReason::Expired,
            StoreError::BadRequest(_) => StatusReason::BadRequest,
        }
    }

    pub fn to_status(&self) -> Status {
        Status::failure(self.reason(), self.to_string())
    }
}

type GroupResource = (String, String);

#[derive(Debug)]
struct HistoryEntry {
    revision: u64,
    group_resource: GroupResource,
    event: WatchEvent,
}

#[derive(Debug, Default)]
struct StoreInner {
    revision: u64,
    /// Events at or below this revision have been dropped from `history`.
    compacted: u64,
    definitions: IndexMap<String, CustomResourceDefinition>,
    resources: IndexMap<GroupVersionResource, ApiResource>,
    objects: HashMap<GroupResource, BTreeMap<ObjectKey, Value>>,
    history: VecDeque<HistoryEntry>,
}

impl StoreInner {
    fn resolve(&self, gvr: &GroupVersionResource) -> StoreResult<ApiResource> {
        self.resources
            .get(gvr)
            .cloned()
            .ok_or_else(|| StoreError::UnknownResource(gvr.to_string()))
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn record(&mut self, limit: usize, group_resource: GroupResource, event: WatchEvent) {
        self.history.push_back(HistoryEntry {
            revision: self.revision,
            group_resource,
            event,
        });
        while self.history.len() > limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }
    }
}

/// Thread-safe store of definitions and custom objects.
#[derive(Debug)]
pub struct ObjectStore {
    inner: RwLock<StoreInner>,
    history_limit: usize,
    revisions: watch::Sender<u64>,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let (revisions, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StoreInner::default()),
            history_limit: history_limit.max(1),
            revisions,
        }
    }

    /// Latest revision handed out.
    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    /// Receiver notified with the new revision after every write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }

    fn notify(&self, revision: u64) {
        self.revisions.send_replace(revision);
    }

    /// Install a definition and start serving its versions.
    pub fn install_definition(
        &self,
        mut crd: CustomResourceDefinition,
    ) -> StoreResult<CustomResourceDefinition> {
        crd.validate()
            .map_err(|err| StoreError::Invalid(err.to_string()))?;
        let revision = {
            let mut inner = self.inner.write();
            if inner.definitions.contains_key(crd.name()) {
                return Err(StoreError::AlreadyExists {
                    resource: envtest_schema::CRD_PLURAL.to_owned(),
                    name: crd.name().to_owned(),
                });
            }
            let revision = inner.next_revision();
            crd.metadata.uid = Some(Uuid::new_v4().to_string());
            crd.metadata.resource_version = Some(revision.to_string());
            crd.metadata.generation = Some(1);
            crd.metadata.creation_timestamp = Some(Utc::now());
            for resource in crd.api_resources() {
                inner.resources.insert(resource.gvr(), resource);
            }
            inner
                .objects
                .entry((crd.spec.group.clone(), crd.spec.names.plural.clone()))
                .or_default();
            inner.definitions.insert(crd.name().to_owned(), crd.clone());
            revision
        };
        info!(definition = %crd.name(), revision, "resource definition installed");
        self.notify(revision);
        Ok(crd)
    }

    pub fn definitions(&self) -> Vec<CustomResourceDefinition> {
        self.inner.read().definitions.values().cloned().collect()
    }

    pub fn definition(&self, name: &str) -> StoreResult<CustomResourceDefinition> {
        self.inner
            .read()
            .definitions
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: envtest_schema::CRD_PLURAL.to_owned(),
                name: name.to_owned(),
            })
    }

    /// Every served resource, in installation order.
    pub fn discovery(&self) -> Vec<ApiResource> {
        self.inner.read().resources.values().cloned().collect()
    }

    pub fn resolve(&self, gvr: &GroupVersionResource) -> StoreResult<ApiResource> {
        self.inner.read().resolve(gvr)
    }

    pub fn create(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        object: Value,
    ) -> StoreResult<Value> {
        let (stored, revision) = {
            let mut inner = self.inner.write();
            let resource = inner.resolve(gvr)?;
            let mut incoming = into_object(object)?;
            check_type(&resource, &mut incoming)?;
            let key = {
                let meta = metadata_mut(&mut incoming)?;
                assign_name(meta)?;
                let name = string_field(meta, "name").unwrap_or_default();
                let namespace = reconcile_namespace(meta, namespace)?;
                scoped_key(&resource, namespace, name)?
            };
            let group_resource = (resource.group.clone(), resource.plural.clone());
            let exists = inner
                .objects
                .get(&group_resource)
                .is_some_and(|objects| objects.contains_key(&key));
            if exists {
                return Err(StoreError::AlreadyExists {
                    resource: resource.plural.clone(),
                    name: key.name,
                });
            }
            if resource.status_subresource {
                incoming.remove("status");
            }
            let revision = inner.next_revision();
            let meta = metadata_mut(&mut incoming)?;
            meta.insert("uid".into(), Value::String(Uuid::new_v4().to_string()));
            meta.insert("generation".into(), Value::from(1));
            meta.insert("creationTimestamp".into(), Value::String(timestamp()));
            meta.insert("resourceVersion".into(), Value::String(revision.to_string()));
            let stored = Value::Object(incoming);
            inner
                .objects
                .entry(group_resource.clone())
                .or_default()
                .insert(key.clone(), stored.clone());
            inner.record(
                self.history_limit,
                group_resource,
                WatchEvent {
                    event_type: WatchEventType::Added,
                    object: stored.clone(),
                },
            );
            debug!(resource = %resource.plural, object = %key, revision, "object created");
            (stored, revision)
        };
        self.notify(revision);
        Ok(stored)
    }

    pub fn get(&self, gvr: &GroupVersionResource, key: &ObjectKey) -> StoreResult<Value> {
        let inner = self.inner.read();
        let resource = inner.resolve(gvr)?;
        let key = scoped_key(&resource, key.namespace.as_deref(), key.name.clone())?;
        inner
            .objects
            .get(&(resource.group.clone(), resource.plural.clone()))
            .and_then(|objects| objects.get(&key))
            .map(|object| with_api_version(object.clone(), &resource))
            .ok_or_else(|| not_found(&resource, &key))
    }

    /// List objects, across all namespaces when `namespace` is `None`.
    pub fn list(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
    ) -> StoreResult<(Vec<Value>, u64)> {
        let inner = self.inner.read();
        let resource = inner.resolve(gvr)?;
        if !resource.namespaced && namespace.is_some() {
            return Err(StoreError::Invalid(format!(
                "{} is cluster scoped and cannot be listed within a namespace",
                resource.plural
            )));
        }
        let items = inner
            .objects
            .get(&(resource.group.clone(), resource.plural.clone()))
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
                    .map(|(_, object)| with_api_version(object.clone(), &resource))
                    .collect()
            })
            .unwrap_or_default();
        Ok((items, inner.revision))
    }

    /// Replace the whole object. With a status subresource the stored status is kept.
    pub fn replace(
        &self,
        gvr: &GroupVersionResource,
        key: &ObjectKey,
        object: Value,
    ) -> StoreResult<Value> {
        self.update(gvr, key, object, UpdateTarget::Object)
    }

    /// Replace only `.status`, leaving spec and metadata untouched.
    pub fn replace_status(
        &self,
        gvr: &GroupVersionResource,
        key: &ObjectKey,
        object: Value,
    ) -> StoreResult<Value> {
        self.update(gvr, key, object, UpdateTarget::Status)
    }

    fn update(
        &self,
        gvr: &GroupVersionResource,
        key: &ObjectKey,
        object: Value,
        target: UpdateTarget,
    ) -> StoreResult<Value> {
        let (stored, revision) = {
            let mut inner = self.inner.write();
            let resource = inner.resolve(gvr)?;
            if target == UpdateTarget::Status && !resource.status_subresource {
                return Err(StoreError::UnknownResource(format!("{gvr}/status")));
            }
            let key = scoped_key(&resource, key.namespace.as_deref(), key.name.clone())?;
            let mut incoming = into_object(object)?;
            check_type(&resource, &mut incoming)?;
            let requested_version = {
                let meta = metadata_mut(&mut incoming)?;
                let name = string_field(meta, "name").unwrap_or_default();
                if !name.is_empty() && name != key.name {
                    return Err(StoreError::BadRequest(format!(
                        "metadata.name '{name}' does not match the request path '{}'",
                        key.name
                    )));
                }
                reconcile_namespace(meta, key.namespace.as_deref())?;
                string_field(meta, "resourceVersion").filter(|rv| !rv.is_empty())
            };

            let group_resource = (resource.group.clone(), resource.plural.clone());
            let current = inner
                .objects
                .get(&group_resource)
                .and_then(|objects| objects.get(&key))
                .cloned()
                .ok_or_else(|| not_found(&resource, &key))?;
            let current = into_object(current)?;
            let current_version = current
                .get("metadata")
                .and_then(|meta| meta.get("resourceVersion"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            if let Some(requested) = requested_version {
                if requested != current_version {
                    return Err(StoreError::Conflict {
                        resource: resource.plural.clone(),
                        name: key.name.clone(),
                        message: format!(
                            "the object has been modified; resourceVersion {requested} is stale, current is {current_version}"
                        ),
                    });
                }
            }

            let mut next = match target {
                UpdateTarget::Status => {
                    let mut next = current.clone();
                    match incoming.remove("status") {
                        Some(status) => next.insert("status".into(), status),
                        None => next.remove("status"),
                    };
                    next
                }
                UpdateTarget::Object => {
                    let mut next = incoming;
                    let meta = metadata_mut(&mut next)?;
                    meta.insert("name".into(), Value::String(key.name.clone()));
                    if let Some(current_meta) = current.get("metadata").and_then(Value::as_object) {
                        for field in ["uid", "creationTimestamp", "generation"] {
                            if let Some(value) = current_meta.get(field) {
                                meta.insert(field.into(), value.clone());
                            }
                        }
                    }
                    if resource.status_subresource {
                        match current.get("status") {
                            Some(status) => next.insert("status".into(), status.clone()),
                            None => next.remove("status"),
                        };
                    }
                    next
                }
            };
            metadata_mut(&mut next)?
                .insert("resourceVersion".into(), Value::String(current_version.clone()));
            if next == current {
                return Ok(with_api_version(Value::Object(current), &resource));
            }
            if target == UpdateTarget::Object && spec_changed(&current, &next) {
                let generation = current
                    .get("metadata")
                    .and_then(|meta| meta.get("generation"))
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                metadata_mut(&mut next)?.insert("generation".into(), Value::from(generation + 1));
            }

            let revision = inner.next_revision();
            metadata_mut(&mut next)?
                .insert("resourceVersion".into(), Value::String(revision.to_string()));
            let stored = Value::Object(next);
            inner
                .objects
                .entry(group_resource.clone())
                .or_default()
                .insert(key.clone(), stored.clone());
            inner.record(
                self.history_limit,
                group_resource,
                WatchEvent {
                    event_type: WatchEventType::Modified,
                    object: stored.clone(),
                },
            );
            debug!(resource = %resource.plural, object = %key, revision, ?target, "object updated");
            (with_api_version(stored, &resource), revision)
        };
        self.notify(revision);
        Ok(stored)
    }

    pub fn delete(&self, gvr: &GroupVersionResource, key: &ObjectKey) -> StoreResult<Value> {
        let (removed, revision) = {
            let mut inner = self.inner.write();
            let resource = inner.resolve(gvr)?;
            let key = scoped_key(&resource, key.namespace.as_deref(), key.name.clone())?;
            let group_resource = (resource.group.clone(), resource.plural.clone());
            let removed = inner
                .objects
                .get_mut(&group_resource)
                .and_then(|objects| objects.remove(&key))
                .ok_or_else(|| not_found(&resource, &key))?;
            let revision = inner.next_revision();
            let mut removed = into_object(removed)?;
            metadata_mut(&mut removed)?
                .insert("resourceVersion".into(), Value::String(revision.to_string()));
            let removed = Value::Object(removed);
            inner.record(
                self.history_limit,
                group_resource,
                WatchEvent {
                    event_type: WatchEventType::Deleted,
                    object: removed.clone(),
                },
            );
            debug!(resource = %resource.plural, object = %key, revision, "object deleted");
            (with_api_version(removed, &resource), revision)
        };
        self.notify(revision);
        Ok(removed)
    }

    /// Changes to `gvr` after revision `since`, plus the revision to resume from.
    pub fn events_since(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        since: u64,
    ) -> StoreResult<(Vec<WatchEvent>, u64)> {
        let inner = self.inner.read();
        let resource = inner.resolve(gvr)?;
        if since < inner.compacted {
            return Err(StoreError::Expired {
                requested: since,
                oldest: inner.compacted,
            });
        }
        let group_resource = (resource.group.clone(), resource.plural.clone());
        let events = inner
            .history
            .iter()
            .filter(|entry| entry.revision > since && entry.group_resource == group_resource)
            .filter(|entry| namespace.is_none() || entry.event.namespace() == namespace)
            .map(|entry| WatchEvent {
                event_type: entry.event.event_type,
                object: with_api_version(entry.event.object.clone(), &resource),
            })
            .collect();
        Ok((events, inner.revision))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateTarget {
    Object,
    Status,
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn not_found(resource: &ApiResource, key: &ObjectKey) -> StoreError {
    StoreError::NotFound {
        resource: resource.plural.clone(),
        name: key.name.clone(),
    }
}

fn into_object(value: Value) -> StoreResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::BadRequest("object body must be a JSON object".into())),
    }
}

fn metadata_mut(object: &mut Map<String, Value>) -> StoreResult<&mut Map<String, Value>> {
    object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| StoreError::Invalid("metadata must be an object".into()))
}

fn string_field(map: &Map<String, Value>, field: &str) -> Option<String> {
    map.get(field).and_then(Value::as_str).map(str::to_owned)
}

/// `kind` must match the resource and `apiVersion` its group; both are filled when absent.
fn check_type(resource: &ApiResource, object: &mut Map<String, Value>) -> StoreResult<()> {
    if let Some(kind) = object.get("kind").and_then(Value::as_str) {
        if kind != resource.kind {
            return Err(StoreError::BadRequest(format!(
                "kind '{kind}' does not match resource kind '{}'",
                resource.kind
            )));
        }
    }
    if let Some(api_version) = object.get("apiVersion").and_then(Value::as_str) {
        let gvk = GroupVersionKind::from_api_version(api_version, resource.kind.clone());
        if gvk.group != resource.group {
            return Err(StoreError::BadRequest(format!(
                "apiVersion '{api_version}' does not belong to group '{}'",
                resource.group
            )));
        }
    }
    object.insert("apiVersion".into(), Value::String(resource.gvk().api_version()));
    object.insert("kind".into(), Value::String(resource.kind.clone()));
    Ok(())
}

fn assign_name(meta: &mut Map<String, Value>) -> StoreResult<()> {
    let name = string_field(meta, "name").unwrap_or_default();
    if !name.is_empty() {
        return Ok(());
    }
    match string_field(meta, "generateName").filter(|prefix| !prefix.is_empty()) {
        Some(prefix) => {
            let suffix: String = Uuid::new_v4().simple().to_string().chars().take(5).collect();
            meta.insert("name".into(), Value::String(format!("{prefix}{suffix}")));
            Ok(())
        }
        None => Err(StoreError::Invalid(
            "metadata.name or metadata.generateName is required".into(),
        )),
    }
}

/// Resolve the namespace from the path and the body; they must agree.
fn reconcile_namespace<'a>(
    meta: &mut Map<String, Value>,
    path_namespace: Option<&'a str>,
) -> StoreResult<Option<&'a str>> {
    let body_namespace = string_field(meta, "namespace").filter(|ns| !ns.is_empty());
    match (path_namespace, body_namespace) {
        (Some(path), Some(body)) if path != body => Err(StoreError::BadRequest(format!(
            "metadata.namespace '{body}' does not match the request namespace '{path}'"
        ))),
        (Some(path), _) => {
            meta.insert("namespace".into(), Value::String(path.to_owned()));
            Ok(Some(path))
        }
        (None, Some(body)) => Err(StoreError::BadRequest(format!(
            "metadata.namespace '{body}' given without a namespaced request path"
        ))),
        (None, None) => Ok(None),
    }
}

fn scoped_key(
    resource: &ApiResource,
    namespace: Option<&str>,
    name: String,
) -> StoreResult<ObjectKey> {
    if name.is_empty() {
        return Err(StoreError::Invalid("metadata.name must not be empty".into()));
    }
    match (resource.namespaced, namespace) {
        (true, Some(namespace)) => Ok(ObjectKey::namespaced(namespace, name)),
        (true, None) => Err(StoreError::Invalid(format!(
            "{} is namespaced; a namespace is required",
            resource.plural
        ))),
        (false, None) => Ok(ObjectKey::cluster(name)),
        (false, Some(_)) => Err(StoreError::Invalid(format!(
            "{} is cluster scoped and cannot be namespaced",
            resource.plural
        ))),
    }
}

fn spec_changed(current: &Map<String, Value>, next: &Map<String, Value>) -> bool {
    let strip = |object: &Map<String, Value>| {
        object
            .iter()
            .filter(|(field, _)| !matches!(field.as_str(), "metadata" | "status"))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect::<Map<String, Value>>()
    };
    strip(current) != strip(next)
}

fn with_api_version(mut object: Value, resource: &ApiResource) -> Value {
    if let Some(map) = object.as_object_mut() {
        map.insert("apiVersion".into(), Value::String(resource.gvk().api_version()));
    }
    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use envtest_schema::{
        CustomResourceDefinitionSpec, CustomResourceNames, CustomResourceSubresources,
        CustomResourceVersion, ObjectMeta, ResourceScope, CRD_API_VERSION, CRD_KIND,
    };
    use serde_json::json;

    fn widget_crd(scope: ResourceScope, status: bool) -> CustomResourceDefinition {
        CustomResourceDefinition {
            api_version: CRD_API_VERSION.into(),
            kind: CRD_KIND.into(),
            metadata: ObjectMeta::cluster("widgets.test.example.io"),
            spec: CustomResourceDefinitionSpec {
                group: "test.example.io".into(),
                names: CustomResourceNames {
                    kind: "Widget".into(),
                    plural: "widgets".into(),
                    singular: None,
                    list_kind: None,
                    short_names: Vec::new(),
                },
                scope,
                versions: vec![CustomResourceVersion {
                    name: "v1".into(),
                    served: true,
                    storage: true,
                    schema: None,
                    subresources: status.then(|| CustomResourceSubresources {
                        status: Some(json!({})),
                    }),
                }],
            },
        }
    }

    fn gvr() -> GroupVersionResource {
        GroupVersionResource::new("test.example.io", "v1", "widgets")
    }

    fn store_with(scope: ResourceScope, status: bool) -> ObjectStore {
        let store = ObjectStore::new();
        store.install_definition(widget_crd(scope, status)).unwrap();
        store
    }

    fn widget(name: &str, size: i64) -> Value {
        json!({"metadata": {"name": name}, "spec": {"size": size}})
    }

    #[test]
    fn create_assigns_server_fields() {
        let store = store_with(ResourceScope::Namespaced, true);
        let created = store
            .create(&gvr(), Some("default"), widget("a", 1))
            .unwrap();
        assert_eq!(created["apiVersion"], "test.example.io/v1");
        assert_eq!(created["kind"], "Widget");
        assert_eq!(created["metadata"]["namespace"], "default");
        assert_eq!(created["metadata"]["generation"], 1);
        assert!(created["metadata"]["uid"].as_str().is_some());
        assert_eq!(created["metadata"]["resourceVersion"], "2");

        let err = store
            .create(&gvr(), Some("default"), widget("a", 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[test]
    fn scope_is_enforced() {
        let namespaced = store_with(ResourceScope::Namespaced, false);
        assert!(matches!(
            namespaced.create(&gvr(), None, widget("a", 1)),
            Err(StoreError::Invalid(_))
        ));

        let cluster = store_with(ResourceScope::Cluster, false);
        assert!(cluster.create(&gvr(), None, widget("a", 1)).is_ok());
        assert!(cluster.create(&gvr(), Some("default"), widget("b", 1)).is_err());
    }

    #[test]
    fn unknown_resources_are_rejected() {
        let store = ObjectStore::new();
        let err = store.create(&gvr(), Some("default"), widget("a", 1)).unwrap_err();
        assert_eq!(err.reason(), StatusReason::NotFound);
    }

    #[test]
    fn stale_resource_version_conflicts() {
        let store = store_with(ResourceScope::Namespaced, true);
        let created = store.create(&gvr(), Some("ns"), widget("a", 1)).unwrap();
        let key = ObjectKey::namespaced("ns", "a");

        let mut first = created.clone();
        first["spec"]["size"] = json!(2);
        let updated = store.replace(&gvr(), &key, first).unwrap();
        assert_eq!(updated["metadata"]["generation"], 2);

        let mut stale = created;
        stale["spec"]["size"] = json!(3);
        let err = store.replace(&gvr(), &key, stale).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn status_subresource_isolates_status_writes() {
        let store = store_with(ResourceScope::Namespaced, true);
        let key = ObjectKey::namespaced("ns", "a");
        let mut created = store.create(&gvr(), Some("ns"), widget("a", 1)).unwrap();

        created["status"] = json!({"phase": "Ready"});
        created["spec"]["size"] = json!(9);
        let after_status = store.replace_status(&gvr(), &key, created).unwrap();
        assert_eq!(after_status["status"]["phase"], "Ready");
        assert_eq!(after_status["spec"]["size"], 1, "spec untouched by status writes");
        assert_eq!(after_status["metadata"]["generation"], 1);

        let mut spec_write = after_status.clone();
        spec_write["status"] = json!({"phase": "Overwritten"});
        spec_write["spec"]["size"] = json!(5);
        let after_spec = store.replace(&gvr(), &key, spec_write).unwrap();
        assert_eq!(after_spec["status"]["phase"], "Ready", "status untouched by object writes");
        assert_eq!(after_spec["spec"]["size"], 5);
    }

    #[test]
    fn no_op_updates_keep_the_revision() {
        let store = store_with(ResourceScope::Namespaced, false);
        let created = store.create(&gvr(), Some("ns"), widget("a", 1)).unwrap();
        let before = store.revision();
        let same = store
            .replace(&gvr(), &ObjectKey::namespaced("ns", "a"), created.clone())
            .unwrap();
        assert_eq!(same["metadata"]["resourceVersion"], created["metadata"]["resourceVersion"]);
        assert_eq!(store.revision(), before);
    }

    #[test]
    fn status_write_without_subresource_is_unknown() {
        let store = store_with(ResourceScope::Namespaced, false);
        let created = store.create(&gvr(), Some("ns"), widget("a", 1)).unwrap();
        let err = store
            .replace_status(&gvr(), &ObjectKey::namespaced("ns", "a"), created)
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownResource(_)));
    }

    #[test]
    fn events_follow_writes_and_expire() {
        let store = ObjectStore::with_history_limit(2);
        store
            .install_definition(widget_crd(ResourceScope::Namespaced, false))
            .unwrap();
        let start = store.revision();
        store.create(&gvr(), Some("ns"), widget("a", 1)).unwrap();
        store.create(&gvr(), Some("other"), widget("b", 1)).unwrap();

        let (events, revision) = store.events_since(&gvr(), Some("ns"), start).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), Some("a"));
        assert_eq!(revision, store.revision());

        store
            .delete(&gvr(), &ObjectKey::namespaced("ns", "a"))
            .unwrap();
        let err = store.events_since(&gvr(), None, start).unwrap_err();
        assert!(matches!(err, StoreError::Expired { .. }));
        let (events, _) = store.events_since(&gvr(), None, revision).unwrap();
        assert_eq!(events[0].event_type, WatchEventType::Deleted);
    }

    #[test]
    fn generate_name_produces_unique_names() {
        let store = store_with(ResourceScope::Namespaced, false);
        let body = json!({"metadata": {"generateName": "job-"}});
        let a = store.create(&gvr(), Some("ns"), body.clone()).unwrap();
        let b = store.create(&gvr(), Some("ns"), body).unwrap();
        let name_a = a["metadata"]["name"].as_str().unwrap();
        assert!(name_a.starts_with("job-"));
        assert_ne!(name_a, b["metadata"]["name"].as_str().unwrap());
    }

    #[test]
    fn duplicate_definition_is_rejected() {
        let store = store_with(ResourceScope::Namespaced, false);
        let err = store
            .install_definition(widget_crd(ResourceScope::Namespaced, false))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert_eq!(store.discovery().len(), 1);
    }
}
