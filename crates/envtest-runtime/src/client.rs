//! ---
//! envtest_section: "04-configuration-orchestration"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Typed HTTP client bound to a manager's connection."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use envtest_schema::{
    ApiResourceList, CustomResourceDefinition, GroupVersionResource, ObjectKey, ObjectList, Status,
    StatusReason, WatchList, CRD_GROUP, CRD_PLURAL, CRD_VERSION,
};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DurationMilliSeconds};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::resource::Resource;
use crate::scheme::{Scheme, SchemeError};

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_user_agent() -> String {
    concat!("envtest-runtime/", env!("CARGO_PKG_VERSION")).to_owned()
}

/// How to reach the control plane. Written to `connection.json` for companion processes.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: Url,
    #[serde(default = "default_request_timeout", rename = "request_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl ConnectionConfig {
    pub fn new(host: Url) -> Self {
        Self {
            host,
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is not bound to a running manager")]
    Invalidated,
    #[error(transparent)]
    Scheme(#[from] SchemeError),
    #[error("{kind} is namespaced; the object needs a namespace")]
    MissingNamespace { kind: &'static str },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {code}: {message}")]
    Api {
        code: u16,
        reason: Option<StatusReason>,
        message: String,
    },
    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    fn reason(&self) -> Option<StatusReason> {
        match self {
            ClientError::Api { reason, .. } => *reason,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.reason(), Some(StatusReason::NotFound))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.reason(), Some(StatusReason::Conflict))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.reason(), Some(StatusReason::AlreadyExists))
    }

    /// The watch asked for history the control plane no longer keeps.
    pub fn is_expired(&self) -> bool {
        matches!(self.reason(), Some(StatusReason::Expired))
    }
}

struct ClientInner {
    http: reqwest::Client,
    config: ConnectionConfig,
    scheme: Arc<Scheme>,
    revoked: CancellationToken,
}

/// Typed client. Clones share one revocation token: once the owning
/// manager is torn down every clone reports [`ClientError::Invalidated`].
#[derive(Clone, Default)]
pub struct Client {
    inner: Option<Arc<ClientInner>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("Client")
                .field("host", &inner.config.host.as_str())
                .field("valid", &self.is_valid())
                .finish(),
            None => f.write_str("Client(invalid)"),
        }
    }
}

impl Client {
    pub fn new(config: ConnectionConfig, scheme: Arc<Scheme>) -> Result<Self, ClientError> {
        Self::with_revocation(config, scheme, CancellationToken::new())
    }

    /// Build a client that becomes invalid when `revoked` is cancelled.
    pub fn with_revocation(
        config: ConnectionConfig,
        scheme: Arc<Scheme>,
        revoked: CancellationToken,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            inner: Some(Arc::new(ClientInner {
                http,
                config,
                scheme,
                revoked,
            })),
        })
    }

    /// A client that refuses every call.
    pub fn invalid() -> Self {
        Self { inner: None }
    }

    pub fn is_valid(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| !inner.revoked.is_cancelled())
    }

    /// Invalidate this client and every clone of it.
    pub fn revoke(&self) {
        if let Some(inner) = &self.inner {
            inner.revoked.cancel();
        }
    }

    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.inner.as_ref().map(|inner| &inner.config)
    }

    pub fn scheme(&self) -> Option<Arc<Scheme>> {
        self.inner.as_ref().map(|inner| Arc::clone(&inner.scheme))
    }

    fn live(&self) -> Result<&ClientInner, ClientError> {
        match &self.inner {
            Some(inner) if !inner.revoked.is_cancelled() => Ok(inner),
            _ => Err(ClientError::Invalidated),
        }
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        Ok(endpoint_url(&self.live()?.config.host, path)?)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let inner = self.live()?;
        tokio::select! {
            _ = inner.revoked.cancelled() => Err(ClientError::Invalidated),
            response = request.send() => Ok(response?),
        }
    }

    async fn call<B, R>(&self, method: Method, url: Url, body: Option<&B>) -> Result<R, ClientError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let inner = self.live()?;
        trace!(%method, url = %url, "api call");
        let mut request = inner.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.send(request).await?;
        parse_response(response).await
    }

    fn object_url<T: Resource>(
        &self,
        namespace: Option<&str>,
        name: Option<&str>,
        subresource: Option<&str>,
    ) -> Result<Url, ClientError> {
        let mut path = collection_path(&T::gvr(), scoped_namespace::<T>(namespace)?);
        for segment in [name, subresource].into_iter().flatten() {
            path.push('/');
            path.push_str(segment);
        }
        self.url(&path)
    }

    fn scheme_for<T: Resource>(&self) -> Result<Arc<Scheme>, ClientError> {
        let inner = self.live()?;
        inner.scheme.registration::<T>()?;
        Ok(Arc::clone(&inner.scheme))
    }

    pub async fn create<T: Resource>(&self, object: &T) -> Result<T, ClientError> {
        let scheme = self.scheme_for::<T>()?;
        let body = scheme.encode(object)?;
        let url = self.object_url::<T>(object.meta().namespace.as_deref(), None, None)?;
        let created: Value = self.call(Method::POST, url, Some(&body)).await?;
        Ok(scheme.decode(created)?)
    }

    pub async fn get<T: Resource>(&self, key: &ObjectKey) -> Result<T, ClientError> {
        let scheme = self.scheme_for::<T>()?;
        let url = self.object_url::<T>(key.namespace.as_deref(), Some(&key.name), None)?;
        let object: Value = self.call::<(), _>(Method::GET, url, None).await?;
        Ok(scheme.decode(object)?)
    }

    /// List objects of `T`, across all namespaces when `namespace` is `None`.
    pub async fn list<T: Resource>(&self, namespace: Option<&str>) -> Result<Vec<T>, ClientError> {
        let scheme = self.scheme_for::<T>()?;
        let list = self.list_raw(&T::gvr(), namespace).await?;
        list.items
            .into_iter()
            .map(|item| scheme.decode(item).map_err(ClientError::from))
            .collect()
    }

    /// Replace `object`; a stale `resourceVersion` yields a conflict.
    pub async fn update<T: Resource>(&self, object: &T) -> Result<T, ClientError> {
        let scheme = self.scheme_for::<T>()?;
        let body = scheme.encode(object)?;
        let meta = object.meta();
        let url = self.object_url::<T>(meta.namespace.as_deref(), Some(&meta.name), None)?;
        let updated: Value = self.call(Method::PUT, url, Some(&body)).await?;
        Ok(scheme.decode(updated)?)
    }

    /// Replace only the status of `object`.
    pub async fn update_status<T: Resource>(&self, object: &T) -> Result<T, ClientError> {
        let scheme = self.scheme_for::<T>()?;
        let body = scheme.encode(object)?;
        let meta = object.meta();
        let url =
            self.object_url::<T>(meta.namespace.as_deref(), Some(&meta.name), Some("status"))?;
        let updated: Value = self.call(Method::PUT, url, Some(&body)).await?;
        Ok(scheme.decode(updated)?)
    }

    pub async fn delete<T: Resource>(&self, key: &ObjectKey) -> Result<(), ClientError> {
        self.scheme_for::<T>()?;
        let url = self.object_url::<T>(key.namespace.as_deref(), Some(&key.name), None)?;
        let _: Value = self.call::<(), _>(Method::DELETE, url, None).await?;
        Ok(())
    }

    pub async fn healthz(&self) -> Result<(), ClientError> {
        self.probe("/healthz").await
    }

    pub async fn readyz(&self) -> Result<(), ClientError> {
        self.probe("/readyz").await
    }

    async fn probe(&self, path: &str) -> Result<(), ClientError> {
        let inner = self.live()?;
        let response = self.send(inner.http.get(self.url(path)?)).await?;
        if response.status().is_success() {
            return Ok(());
        }
        let code = response.status().as_u16();
        Err(ClientError::Api {
            code,
            reason: None,
            message: response.text().await.unwrap_or_default(),
        })
    }

    pub async fn discovery(&self) -> Result<ApiResourceList, ClientError> {
        let url = self.url("/apis")?;
        self.call::<(), _>(Method::GET, url, None).await
    }

    pub async fn install_definition(
        &self,
        definition: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, ClientError> {
        let gvr = GroupVersionResource::new(CRD_GROUP, CRD_VERSION, CRD_PLURAL);
        let url = self.url(&collection_path(&gvr, None))?;
        self.call(Method::POST, url, Some(definition)).await
    }

    pub async fn list_raw(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
    ) -> Result<ObjectList, ClientError> {
        let url = self.url(&collection_path(gvr, namespace))?;
        self.call::<(), _>(Method::GET, url, None).await
    }

    /// Long-poll for changes after `resource_version`, waiting at most `timeout`.
    pub async fn watch_raw(
        &self,
        gvr: &GroupVersionResource,
        namespace: Option<&str>,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<WatchList, ClientError> {
        let inner = self.live()?;
        let mut url = self.url(&collection_path(gvr, namespace))?;
        url.query_pairs_mut()
            .append_pair("watch", "true")
            .append_pair("resourceVersion", resource_version)
            .append_pair("timeoutSeconds", &timeout.as_secs().max(1).to_string());
        let request = inner
            .http
            .get(url)
            .timeout(timeout.max(Duration::from_secs(1)) + inner.config.request_timeout);
        let response = self.send(request).await?;
        parse_response(response).await
    }
}

fn scoped_namespace<T: Resource>(namespace: Option<&str>) -> Result<Option<&str>, ClientError> {
    match (T::NAMESPACED, namespace) {
        (true, None) => Err(ClientError::MissingNamespace { kind: T::KIND }),
        (true, namespace) => Ok(namespace),
        (false, _) => Ok(None),
    }
}

fn collection_path(gvr: &GroupVersionResource, namespace: Option<&str>) -> String {
    match namespace {
        Some(namespace) => format!(
            "/apis/{}/{}/namespaces/{}/{}",
            gvr.group, gvr.version, namespace, gvr.resource
        ),
        None => format!("/apis/{}/{}/{}", gvr.group, gvr.version, gvr.resource),
    }
}

async fn parse_response<R: DeserializeOwned>(response: Response) -> Result<R, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<R>().await?);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<Status>(&body) {
        Ok(failure) => Err(ClientError::Api {
            code: status.as_u16(),
            reason: Some(failure.reason),
            message: failure.message,
        }),
        Err(_) => Err(ClientError::Api {
            code: status.as_u16(),
            reason: None,
            message: body,
        }),
    }
}

/// Resolves an API path beneath `host`, keeping any path prefix the endpoint
/// carries (for example a proxy mount).
fn endpoint_url(host: &Url, path: &str) -> Result<Url, url::ParseError> {
    let relative = path.trim_start_matches('/');
    if host.path().ends_with('/') {
        return host.join(relative);
    }
    let mut base = host.clone();
    base.set_path(&format!("{}/", host.path()));
    base.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Widget;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(Url::parse("http://127.0.0.1:1").unwrap())
    }

    #[tokio::test]
    async fn invalid_client_refuses_calls() {
        let client = Client::invalid();
        assert!(!client.is_valid());
        assert!(matches!(client.healthz().await, Err(ClientError::Invalidated)));
    }

    #[tokio::test]
    async fn revocation_reaches_every_clone() {
        let scheme = Arc::new(Scheme::new());
        let client = Client::new(config(), scheme).unwrap();
        let clone = client.clone();
        assert!(clone.is_valid());
        client.revoke();
        assert!(!clone.is_valid());
        assert!(matches!(
            clone.get::<Widget>(&ObjectKey::namespaced("ns", "a")).await,
            Err(ClientError::Invalidated)
        ));
    }

    #[tokio::test]
    async fn unregistered_types_fail_before_any_request() {
        let client = Client::new(config(), Arc::new(Scheme::new())).unwrap();
        let err = client
            .create(&Widget::new("ns", "a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Scheme(SchemeError::NotRegistered(_))));
    }

    #[test]
    fn connection_config_serializes_millis() {
        let value = serde_json::to_value(config()).unwrap();
        assert_eq!(value["host"], "http://127.0.0.1:1/");
        assert_eq!(value["request_timeout_ms"], 10_000);
        let parsed: ConnectionConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, config());
    }

    #[test]
    fn endpoint_path_prefix_is_kept() {
        let path = "/apis/g.io/v1/things";
        for host in ["http://127.0.0.1:1/proxy/", "http://127.0.0.1:1/proxy"] {
            let url = endpoint_url(&Url::parse(host).unwrap(), path).unwrap();
            assert_eq!(url.as_str(), "http://127.0.0.1:1/proxy/apis/g.io/v1/things");
        }
        let bare = endpoint_url(&Url::parse("http://127.0.0.1:1").unwrap(), path).unwrap();
        assert_eq!(bare.as_str(), "http://127.0.0.1:1/apis/g.io/v1/things");
    }

    #[test]
    fn collection_paths() {
        let gvr = GroupVersionResource::new("g.io", "v1", "things");
        assert_eq!(collection_path(&gvr, None), "/apis/g.io/v1/things");
        assert_eq!(
            collection_path(&gvr, Some("ns")),
            "/apis/g.io/v1/namespaces/ns/things"
        );
    }
}
