//! ---
//! envtest_section: "15-testing-qa-runbook"
//! envtest_subsection: "integration-tests"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "HTTP-level tests for the in-memory control plane."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::time::Duration;

use envtest_apiserver::{ControlPlane, ServerError};
use envtest_schema::{ApiResourceList, ObjectList, Status, StatusReason, WatchEventType, WatchList};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

fn crd_body() -> Value {
    json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": "gadgets.http.example.io"},
        "spec": {
            "group": "http.example.io",
            "names": {"kind": "Gadget", "plural": "gadgets"},
            "scope": "Namespaced",
            "versions": [{"name": "v1", "served": true, "storage": true, "subresources": {"status": {}}}]
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_crud_discovery_and_watch() -> anyhow::Result<()> {
    let plane = ControlPlane::bind("127.0.0.1:0".parse()?).await?.spawn();
    let base = plane.base_url();
    let http = Client::new();

    assert_eq!(http.get(format!("{base}/readyz")).send().await?.status(), StatusCode::OK);

    let installed = http
        .post(format!("{base}/apis/apiextensions.k8s.io/v1/customresourcedefinitions"))
        .json(&crd_body())
        .send()
        .await?;
    assert_eq!(installed.status(), StatusCode::CREATED);

    let discovery: ApiResourceList = http.get(format!("{base}/apis")).send().await?.json().await?;
    assert_eq!(discovery.resources.len(), 1);
    assert!(discovery.resources[0].status_subresource);

    let collection = format!("{base}/apis/http.example.io/v1/namespaces/default/gadgets");
    let listed: ObjectList = http.get(&collection).send().await?.json().await?;
    assert!(listed.items.is_empty());
    let since = listed.metadata.resource_version.clone();

    let created = http
        .post(&collection)
        .json(&json!({"metadata": {"name": "g1"}, "spec": {"size": 1}}))
        .send()
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);

    let watch: WatchList = http
        .get(format!("{collection}?watch=true&resourceVersion={since}&timeoutSeconds=2"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(watch.events.len(), 1);
    assert_eq!(watch.events[0].event_type, WatchEventType::Added);

    let duplicate = http
        .post(&collection)
        .json(&json!({"metadata": {"name": "g1"}}))
        .send()
        .await?;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let status: Status = duplicate.json().await?;
    assert_eq!(status.reason, StatusReason::AlreadyExists);

    let mut object: Value = http.get(format!("{collection}/g1")).send().await?.json().await?;
    object["status"] = json!({"ready": true});
    let updated = http
        .put(format!("{collection}/g1/status"))
        .json(&object)
        .send()
        .await?;
    assert_eq!(updated.status(), StatusCode::OK);

    let deleted = http.delete(format!("{collection}/g1")).send().await?;
    assert_eq!(deleted.status(), StatusCode::OK);
    let missing = http.get(format!("{collection}/g1")).send().await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    plane.stop(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_watch_returns_empty_after_timeout() -> anyhow::Result<()> {
    let plane = ControlPlane::bind("127.0.0.1:0".parse()?).await?.spawn();
    let base = plane.base_url();
    let http = Client::new();
    http.post(format!("{base}/apis/apiextensions.k8s.io/v1/customresourcedefinitions"))
        .json(&crd_body())
        .send()
        .await?
        .error_for_status()?;

    let started = std::time::Instant::now();
    let watch: WatchList = http
        .get(format!("{base}/apis/http.example.io/v1/gadgets?watch=true&timeoutSeconds=1"))
        .send()
        .await?
        .json()
        .await?;
    assert!(watch.events.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(900));

    plane.stop(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_conflict_is_reported() -> anyhow::Result<()> {
    let first = ControlPlane::bind("127.0.0.1:0".parse()?).await?;
    let taken = first.local_addr();
    match ControlPlane::bind(taken).await {
        Err(ServerError::Bind { address, .. }) => assert_eq!(address, taken),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("second bind on {taken} should fail"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_resources_return_not_found() -> anyhow::Result<()> {
    let plane = ControlPlane::bind("127.0.0.1:0".parse()?).await?.spawn();
    let response = Client::new()
        .get(format!("{}/apis/missing.example.io/v1/things", plane.base_url()))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    plane.stop(Duration::from_secs(5)).await?;
    Ok(())
}
