//! ---
//! envtest_section: "04-configuration-orchestration"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Trait implemented by domain types served by the control plane."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use envtest_schema::{GroupVersionKind, GroupVersionResource, ObjectKey, ObjectMeta};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A domain type addressable through the control plane.
///
/// Implementors do not need `apiVersion`/`kind` fields; the scheme stamps
/// them on encode and checks them on decode.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const GROUP: &'static str;
    const VERSION: &'static str;
    const KIND: &'static str;
    /// Lowercase plural used in request paths.
    const PLURAL: &'static str;
    const NAMESPACED: bool = true;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn gvk() -> GroupVersionKind {
        GroupVersionKind::new(Self::GROUP, Self::VERSION, Self::KIND)
    }

    fn gvr() -> GroupVersionResource {
        GroupVersionResource::new(Self::GROUP, Self::VERSION, Self::PLURAL)
    }

    fn api_version() -> String {
        Self::gvk().api_version()
    }

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}
