//! ---
//! envtest_section: "02-api-data-model"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Custom resource definition model and structural validation."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::meta::{ApiResource, GroupVersionResource, ObjectMeta};

pub const CRD_GROUP: &str = "apiextensions.k8s.io";
pub const CRD_VERSION: &str = "v1";
pub const CRD_API_VERSION: &str = "apiextensions.k8s.io/v1";
pub const CRD_KIND: &str = "CustomResourceDefinition";
pub const CRD_PLURAL: &str = "customresourcedefinitions";

/// Structural problems found in a definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("apiVersion must be {CRD_API_VERSION}, found '{0}'")]
    WrongApiVersion(String),
    #[error("kind must be {CRD_KIND}, found '{0}'")]
    WrongKind(String),
    #[error("field {0} must not be empty")]
    EmptyField(&'static str),
    #[error("metadata.name must be '{expected}', found '{found}'")]
    NameMismatch { expected: String, found: String },
    #[error("spec.names.plural '{0}' must be lowercase")]
    PluralNotLowercase(String),
    #[error("spec.versions must list at least one version")]
    NoVersions,
    #[error("exactly one version must be marked storage, found {0}")]
    StorageVersionCount(usize),
    #[error("at least one version must be served")]
    NoServedVersion,
    #[error("version '{0}' is declared more than once")]
    DuplicateVersion(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceScope {
    #[default]
    Namespaced,
    Cluster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceDefinition {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: CustomResourceDefinitionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceDefinitionSpec {
    pub group: String,
    pub names: CustomResourceNames,
    #[serde(default)]
    pub scope: ResourceScope,
    pub versions: Vec<CustomResourceVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceNames {
    pub kind: String,
    pub plural: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singular: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceVersion {
    pub name: String,
    pub served: bool,
    pub storage: bool,
    /// Validation schema, kept opaque; the control plane does not enforce it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subresources: Option<CustomResourceSubresources>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceSubresources {
    /// Presence enables the status subresource; the content is unused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl CustomResourceDefinition {
    /// Canonical `<plural>.<group>` name.
    pub fn expected_name(&self) -> String {
        format!("{}.{}", self.spec.names.plural, self.spec.group)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_namespaced(&self) -> bool {
        self.spec.scope == ResourceScope::Namespaced
    }

    pub fn list_kind(&self) -> String {
        self.spec
            .names
            .list_kind
            .clone()
            .unwrap_or_else(|| format!("{}List", self.spec.names.kind))
    }

    pub fn storage_version(&self) -> Option<&CustomResourceVersion> {
        self.spec.versions.iter().find(|version| version.storage)
    }

    /// One discovery entry per served version.
    pub fn api_resources(&self) -> Vec<ApiResource> {
        self.spec
            .versions
            .iter()
            .filter(|version| version.served)
            .map(|version| ApiResource {
                group: self.spec.group.clone(),
                version: version.name.clone(),
                kind: self.spec.names.kind.clone(),
                plural: self.spec.names.plural.clone(),
                namespaced: self.is_namespaced(),
                status_subresource: version
                    .subresources
                    .as_ref()
                    .is_some_and(|sub| sub.status.is_some()),
            })
            .collect()
    }

    pub fn served_resources(&self) -> Vec<GroupVersionResource> {
        self.api_resources().iter().map(ApiResource::gvr).collect()
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.api_version != CRD_API_VERSION {
            return Err(DefinitionError::WrongApiVersion(self.api_version.clone()));
        }
        if self.kind != CRD_KIND {
            return Err(DefinitionError::WrongKind(self.kind.clone()));
        }
        if self.spec.group.trim().is_empty() {
            return Err(DefinitionError::EmptyField("spec.group"));
        }
        if self.spec.names.kind.trim().is_empty() {
            return Err(DefinitionError::EmptyField("spec.names.kind"));
        }
        if self.spec.names.plural.trim().is_empty() {
            return Err(DefinitionError::EmptyField("spec.names.plural"));
        }
        if self.spec.names.plural != self.spec.names.plural.to_lowercase() {
            return Err(DefinitionError::PluralNotLowercase(
                self.spec.names.plural.clone(),
            ));
        }
        let expected = self.expected_name();
        if self.metadata.name != expected {
            return Err(DefinitionError::NameMismatch {
                expected,
                found: self.metadata.name.clone(),
            });
        }
        if self.spec.versions.is_empty() {
            return Err(DefinitionError::NoVersions);
        }
        let mut seen = HashSet::new();
        for version in &self.spec.versions {
            if version.name.trim().is_empty() {
                return Err(DefinitionError::EmptyField("spec.versions[].name"));
            }
            if !seen.insert(version.name.as_str()) {
                return Err(DefinitionError::DuplicateVersion(version.name.clone()));
            }
        }
        let storage = self.spec.versions.iter().filter(|v| v.storage).count();
        if storage != 1 {
            return Err(DefinitionError::StorageVersionCount(storage));
        }
        if !self.spec.versions.iter().any(|v| v.served) {
            return Err(DefinitionError::NoServedVersion);
        }
        Ok(())
    }
}
