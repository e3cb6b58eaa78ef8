//! ---
//! envtest_section: "02-api-data-model"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Shared schema definitions and validation logic."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! Wire types and resource definitions for the envtest control plane.
//!
//! The control plane, the typed client, and the CLI all speak the types
//! defined here: object metadata, group/version/kind identifiers, list and
//! watch payloads, and the custom resource definitions preloaded at
//! bootstrap.

use std::path::PathBuf;

pub mod crd;
pub mod loader;
pub mod meta;
pub mod watch;

pub use crd::{
    CustomResourceDefinition, CustomResourceDefinitionSpec, CustomResourceNames,
    CustomResourceSubresources, CustomResourceVersion, DefinitionError, ResourceScope,
    CRD_API_VERSION, CRD_GROUP, CRD_KIND, CRD_PLURAL, CRD_VERSION,
};
pub use loader::{load_definitions, parse_definition_file};
pub use meta::{
    ApiResource, ApiResourceList, GroupVersionKind, GroupVersionResource, ObjectKey, ObjectMeta, TypeMeta,
};
pub use watch::{ListMeta, ObjectList, Status, StatusReason, WatchEvent, WatchEventType, WatchList};

/// Shared result type for definition loading.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while reading resource definitions from disk.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The directory could not be listed.
    #[error("failed to list {}: {message}", path.display())]
    Walk { path: PathBuf, message: String },
    /// The file is not valid YAML/JSON, or does not match the definition shape.
    #[error("malformed definition in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    /// The definition parsed but is structurally invalid.
    #[error("invalid definition in {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: DefinitionError,
    },
    /// A configured schema path does not exist.
    #[error("schema path {} does not exist", .0.display())]
    MissingPath(PathBuf),
    /// Two files declare a definition with the same name.
    #[error("definition {name} declared in both {} and {}", first.display(), second.display())]
    Duplicate {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("document {index} in {} is not a mapping", path.display())]
    NotAMapping { path: PathBuf, index: usize },
    #[error("document {index} in {} has no kind", path.display())]
    MissingKind { path: PathBuf, index: usize },
}

impl SchemaError {
    /// File the error refers to, when there is one.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            SchemaError::Io { path, .. }
            | SchemaError::Walk { path, .. }
            | SchemaError::Parse { path, .. }
            | SchemaError::Invalid { path, .. }
            | SchemaError::NotAMapping { path, .. }
            | SchemaError::MissingKind { path, .. } => Some(path),
            SchemaError::MissingPath(path) => Some(path),
            SchemaError::Duplicate { second, .. } => Some(second),
        }
    }
}
