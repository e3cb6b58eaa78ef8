//! ---
//! envtest_section: "02-api-data-model"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Reads resource definitions from schema directories."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::crd::{CustomResourceDefinition, CRD_KIND};
use crate::{SchemaError, SchemaResult};

const DEFINITION_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Load every definition found under `paths`.
///
/// Directories are read one level deep in file-name order; plain files are
/// read as given. Documents of other kinds are skipped. A missing path is
/// only an error when `error_if_missing` is set.
pub fn load_definitions<P: AsRef<Path>>(
    paths: &[P],
    error_if_missing: bool,
) -> SchemaResult<Vec<CustomResourceDefinition>> {
    let mut definitions = Vec::new();
    let mut origins: HashMap<String, PathBuf> = HashMap::new();

    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            if error_if_missing {
                return Err(SchemaError::MissingPath(path.to_path_buf()));
            }
            warn!(path = %path.display(), "schema path does not exist; skipping");
            continue;
        }
        for file in definition_files(path)? {
            for crd in parse_definition_file(&file)? {
                if let Some(first) = origins.get(crd.name()) {
                    return Err(SchemaError::Duplicate {
                        name: crd.name().to_owned(),
                        first: first.clone(),
                        second: file.clone(),
                    });
                }
                origins.insert(crd.name().to_owned(), file.clone());
                definitions.push(crd);
            }
        }
    }

    debug!(count = definitions.len(), "resource definitions loaded");
    Ok(definitions)
}

fn definition_files(path: &Path) -> SchemaResult<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|err| SchemaError::Walk {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let has_definition_extension = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| DEFINITION_EXTENSIONS.contains(&ext));
        if has_definition_extension {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Parse one file, which may hold several YAML documents (JSON is accepted as YAML).
pub fn parse_definition_file(path: &Path) -> SchemaResult<Vec<CustomResourceDefinition>> {
    let contents = fs::read_to_string(path).map_err(|source| SchemaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_definitions(path, &contents)
}

fn parse_definitions(path: &Path, contents: &str) -> SchemaResult<Vec<CustomResourceDefinition>> {
    let mut definitions = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(contents).enumerate() {
        let value = serde_yaml::Value::deserialize(document).map_err(|source| {
            SchemaError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        if value.is_null() {
            continue;
        }
        let Some(mapping) = value.as_mapping() else {
            return Err(SchemaError::NotAMapping {
                path: path.to_path_buf(),
                index,
            });
        };
        let kind = mapping
            .get("kind")
            .and_then(serde_yaml::Value::as_str)
            .map(str::to_owned);
        match kind.as_deref() {
            None => {
                return Err(SchemaError::MissingKind {
                    path: path.to_path_buf(),
                    index,
                })
            }
            Some(CRD_KIND) => {}
            Some(other) => {
                debug!(path = %path.display(), index, kind = other, "skipping non-definition document");
                continue;
            }
        }
        let crd: CustomResourceDefinition =
            serde_yaml::from_value(value).map_err(|source| SchemaError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        crd.validate().map_err(|source| SchemaError::Invalid {
            path: path.to_path_buf(),
            source,
        })?;
        definitions.push(crd);
    }
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const VALID: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: trainingjobs.training.example.io
spec:
  group: training.example.io
  names:
    kind: TrainingJob
    plural: trainingjobs
  scope: Namespaced
  versions:
    - name: v1alpha1
      served: true
      storage: true
      subresources:
        status: {}
"#;

    #[test]
    fn loads_multi_document_files_and_skips_other_kinds() {
        let dir = tempdir().unwrap();
        let contents = format!(
            "{VALID}\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ignored\n---\n"
        );
        fs::write(dir.path().join("bundle.yaml"), contents).unwrap();
        fs::write(dir.path().join("README.md"), "not a definition").unwrap();

        let loaded = load_definitions(&[dir.path()], true).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name(), "trainingjobs.training.example.io");
    }

    #[test]
    fn malformed_yaml_names_the_file() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.yaml");
        fs::write(&bad, "apiVersion: [unterminated\nkind: CustomResourceDefinition").unwrap();

        let err = load_definitions(&[dir.path()], false).unwrap_err();
        match err {
            SchemaError::Parse { path, .. } => assert_eq!(path, bad),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn structurally_invalid_definition_is_rejected() {
        let dir = tempdir().unwrap();
        let invalid = VALID.replace("storage: true", "storage: false");
        fs::write(dir.path().join("invalid.yaml"), invalid).unwrap();

        let err = load_definitions(&[dir.path()], false).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { .. }), "{err}");
    }

    #[test]
    fn missing_kind_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("nokind.yaml"), "metadata:\n  name: x\n").unwrap();
        let err = load_definitions(&[dir.path()], false).unwrap_err();
        assert!(matches!(err, SchemaError::MissingKind { index: 0, .. }));
    }

    #[test]
    fn missing_path_respects_flag() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(load_definitions(&[&missing], false).unwrap().is_empty());
        assert!(matches!(
            load_definitions(&[&missing], true),
            Err(SchemaError::MissingPath(_))
        ));
    }

    #[test]
    fn duplicate_names_across_files_are_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.yaml"), VALID).unwrap();
        fs::write(dir.path().join("b.yml"), VALID).unwrap();
        let err = load_definitions(&[dir.path()], false).unwrap_err();
        assert!(matches!(err, SchemaError::Duplicate { .. }));
    }

    #[test]
    fn json_files_are_accepted() {
        let dir = tempdir().unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(VALID).unwrap();
        let json = serde_json::to_string(&value).unwrap();
        let file = dir.path().join("crd.json");
        fs::write(&file, json).unwrap();
        assert_eq!(load_definitions(&[&file], true).unwrap().len(), 1);
    }
}
