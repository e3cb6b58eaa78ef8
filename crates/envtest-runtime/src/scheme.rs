//! ---
//! envtest_section: "04-configuration-orchestration"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Type registry mapping domain types to group/version/kind."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;

use envtest_schema::GroupVersionKind;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::resource::Resource;

/// Errors raised while registering or converting types.
#[derive(Debug, thiserror::Error)]
pub enum SchemeError {
    #[error("{gvk} is already registered by {existing}")]
    Duplicate {
        gvk: GroupVersionKind,
        existing: &'static str,
    },
    #[error("cannot register {type_name}: {reason}")]
    Invalid {
        type_name: &'static str,
        reason: String,
    },
    #[error("{0} is not registered in the scheme")]
    NotRegistered(&'static str),
    #[error("expected {expected}, found apiVersion '{api_version}' kind '{kind}'")]
    KindMismatch {
        expected: GroupVersionKind,
        api_version: String,
        kind: String,
    },
    #[error("failed to convert {type_name}: {source}")]
    Conversion {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// What the scheme knows about one registered type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRegistration {
    pub gvk: GroupVersionKind,
    pub plural: &'static str,
    pub namespaced: bool,
    pub type_name: &'static str,
}

/// Registry of domain types shared by the manager and its client.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    types: IndexMap<GroupVersionKind, TypeRegistration>,
    by_type: HashMap<TypeId, GroupVersionKind>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`. Registering the same kind twice is rejected.
    pub fn add_known_type<T: Resource>(&mut self) -> Result<(), SchemeError> {
        let type_name = type_name::<T>();
        validate_registration::<T>().map_err(|reason| SchemeError::Invalid { type_name, reason })?;
        let gvk = T::gvk();
        if let Some(existing) = self.types.get(&gvk) {
            return Err(SchemeError::Duplicate {
                gvk,
                existing: existing.type_name,
            });
        }
        if let Some(existing) = self.by_type.get(&TypeId::of::<T>()) {
            return Err(SchemeError::Duplicate {
                gvk: existing.clone(),
                existing: type_name,
            });
        }
        debug!(gvk = %gvk, type_name, "type registered");
        self.by_type.insert(TypeId::of::<T>(), gvk.clone());
        self.types.insert(
            gvk.clone(),
            TypeRegistration {
                gvk,
                plural: T::PLURAL,
                namespaced: T::NAMESPACED,
                type_name,
            },
        );
        Ok(())
    }

    pub fn is_registered<T: Resource>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.types.contains_key(gvk)
    }

    pub fn registration<T: Resource>(&self) -> Result<&TypeRegistration, SchemeError> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|gvk| self.types.get(gvk))
            .ok_or(SchemeError::NotRegistered(type_name::<T>()))
    }

    pub fn registration_for(&self, gvk: &GroupVersionKind) -> Option<&TypeRegistration> {
        self.types.get(gvk)
    }

    pub fn registrations(&self) -> impl Iterator<Item = &TypeRegistration> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Serialize `object` with `apiVersion` and `kind` stamped from its registration.
    pub fn encode<T: Resource>(&self, object: &T) -> Result<Value, SchemeError> {
        let registration = self.registration::<T>()?;
        let mut value = serde_json::to_value(object).map_err(|source| SchemeError::Conversion {
            type_name: registration.type_name,
            source,
        })?;
        match value.as_object_mut() {
            Some(map) => {
                map.insert("apiVersion".into(), Value::String(registration.gvk.api_version()));
                map.insert("kind".into(), Value::String(registration.gvk.kind.clone()));
            }
            None => {
                return Err(SchemeError::Invalid {
                    type_name: registration.type_name,
                    reason: "does not serialize to a JSON object".into(),
                })
            }
        }
        Ok(value)
    }

    /// Deserialize `value` into `T` after checking its `apiVersion` and `kind`.
    pub fn decode<T: Resource>(&self, value: Value) -> Result<T, SchemeError> {
        let registration = self.registration::<T>()?;
        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
        if api_version != registration.gvk.api_version() || kind != registration.gvk.kind {
            return Err(SchemeError::KindMismatch {
                expected: registration.gvk.clone(),
                api_version: api_version.to_owned(),
                kind: kind.to_owned(),
            });
        }
        serde_json::from_value(value).map_err(|source| SchemeError::Conversion {
            type_name: registration.type_name,
            source,
        })
    }
}

fn validate_registration<T: Resource>() -> Result<(), String> {
    if T::GROUP.trim().is_empty() {
        return Err("group must not be empty".into());
    }
    if T::VERSION.trim().is_empty() {
        return Err("version must not be empty".into());
    }
    if !T::KIND.chars().next().is_some_and(char::is_uppercase) {
        return Err(format!("kind '{}' must start with an uppercase letter", T::KIND));
    }
    if T::PLURAL.is_empty() || T::PLURAL != T::PLURAL.to_lowercase() {
        return Err(format!("plural '{}' must be non-empty and lowercase", T::PLURAL));
    }
    Ok(())
}

type RegisterFn = Box<dyn Fn(&mut Scheme) -> Result<(), SchemeError> + Send + Sync>;

/// Collects type registrations and applies them to a [`Scheme`] in one step.
#[derive(Default)]
pub struct SchemeBuilder {
    registrations: Vec<RegisterFn>,
    names: Vec<&'static str>,
}

impl fmt::Debug for SchemeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemeBuilder")
            .field("types", &self.names)
            .finish()
    }
}

impl SchemeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Resource>(mut self) -> Self {
        self.names.push(type_name::<T>());
        self.registrations
            .push(Box::new(|scheme: &mut Scheme| scheme.add_known_type::<T>()));
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Apply every registration. On error `scheme` is left unchanged.
    pub fn add_to_scheme(&self, scheme: &mut Scheme) -> Result<(), SchemeError> {
        let mut staged = scheme.clone();
        for register in &self.registrations {
            register(&mut staged)?;
        }
        *scheme = staged;
        Ok(())
    }

    pub fn build(&self) -> Result<Scheme, SchemeError> {
        let mut scheme = Scheme::new();
        self.add_to_scheme(&mut scheme)?;
        Ok(scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Broken, Widget, WidgetSpec};
    use serde_json::json;

    #[test]
    fn encode_stamps_type_meta_and_decode_checks_it() {
        let scheme = SchemeBuilder::new().register::<Widget>().build().unwrap();
        let widget = Widget::new("ns", "w", 3);
        let value = scheme.encode(&widget).unwrap();
        assert_eq!(value["apiVersion"], "test.example.io/v1");
        assert_eq!(value["kind"], "Widget");

        let decoded: Widget = scheme.decode(value).unwrap();
        assert_eq!(decoded.spec, WidgetSpec { size: 3 });

        let wrong = json!({"apiVersion": "test.example.io/v1", "kind": "Gadget", "metadata": {}});
        assert!(matches!(
            scheme.decode::<Widget>(wrong),
            Err(SchemeError::KindMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut scheme = Scheme::new();
        scheme.add_known_type::<Widget>().unwrap();
        let err = scheme.add_known_type::<Widget>().unwrap_err();
        assert!(matches!(err, SchemeError::Duplicate { .. }));
        assert_eq!(scheme.len(), 1);
    }

    #[test]
    fn invalid_registration_leaves_scheme_untouched() {
        let mut scheme = Scheme::new();
        let builder = SchemeBuilder::new().register::<Widget>().register::<Broken>();
        let err = builder.add_to_scheme(&mut scheme).unwrap_err();
        assert!(matches!(err, SchemeError::Invalid { .. }), "{err}");
        assert!(scheme.is_empty());
    }

    #[test]
    fn unregistered_types_cannot_be_encoded() {
        let scheme = Scheme::new();
        assert!(matches!(
            scheme.encode(&Widget::new("ns", "w", 1)),
            Err(SchemeError::NotRegistered(_))
        ));
    }
}
