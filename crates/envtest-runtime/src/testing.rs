//! ---
//! envtest_section: "15-testing-qa-runbook"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "test"
//! envtest_description: "Fixture types for runtime unit tests."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! Types shared by the unit tests in this crate.

use envtest_schema::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::resource::Resource;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetSpec {
    pub size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetStatus {
    pub observed_size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Widget {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WidgetSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WidgetStatus>,
}

impl Widget {
    pub fn new(namespace: &str, name: &str, size: i64) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: WidgetSpec { size },
            status: None,
        }
    }
}

impl Resource for Widget {
    const GROUP: &'static str = "test.example.io";
    const VERSION: &'static str = "v1";
    const KIND: &'static str = "Widget";
    const PLURAL: &'static str = "widgets";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Declares a plural that cannot be served.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Broken {
    pub metadata: ObjectMeta,
}

impl Resource for Broken {
    const GROUP: &'static str = "test.example.io";
    const VERSION: &'static str = "v1";
    const KIND: &'static str = "Broken";
    const PLURAL: &'static str = "Brokens";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
