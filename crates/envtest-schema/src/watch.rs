//! ---
//! envtest_section: "02-api-data-model"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "List, watch, and status payloads exchanged over HTTP."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Change notification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A single change to a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: Value,
}

impl WatchEvent {
    /// `metadata.namespace` of the carried object, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.object
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
    }

    /// `metadata.name` of the carried object.
    pub fn name(&self) -> Option<&str> {
        self.object.pointer("/metadata/name").and_then(Value::as_str)
    }
}

/// Batch of events returned by one long-poll watch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchList {
    /// Revision to resume from on the next request.
    pub resource_version: String,
    #[serde(default)]
    pub events: Vec<WatchEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default)]
    pub resource_version: String,
}

/// Collection response for list requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectList {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<Value>,
}

/// Machine-readable failure cause carried in a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusReason {
    NotFound,
    AlreadyExists,
    Conflict,
    Invalid,
    Expired,
    BadRequest,
    MethodNotAllowed,
    InternalError,
}

impl StatusReason {
    /// HTTP status code used for the reason.
    pub fn code(&self) -> u16 {
        match self {
            StatusReason::NotFound => 404,
            StatusReason::AlreadyExists | StatusReason::Conflict => 409,
            StatusReason::Invalid => 422,
            StatusReason::Expired => 410,
            StatusReason::BadRequest => 400,
            StatusReason::MethodNotAllowed => 405,
            StatusReason::InternalError => 500,
        }
    }
}

/// Error body returned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub kind: String,
    pub api_version: String,
    pub status: String,
    pub message: String,
    pub reason: StatusReason,
    pub code: u16,
}

impl Status {
    pub fn failure(reason: StatusReason, message: impl Into<String>) -> Self {
        Self {
            kind: "Status".to_owned(),
            api_version: "v1".to_owned(),
            status: "Failure".to_owned(),
            message: message.into(),
            reason,
            code: reason.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn watch_event_wire_format() {
        let event = WatchEvent {
            event_type: WatchEventType::Modified,
            object: json!({"metadata": {"name": "a", "namespace": "ns"}}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "MODIFIED");
        assert_eq!(event.name(), Some("a"));
        assert_eq!(event.namespace(), Some("ns"));
    }

    #[test]
    fn status_codes_follow_reason() {
        let status = Status::failure(StatusReason::Expired, "too old");
        assert_eq!(status.code, 410);
        assert_eq!(Status::failure(StatusReason::Conflict, "x").code, 409);
    }
}
