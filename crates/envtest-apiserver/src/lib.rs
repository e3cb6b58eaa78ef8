//! ---
//! envtest_section: "05-networking-external-interfaces"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Network connectivity and edge adapters."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! In-memory control plane for envtest suites.
//!
//! [`ObjectStore`] keeps definitions and custom objects with server-assigned
//! metadata and a bounded change history; [`ControlPlane`] exposes it over
//! HTTP with list, long-poll watch, and status subresource endpoints.

pub mod server;
pub mod store;

pub use server::{router, ControlPlane, RunningControlPlane, ServerError};
pub use store::{ObjectStore, StoreError, StoreResult, DEFAULT_HISTORY_LIMIT};
