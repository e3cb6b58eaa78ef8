//! ---
//! envtest_section: "04-configuration-orchestration"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Scheme, typed client, and reconciliation manager."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! Client-side runtime for envtest suites.
//!
//! Domain types implement [`Resource`] and are registered in a [`Scheme`].
//! A [`Manager`] is built against a [`ConnectionConfig`], given one
//! [`Reconciler`] per kind, and started on a background task. Its [`Client`]
//! is valid for as long as the manager is.

pub mod client;
mod controller;
pub mod manager;
pub mod reconciler;
pub mod resource;
pub mod scheme;

#[cfg(test)]
mod testing;

pub use client::{Client, ClientError, ConnectionConfig};
pub use manager::{Manager, ManagerError, ManagerHandle, ManagerStatus};
pub use reconciler::{Action, ReconcileContext, ReconcileError, Reconciler, ReconcilerConfig, Request};
pub use resource::Resource;
pub use scheme::{Scheme, SchemeBuilder, SchemeError, TypeRegistration};

pub use async_trait::async_trait;
