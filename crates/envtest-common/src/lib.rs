//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Shared configuration primitives for the harness workspace."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
//! Shared configuration for the envtest workspace.
//! This crate owns the TOML configuration model consumed by the harness,
//! the logging crate, and the control CLI.

pub mod config;

pub use config::{
    ControlPlaneConfig, HarnessConfig, LoadedHarnessConfig, LogFormat, LoggingConfig,
    ManagerConfig, ProcessSpec, SetupConfig, TeardownConfig,
};
