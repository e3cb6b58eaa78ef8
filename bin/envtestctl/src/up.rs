//! ---
//! envtest_section: "05-networking-external-interfaces"
//! envtest_subsection: "binary"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Standalone control plane for manual runs against preloaded definitions."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use envtest_common::HarnessConfig;
use envtest_harness::{EnvironmentBootstrapper, EnvironmentStage, ProcessStage, TeardownCoordinator, CONNECTION_ENV};
use tokio::runtime::Runtime;
use tracing::info;

#[derive(Debug, Args)]
pub struct UpCommand {
    /// Harness configuration file. Falls back to ENVTEST_CONFIG, then ./envtest.toml.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Extra definition directories, added to the configured ones.
    #[arg(long = "schemas", value_name = "DIR")]
    schemas: Vec<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(long, value_name = "SECS")]
    hold: Option<u64>,
}

impl UpCommand {
    pub fn execute(self) -> Result<()> {
        let mut candidates = Vec::new();
        if let Some(path) = &self.config {
            candidates.push(path.clone());
        }
        candidates.push(PathBuf::from("envtest.toml"));
        let loaded = HarnessConfig::load(&candidates)?;
        let mut config = loaded.config;
        envtest_logging::init_tracing("envtestctl", &config.logging)?;
        info!(source = %loaded.source.display(), "configuration loaded");
        config.control_plane.schema_directories.extend(self.schemas);
        config.control_plane.error_if_schema_path_missing = true;

        let runtime = Runtime::new()?;
        runtime.block_on(serve(config, self.hold.map(Duration::from_secs)))
    }
}

async fn serve(config: HarnessConfig, hold: Option<Duration>) -> Result<()> {
    let environment = EnvironmentBootstrapper::new(config.control_plane.clone())
        .start()
        .await
        .context("control plane did not start")?;
    println!("{CONNECTION_ENV}={}", environment.connection_file().display());
    println!("{}", serde_json::to_string(environment.connection())?);

    match hold {
        Some(hold) => tokio::time::sleep(hold).await,
        None => {
            tokio::signal::ctrl_c().await?;
            info!("interrupt received; stopping");
        }
    }

    let (processes, resources) = environment.into_parts();
    let mut coordinator = TeardownCoordinator::new(config.teardown.stop_timeout);
    coordinator
        .push(Box::new(ProcessStage::new(processes, config.teardown.grace_period)))
        .push(Box::new(EnvironmentStage::new(Some(resources), config.teardown.stop_timeout)));
    coordinator.run().await?;
    Ok(())
}
