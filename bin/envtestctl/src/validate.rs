//! ---
//! envtest_section: "05-networking-external-interfaces"
//! envtest_subsection: "binary"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Offline validation of definition bundles and harness configuration."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use envtest_common::HarnessConfig;
use envtest_schema::load_definitions;

#[derive(Debug, Args)]
pub struct ValidateCommand {
    /// Definition files or directories to load.
    #[arg(value_name = "PATH", required = true, num_args = 1..)]
    paths: Vec<PathBuf>,

    /// Also parse and validate a harness configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl ValidateCommand {
    pub fn execute(self) -> Result<()> {
        if let Some(path) = &self.config {
            HarnessConfig::from_path(path)?;
            println!("config {}: ok", path.display());
        }
        let definitions = load_definitions(self.paths.as_slice(), true).context("definition bundle is invalid")?;
        for definition in &definitions {
            let served = definition
                .served_resources()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            println!("{}: {served}", definition.name());
        }
        println!("{} definition(s) ok", definitions.len());
        Ok(())
    }
}
