//! ---
//! envtest_section: "05-networking-external-interfaces"
//! envtest_subsection: "binary"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Control CLI for checking schema bundles and running a standalone control plane."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{Parser, Subcommand};

mod up;
mod validate;

#[derive(Debug, Parser)]
#[command(author, version, about = "envtest control utility", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load definition files and report what they would serve.
    Validate(validate::ValidateCommand),
    /// Start a control plane with preloaded definitions and hold it open.
    Up(up::UpCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Validate(cmd) => {
            envtest_logging::init();
            cmd.execute()
        }
        Commands::Up(cmd) => cmd.execute(),
    }
}
