use clap::{Parser, Subcommand};

use crate::cmd::{run::RunArgs, upgrades::UpgradesArgs, versions::VersionsArgs};

#[derive(Parser, Debug)]
#[command(version, about = "Validator-side upgrade orchestrator", long_about = None)]
pub struct Helmsman {
    #[command(subcommand)]
    pub cmd: HelmsmanSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum HelmsmanSubcommand {
    /// Run the daemon next to the managed node.
    Run(RunArgs),
    /// Inspect and mutate the upgrade registry of a running daemon.
    Upgrades(UpgradesArgs),
    /// Inspect and mutate the registered versions of a running daemon.
    Versions(VersionsArgs),
    /// Print the build version.
    Version,
}
