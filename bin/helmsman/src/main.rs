use clap::Parser as _;

use crate::opts::{Helmsman, HelmsmanSubcommand};

mod cmd;
mod opts;

/// Force-install the default crypto provider.
///
/// Necessary in case more than one backend is enabled in rustls (ring,
/// aws-lc-rs); the websocket client refuses to start without a default.
fn install_crypto_provider() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install default rustls crypto provider");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    install_crypto_provider();

    let args = Helmsman::parse();

    match args.cmd {
        HelmsmanSubcommand::Run(cmd) => cmd.run().await,
        HelmsmanSubcommand::Upgrades(cmd) => cmd.run().await,
        HelmsmanSubcommand::Versions(cmd) => cmd.run().await,
        HelmsmanSubcommand::Version => {
            println!("helmsman {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
