//! Long-lived watcher tasks feeding the orchestration loop.
//!
//! Three producers run concurrently with the main loop: the height watcher
//! (chain tip), the proposals watcher (periodic registry sync) and the
//! upgrade-info watcher (the plan file the node writes when a governance
//! upgrade halts the chain). Each pushes into a single-receiver channel and
//! honors a cancellation token; every downstream send is guarded by that
//! token so a watcher can never deadlock against a consumer that already
//! stopped draining.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod file_watcher;
mod height_watcher;
mod proposals_watcher;
mod upgrade_info_watcher;

pub use height_watcher::HeightWatcher;
pub use proposals_watcher::UpgradeProposalsWatcher;
pub use upgrade_info_watcher::UpgradeInfoWatcher;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error(transparent)]
    Chain(#[from] helmsman_chain_client::ChainClientError),
    #[error(transparent)]
    Registry(#[from] helmsman_registry::RegistryError),
    #[error("could not watch {path}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid upgrade plan in {path}: {reason}")]
    InvalidPlan { path: std::path::PathBuf, reason: String },
}

/// Send guarded by the cancel token. Returns `false` when the watcher should
/// exit, either because it was cancelled or because the receiver is gone.
pub(crate) async fn guarded_send<T>(
    tx: &mpsc::Sender<T>,
    cancel: &CancellationToken,
    value: T,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(value) => sent.is_ok(),
    }
}
