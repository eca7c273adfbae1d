//! Periodic registry refresh.
//!
//! Each tick fetches the chain tip and runs one committing registry update;
//! the registry's internal fan-out refreshes every configured provider in a
//! single pass. Failures are temporary more often than not (network blips,
//! node restarts), so they are reported on an error channel and the watcher
//! keeps its cadence.

use std::{sync::Arc, time::Duration};

use helmsman_chain_client::ChainClient;
use helmsman_registry::UpgradeRegistry;
use helmsman_types::UpgradeStatus;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{WatcherError, guarded_send};

#[derive(Debug)]
pub struct UpgradeProposalsWatcher {
    pub errors: mpsc::Receiver<WatcherError>,
    cancel: CancellationToken,
}

impl UpgradeProposalsWatcher {
    pub fn spawn(
        client: ChainClient,
        registry: Arc<UpgradeRegistry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, errors) = mpsc::channel(1);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!("proposals watcher exiting");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let tip = match client.latest_block_height().await {
                    Ok(tip) => tip,
                    Err(err) => {
                        if !guarded_send(&tx, &task_cancel, err.into()).await {
                            return;
                        }
                        continue;
                    }
                };

                debug!(height = tip, "fetching upgrade proposals");
                let upgrades = match registry.update(tip, true).await {
                    Ok(outcome) => outcome.upgrades,
                    Err(err) => {
                        if !guarded_send(&tx, &task_cancel, err.into()).await {
                            return;
                        }
                        continue;
                    }
                };

                let upcoming = registry.upcoming_upgrades_cached(tip, &[UpgradeStatus::Active]);
                info!(
                    active = upcoming.len(),
                    resolved = upgrades.len(),
                    height = tip,
                    "refreshed upgrades from all providers",
                );
            }
        });

        Self { errors, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
