//! Producer of observed chain heights.
//!
//! Runs either on a poll interval or on a websocket `NewBlock` subscription.
//! Transient failures are forwarded as error events and the watcher keeps
//! going; a watcher that dies on a hiccup would silently stop orchestration.

use std::time::Duration;

use helmsman_chain_client::ChainClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{WatcherError, guarded_send};

#[derive(Debug)]
pub struct HeightWatcher {
    pub heights: mpsc::Receiver<Result<i64, WatcherError>>,
    cancel: CancellationToken,
}

impl HeightWatcher {
    /// Poll the chain tip on a fixed interval.
    pub fn periodic(client: ChainClient, interval: Duration, cancel: CancellationToken) -> Self {
        let (tx, heights) = mpsc::channel(1);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!("height watcher exiting");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let event = client.latest_block_height().await.map_err(WatcherError::from);
                match &event {
                    Ok(height) => debug!(height, "height watcher observed new height"),
                    Err(err) => debug!(error = %err, "height watcher observed an error"),
                }
                if !guarded_send(&tx, &task_cancel, event).await {
                    debug!("height watcher exiting");
                    return;
                }
            }
        });

        Self { heights, cancel }
    }

    /// Subscribe to `NewBlock` events over the node's websocket.
    ///
    /// A stall detector guards the subscription: when no event arrives
    /// within `stall_timeout` the tip is polled out of band. A tip that
    /// advanced means the subscription silently died, so it is torn down and
    /// dialed again; a tip that is stuck means the chain itself is not
    /// producing blocks and there is nothing to do but keep waiting.
    pub async fn streaming(
        client: ChainClient,
        stall_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, WatcherError> {
        // fail fast when the node is not reachable at all
        let mut subscription = client.subscribe_new_block().await?;
        let (tx, heights) = mpsc::channel(1);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut last_height = 0_i64;
            loop {
                let next = tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!("height watcher exiting");
                        subscription.close().await;
                        return;
                    }
                    next = tokio::time::timeout(stall_timeout, subscription.next_height()) => next,
                };

                let event = match next {
                    // no event within the stall window: check the tip directly
                    Err(_elapsed) => match client.latest_block_height().await {
                        Ok(height) if height > last_height => {
                            debug!(
                                height,
                                last_height, "subscription stalled while the tip advanced, resubscribing"
                            );
                            subscription.close().await;
                            match client.subscribe_new_block().await {
                                Ok(new_subscription) => subscription = new_subscription,
                                Err(err) => {
                                    if !guarded_send(&tx, &task_cancel, Err(err.into())).await {
                                        return;
                                    }
                                    continue;
                                }
                            }
                            last_height = height;
                            Ok(height)
                        }
                        Ok(_) => {
                            debug!(last_height, "no new block yet, chain tip is unchanged");
                            continue;
                        }
                        Err(err) => Err(WatcherError::from(err)),
                    },
                    Ok(Some(Ok(height))) => {
                        last_height = height;
                        debug!(height, "height watcher observed new height");
                        Ok(height)
                    }
                    Ok(Some(Err(err))) => Err(WatcherError::from(err)),
                    // server closed the stream; dial a fresh subscription
                    Ok(None) => match client.subscribe_new_block().await {
                        Ok(new_subscription) => {
                            subscription = new_subscription;
                            continue;
                        }
                        Err(err) => Err(WatcherError::from(err)),
                    },
                };

                if !guarded_send(&tx, &task_cancel, event).await {
                    debug!("height watcher exiting");
                    return;
                }
            }
        });

        Ok(Self { heights, cancel })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn periodic_watcher_forwards_errors_and_survives() {
        // nothing listens on this port; every poll fails and the watcher
        // must keep reporting rather than die
        let client =
            ChainClient::new("127.0.0.1", 1, 1, Duration::from_millis(200)).unwrap();
        let mut watcher =
            HeightWatcher::periodic(client, Duration::from_millis(20), CancellationToken::new());

        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(5), watcher.heights.recv())
                .await
                .expect("no event within deadline")
                .expect("watcher channel closed");
            assert!(event.is_err());
        }

        watcher.cancel();
    }
}
