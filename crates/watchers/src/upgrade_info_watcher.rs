//! Watcher for the node-written upgrade plan file.
//!
//! When a governance upgrade reaches its height, the node halts and writes
//! `data/upgrade-info.json`. The appearance of a plan with a new height is
//! the signal to start executing; after emitting it the watcher is done and
//! terminates itself.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use helmsman_types::Plan;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    WatcherError,
    file_watcher::{FileChange, FileWatcher},
    guarded_send,
};

#[derive(Debug)]
pub struct UpgradeInfoWatcher {
    pub plans: mpsc::Receiver<Result<Plan, WatcherError>>,
    cancel: CancellationToken,
}

impl UpgradeInfoWatcher {
    pub fn spawn(
        path: impl Into<PathBuf>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, WatcherError> {
        let path = path.into();
        let (existed, mut file_watcher) =
            FileWatcher::spawn(&path, interval, cancel.child_token()).map_err(|source| {
                WatcherError::Io { path: path.clone(), source }
            })?;

        // a plan that predates the watcher is not a signal; only a height
        // change is
        let mut last_height = if existed { parse_plan_file(&path)?.height } else { 0 };

        let (tx, plans) = mpsc::channel(1);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!("upgrade info watcher exiting");
                        file_watcher.cancel();
                        return;
                    }
                    event = file_watcher.events.recv() => event,
                };

                let Some(event) = event else {
                    debug!("file watcher stopped, upgrade info watcher exiting");
                    return;
                };

                let change = match event {
                    Ok(change) => change,
                    Err(err) => {
                        let failure = WatcherError::Io { path: path.clone(), source: err };
                        if !guarded_send(&tx, &task_cancel, Err(failure)).await {
                            file_watcher.cancel();
                            return;
                        }
                        continue;
                    }
                };
                debug!(?change, "upgrade info watcher observed a file event");

                if !matches!(change, FileChange::Created | FileChange::Modified) {
                    continue;
                }

                match parse_plan_file(&path) {
                    // the file may be created but not fully written yet;
                    // report and wait for the next event
                    Err(err) => {
                        if !guarded_send(&tx, &task_cancel, Err(err)).await {
                            file_watcher.cancel();
                            return;
                        }
                    }
                    Ok(plan) if plan.height != last_height => {
                        last_height = plan.height;
                        let _ = guarded_send(&tx, &task_cancel, Ok(plan)).await;
                        // the plan is the signal; this watcher's job is done
                        file_watcher.cancel();
                        return;
                    }
                    Ok(_) => {}
                }
            }
        });

        Ok(Self { plans, cancel })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn parse_plan_file(path: &Path) -> Result<Plan, WatcherError> {
    let raw = std::fs::read(path).map_err(|source| WatcherError::Io {
        path: path.to_owned(),
        source,
    })?;
    let plan: Plan = serde_json::from_slice(&raw).map_err(|err| WatcherError::InvalidPlan {
        path: path.to_owned(),
        reason: err.to_string(),
    })?;
    if !plan.is_valid() {
        return Err(WatcherError::InvalidPlan {
            path: path.to_owned(),
            reason: format!("name and height must be set; got: {plan:?}"),
        });
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(20);
    const DEADLINE: Duration = Duration::from_secs(5);

    fn plan_json(name: &str, height: i64) -> String {
        format!(r#"{{"name": "{name}", "height": {height}, "info": ""}}"#)
    }

    #[tokio::test]
    async fn emits_plan_when_file_appears() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("upgrade-info.json");
        let mut watcher =
            UpgradeInfoWatcher::spawn(&path, TICK, CancellationToken::new()).unwrap();

        std::fs::write(&path, plan_json("v2", 10)).unwrap();

        let plan = tokio::time::timeout(DEADLINE, watcher.plans.recv())
            .await
            .expect("no plan within deadline")
            .expect("watcher channel closed")
            .expect("watcher reported an error");
        assert_eq!(plan.name, "v2");
        assert_eq!(plan.height, 10);

        // the watcher terminates after delivering the signal
        let closed = tokio::time::timeout(DEADLINE, watcher.plans.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn preexisting_plan_is_not_a_signal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("upgrade-info.json");
        std::fs::write(&path, plan_json("v2", 10)).unwrap();

        let mut watcher =
            UpgradeInfoWatcher::spawn(&path, TICK, CancellationToken::new()).unwrap();

        let quiet = tokio::time::timeout(Duration::from_millis(200), watcher.plans.recv()).await;
        assert!(quiet.is_err(), "a plan that predates the watcher must not fire");

        // a new height in the same file is a signal
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, plan_json("v3", 20)).unwrap();
        let plan = tokio::time::timeout(DEADLINE, watcher.plans.recv())
            .await
            .expect("no plan within deadline")
            .expect("watcher channel closed")
            .expect("watcher reported an error");
        assert_eq!(plan.height, 20);
    }

    #[tokio::test]
    async fn invalid_plan_file_rejected_at_startup() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("upgrade-info.json");
        std::fs::write(&path, r#"{"name": "", "height": 0}"#).unwrap();

        let err = UpgradeInfoWatcher::spawn(&path, TICK, CancellationToken::new()).unwrap_err();
        assert!(matches!(err, WatcherError::InvalidPlan { .. }));
    }

    #[tokio::test]
    async fn half_written_file_reports_error_then_recovers() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("upgrade-info.json");
        let mut watcher =
            UpgradeInfoWatcher::spawn(&path, TICK, CancellationToken::new()).unwrap();

        std::fs::write(&path, "{\"name\": \"v2\",").unwrap();
        let first = tokio::time::timeout(DEADLINE, watcher.plans.recv())
            .await
            .expect("no event within deadline")
            .expect("watcher channel closed");
        assert!(first.is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, plan_json("v2", 10)).unwrap();
        let plan = tokio::time::timeout(DEADLINE, watcher.plans.recv())
            .await
            .expect("no plan within deadline")
            .expect("watcher channel closed")
            .expect("watcher reported an error");
        assert_eq!(plan.height, 10);
    }
}
