//! Interval-polling watcher for a single file.
//!
//! Filesystem notification APIs behave differently across the mounts chain
//! homes tend to live on (NFS, bind mounts, overlayfs), so the portable
//! default is modification-time polling.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::guarded_send;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileChange {
    Removed,
    Created,
    Modified,
}

#[derive(Debug)]
pub struct FileWatcher {
    pub events: mpsc::Receiver<Result<FileChange, std::io::Error>>,
    cancel: CancellationToken,
}

impl FileWatcher {
    /// Start watching `path`. Returns whether the file existed at start.
    pub fn spawn(
        path: impl Into<PathBuf>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(bool, Self), std::io::Error> {
        let path = path.into();
        // a missing file stats as "zero" mod time, so the first creation is
        // seen as a change like any other
        let (mut exists, mut last_mod_time) = file_status(&path)?;
        let initially_exists = exists;

        let (tx, events) = mpsc::channel(1);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!(path = %path.display(), "file watcher exiting");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let event = match file_status(&path) {
                    Err(err) => Some(Err(err)),
                    Ok((now_exists, mod_time)) => {
                        if now_exists != exists {
                            exists = now_exists;
                            if now_exists {
                                last_mod_time = mod_time;
                                Some(Ok(FileChange::Created))
                            } else {
                                Some(Ok(FileChange::Removed))
                            }
                        } else if mod_time > last_mod_time {
                            last_mod_time = mod_time;
                            Some(Ok(FileChange::Modified))
                        } else {
                            None
                        }
                    }
                };

                if let Some(event) = event {
                    if !guarded_send(&tx, &task_cancel, event).await {
                        debug!(path = %path.display(), "file watcher exiting");
                        return;
                    }
                }
            }
        });

        Ok((initially_exists, Self { events, cancel }))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn file_status(path: &Path) -> Result<(bool, SystemTime), std::io::Error> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok((true, meta.modified()?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Ok((false, SystemTime::UNIX_EPOCH))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(20);

    async fn next_change(watcher: &mut FileWatcher) -> FileChange {
        tokio::time::timeout(Duration::from_secs(5), watcher.events.recv())
            .await
            .expect("no event within deadline")
            .expect("watcher channel closed")
            .expect("watcher reported an error")
    }

    #[tokio::test]
    async fn detects_create_modify_remove() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("upgrade-info.json");

        let (existed, mut watcher) =
            FileWatcher::spawn(&path, TICK, CancellationToken::new()).unwrap();
        assert!(!existed);

        std::fs::write(&path, b"{}").unwrap();
        assert_eq!(next_change(&mut watcher).await, FileChange::Created);

        // modification times can be coarse; wait until the clock ticks over
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, b"{\"height\": 1}").unwrap();
        assert_eq!(next_change(&mut watcher).await, FileChange::Modified);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(next_change(&mut watcher).await, FileChange::Removed);

        watcher.cancel();
    }

    #[tokio::test]
    async fn existing_file_reports_no_initial_event() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("upgrade-info.json");
        std::fs::write(&path, b"{}").unwrap();

        let (existed, mut watcher) =
            FileWatcher::spawn(&path, TICK, CancellationToken::new()).unwrap();
        assert!(existed);

        let quiet =
            tokio::time::timeout(Duration::from_millis(200), watcher.events.recv()).await;
        assert!(quiet.is_err(), "no event expected for an untouched file");
    }
}
