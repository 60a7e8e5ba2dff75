//! Modification-time watcher for restart trigger files

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Poll interval used when the OS watcher cannot be set up
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Watches one file and reports every forward move of its mtime
pub struct RestartWatcher {
    path: PathBuf,
}

impl RestartWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Call `on_change` each time the file's mtime moves past the last seen
    /// value, until `done` is cancelled. Fails if the file cannot be stat'ed
    /// when watching starts.
    pub async fn run<F>(&self, done: &CancellationToken, mut on_change: F) -> std::io::Result<()>
    where
        F: FnMut(),
    {
        let mut last = modified(&self.path)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        // The watcher stops when dropped, so keep it bound for the whole loop
        let _watcher = match self.os_watcher(tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "File watcher unavailable, polling instead");
                None
            }
        };
        let polling = _watcher.is_none();

        loop {
            tokio::select! {
                _ = done.cancelled() => return Ok(()),
                event = rx.recv(), if !polling => {
                    if event.is_none() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(FALLBACK_POLL_INTERVAL), if polling => {}
            }

            match modified(&self.path) {
                Ok(current) if current > last => {
                    debug!(path = %self.path.display(), "Restart file modified");
                    last = current;
                    on_change();
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "Restart file not readable");
                }
            }
        }
    }

    fn os_watcher(&self, tx: mpsc::UnboundedSender<()>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!(error = %e, "Restart watch error"),
            },
            Config::default(),
        )?;

        // Watch the directory so replaced files (editors, `touch` on some
        // platforms) are still seen
        let target = self.path.parent().unwrap_or(&self.path);
        watcher.watch(target, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}

fn modified(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}
