// src/watcher.rs
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::hub::HubHandle;
use crate::message::Message;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// Decides, one poll at a time, whether the served tree changed since the last reload.
#[derive(Debug, Clone)]
pub struct PollWatcher {
    root: PathBuf,
    last_trigger_time: SystemTime,
    debounce: Duration,
}

impl PollWatcher {
    /// Creates a watcher that treats everything modified before now as already seen.
    pub fn new(root: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self::with_last_trigger(root, debounce, SystemTime::now())
    }

    pub fn with_last_trigger(
        root: impl Into<PathBuf>,
        debounce: Duration,
        last_trigger_time: SystemTime,
    ) -> Self {
        PollWatcher {
            root: root.into(),
            last_trigger_time,
            debounce,
        }
    }

    pub fn last_trigger_time(&self) -> SystemTime {
        self.last_trigger_time
    }

    /// Scans the tree once.
    ///
    /// Returns the changed path when a reload is due, and moves
    /// `last_trigger_time` to now. A change seen within `debounce` of the
    /// previous trigger is left for a later poll.
    pub fn poll(&mut self) -> Option<PathBuf> {
        let changed = find_change(&self.root, self.last_trigger_time)?;
        let now = SystemTime::now();
        if !self.debounce.is_zero() {
            let since_last = now
                .duration_since(self.last_trigger_time)
                .unwrap_or_default();
            if since_last < self.debounce {
                debug!(
                    "Change to {} deferred, last reload was {:?} ago.",
                    changed.display(),
                    since_last
                );
                return None;
            }
        }
        self.last_trigger_time = now;
        Some(changed)
    }
}

/// Walks `root` and returns the first entry modified strictly after `since`.
///
/// The root itself is never reported, and the walk stops at the first hit.
/// Entries that cannot be read are skipped.
pub fn find_change(root: &Path, since: SystemTime) -> Option<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .is_some_and(|modified| modified > since)
        })
        .map(|entry| entry.into_path())
}

/// Polls the configured root forever, broadcasting `reload` on every change.
///
/// The tree walk runs on the blocking pool so a large tree never stalls the
/// runtime. Returns only if the hub stops.
pub async fn run_watcher(app_config: Arc<AppConfig>, hub: HubHandle) -> Result<()> {
    let period = app_config.poll_interval;
    let mut watcher = PollWatcher::new(app_config.root.clone(), app_config.debounce);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "Polling {} every {:?} for changes.",
        app_config.root.display(),
        period
    );

    loop {
        ticker.tick().await;
        let (returned, changed) = match tokio::task::spawn_blocking(move || {
            let changed = watcher.poll();
            (watcher, changed)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("Change scan task failed: {}", e);
                return Err(Error::Io(std::io::Error::other(e)));
            }
        };
        watcher = returned;

        if let Some(path) = changed {
            info!("{} changed, reloading.", path.display());
            hub.broadcast(Message::reload()).await?;
        }
    }
}
