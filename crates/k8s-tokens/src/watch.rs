//! Filesystem watching for projected-volume roots.
//!
//! The platform rotates a projected volume by writing a fresh timestamped
//! snapshot directory and atomically repointing the `..data` symlink at the
//! volume root. [`VolumeWatcher`] listens for events naming that marker and
//! invokes a rescan callback; a periodic tick rescans unconditionally so a
//! lost notification delays convergence instead of preventing it.

use crate::error::ConfigError;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Symlink the rotation mechanism repoints atomically on every refresh.
const UPDATE_MARKER: &str = "..data";

/// Events buffered between the notify thread and the async loop. Rotations
/// are minutes apart, so a small buffer is plenty.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Background watcher over one volume root.
///
/// Owns a notify watcher and the task draining its events. Dropping the
/// handle does not stop the task; call [`VolumeWatcher::shutdown`].
pub(crate) struct VolumeWatcher {
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl VolumeWatcher {
    /// Watch `root` and call `on_change` on rotation or on every poll tick.
    ///
    /// Must run inside a tokio runtime. The callback runs on the watcher
    /// task, so it should be quick and must not block on this watcher.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::BadStorageRoot` when the root cannot be
    /// registered with the platform notification facility.
    pub(crate) fn spawn<F>(
        root: &Path,
        poll_interval: Duration,
        on_change: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);

        let mut watcher =
            notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
                match result {
                    // blocking_send: the notify thread may wait briefly if
                    // the loop is mid-rescan, but events are never dropped.
                    Ok(event) => {
                        let _ = tx.blocking_send(event);
                    }
                    Err(e) => {
                        warn!(target: "k8s_tokens.watch", error = %e, "Watch backend error");
                    }
                }
            })
            .map_err(|e| ConfigError::BadStorageRoot {
                root: root.display().to_string(),
                reason: e.to_string(),
            })?;

        // The marker symlink lives directly at the root.
        watcher
            .watch(root, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::BadStorageRoot {
                root: root.display().to_string(),
                reason: e.to_string(),
            })?;

        debug!(target: "k8s_tokens.watch", root = %root.display(), "Watching volume root");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            watcher,
            rx,
            poll_interval,
            on_change,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            handle: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    /// Stop the watcher task and wait for it to exit.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(target: "k8s_tokens.watch", error = %e, "Watcher task aborted");
            }
        }
    }
}

async fn run_loop<F>(
    watcher: RecommendedWatcher,
    mut rx: mpsc::Receiver<Event>,
    poll_interval: Duration,
    on_change: F,
    cancel: CancellationToken,
) where
    F: Fn() + Send + Sync + 'static,
{
    // Keep the notify backend alive for the lifetime of the loop.
    let _watcher = watcher;

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the caller already scanned.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(target: "k8s_tokens.watch", "Watcher shutting down");
                break;
            }
            _ = ticker.tick() => {
                on_change();
            }
            Some(event) = rx.recv() => {
                // Drain the backlog completely so one rotation burst
                // collapses into a single rescan.
                let mut rotated = names_marker(&event);
                while let Ok(more) = rx.try_recv() {
                    rotated = names_marker(&more) || rotated;
                }
                if rotated {
                    debug!(target: "k8s_tokens.watch", "Rotation marker changed, rescanning");
                    on_change();
                }
            }
        }
    }
}

fn names_marker(event: &Event) -> bool {
    event
        .paths
        .iter()
        .any(|path| path.file_name().is_some_and(|name| name == UPDATE_MARKER))
}
