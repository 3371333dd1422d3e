//! Configuration file watcher for hot reload.
//!
//! A reload never mutates the running pool: the new file is loaded and
//! validated in full, then handed to the reload callback, which swaps in a
//! freshly built registry.

use crate::config::{load_config, Config};
use crate::util::ShutdownSignal;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Callback invoked with every successfully loaded configuration.
pub type ReloadCallback = Box<dyn Fn(Config) + Send + Sync>;

/// Configuration file watcher.
pub struct ConfigWatcher {
    config_path: PathBuf,
    reload_callback: ReloadCallback,
}

impl ConfigWatcher {
    /// Create a new config watcher.
    pub fn new(config_path: PathBuf, reload_callback: ReloadCallback) -> Self {
        Self {
            config_path,
            reload_callback,
        }
    }

    /// Get the path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Watch for file changes and SIGHUP until shutdown.
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!(path = %self.config_path.display(), "config watcher starting");

        let (tx, mut rx) = mpsc::unbounded_channel();

        let watcher_result: Result<RecommendedWatcher, _> = notify::recommended_watcher(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
        );

        let mut watcher = match watcher_result {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "failed to create file watcher, hot reload disabled");
                shutdown.cancelled().await;
                return;
            }
        };

        // Editors often replace the file instead of writing it in place, so
        // watch the directory and filter by file name.
        let watch_dir = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            error!(error = %e, dir = %watch_dir.display(), "failed to watch config directory");
            shutdown.cancelled().await;
            return;
        }

        #[cfg(unix)]
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "failed to install SIGHUP handler");
                    None
                }
            };

        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    if self.should_reload(&event) {
                        // Collapse the burst of events a single save produces.
                        while let Ok(extra) = rx.try_recv() {
                            drop(extra);
                        }
                        self.try_reload();
                    }
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        match sighup.as_mut() {
                            Some(sig) => sig.recv().await,
                            None => std::future::pending::<Option<()>>().await,
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading configuration");
                    self.try_reload();
                }

                _ = shutdown.cancelled() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    /// Check if this event should trigger a reload.
    fn should_reload(&self, event: &Event) -> bool {
        let is_our_file = event
            .paths
            .iter()
            .any(|p| p.file_name() == self.config_path.file_name());

        is_our_file && matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
    }

    /// Load the file and hand it to the callback, keeping the current pool on failure.
    fn try_reload(&self) {
        match load_config(&self.config_path) {
            Ok(config) => {
                info!(
                    path = %self.config_path.display(),
                    backends = config.backends.len(),
                    "configuration reloaded"
                );
                (self.reload_callback)(config);
            }
            Err(e) => {
                error!(error = %e, "failed to reload config, keeping current backends");
            }
        }
    }
}
