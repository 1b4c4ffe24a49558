//! File system watcher over local source trees.
//!
//! Changes are debounced and broadcast as [`SourceChange`] events; the
//! controller maps them back to the Applications rendering that tree.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::broadcast;

use super::RenderError;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// A debounced change below one watched root.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChange {
    pub root: PathBuf,
    /// Path of the changed entry, relative to `root`.
    pub path: PathBuf,
    pub deleted: bool,
}

impl SourceChange {
    /// True if the change lies inside `dir` (relative to the root).
    pub fn affects(&self, dir: &Path) -> bool {
        let dir = dir.strip_prefix(".").unwrap_or(dir);
        dir.as_os_str().is_empty() || self.path.starts_with(dir)
    }
}

pub struct SourceWatcher {
    roots: Vec<PathBuf>,
    sender: broadcast::Sender<SourceChange>,
    shutdown: Arc<AtomicBool>,
}

impl SourceWatcher {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            roots,
            sender,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceChange> {
        self.sender.subscribe()
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Watches every root until [`stop`](Self::stop) is called. Blocking.
    pub fn watch(&self) -> Result<(), RenderError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut debouncer: Debouncer<RecommendedWatcher> =
            new_debouncer(DEBOUNCE, tx).map_err(|e| RenderError::Watch(e.to_string()))?;

        for root in &self.roots {
            debouncer
                .watcher()
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| RenderError::Watch(format!("{}: {}", root.display(), e)))?;
            log::info!("Watching local source {}", root.display());
        }

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(events)) => {
                    for event in events {
                        if let Some(change) = self.process_event(event) {
                            let _ = self.sender.send(change);
                        }
                    }
                }
                Ok(Err(e)) => log::error!("Source watch error: {}", e),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("Stopped watching local sources");
        Ok(())
    }

    fn process_event(&self, event: DebouncedEvent) -> Option<SourceChange> {
        let root = self
            .roots
            .iter()
            .filter(|r| event.path.starts_with(r))
            .max_by_key(|r| r.as_os_str().len())?;
        let relative = event.path.strip_prefix(root).ok()?.to_path_buf();
        let hidden = relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
        if hidden {
            return None;
        }
        Some(SourceChange {
            root: root.clone(),
            path: relative,
            deleted: !event.path.exists(),
        })
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Runs a [`SourceWatcher`] on a background thread.
pub struct AsyncSourceWatcher {
    watcher: Arc<SourceWatcher>,
    handle: Option<std::thread::JoinHandle<Result<(), RenderError>>>,
}

impl AsyncSourceWatcher {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            watcher: Arc::new(SourceWatcher::new(roots)),
            handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let watcher = Arc::clone(&self.watcher);
        self.handle = Some(std::thread::spawn(move || watcher.watch()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceChange> {
        self.watcher.subscribe()
    }

    pub fn stop(&mut self) {
        self.watcher.stop();
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Err(e)) => log::warn!("Source watcher exited with error: {}", e),
                Err(_) => log::error!("Source watcher thread panicked"),
                Ok(Ok(())) => {}
            }
        }
    }
}

impl Drop for AsyncSourceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
