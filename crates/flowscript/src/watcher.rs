//! Flow File Watcher
//!
//! Reloads the running flow whenever its file changes on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::flow::FlowLoader;
use crate::runner::FlowRunner;

/// Editors write in bursts; events closer together than this are coalesced
const SETTLE_DELAY: Duration = Duration::from_millis(100);

pub struct FlowWatcher {
    path: PathBuf,
    rx: mpsc::Receiver<()>,
    /// The underlying watcher (kept alive)
    _watcher: RecommendedWatcher,
}

impl FlowWatcher {
    /// Watch the directory containing `path` for changes to that file
    pub fn new(path: impl AsRef<Path>) -> Result<Self, notify::Error> {
        let path = path
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| path.as_ref().to_path_buf());
        let (tx, rx) = mpsc::channel(16);

        let target = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if Self::is_relevant(&target, &event) {
                    let _ = tx.try_send(());
                }
            }
            Err(e) => error!("File watcher error: {}", e),
        })?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!("Watching flow file: {}", path.display());

        Ok(Self {
            path,
            rx,
            _watcher: watcher,
        })
    }

    fn is_relevant(target: &Path, event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::Modify(_) | EventKind::Create(_)
        ) && event.paths.iter().any(|p| p == target)
    }

    /// Reload `runner` on every change until the watcher is dropped
    pub async fn run(mut self, runner: Arc<FlowRunner>) {
        while self.rx.recv().await.is_some() {
            tokio::time::sleep(SETTLE_DELAY).await;
            while self.rx.try_recv().is_ok() {}

            debug!("Flow file changed: {}", self.path.display());
            match FlowLoader::load(&self.path).await {
                Ok(flow) => {
                    runner.reload(&flow).await;
                }
                Err(e) => warn!("Keeping previous flow, reload failed: {}", e),
            }
        }
        info!("Flow watcher stopped");
    }
}
