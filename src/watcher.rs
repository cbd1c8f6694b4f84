use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::ModifyKind,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinHandle, spawn_blocking},
    time::{Duration, sleep},
};
use tracing::{debug, error, info, warn};

use crate::manager::PluginManager;

/// Something that reacts to files appearing, changing or disappearing.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;

    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// The tasks polling one directory. Dropping it leaves them running;
/// call [`DirectoryWatcher::shutdown`] to stop.
pub struct DirectoryWatcher {
    dir: PathBuf,
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Starts polling `dir` every `poll_interval`. With `initial_scan`, every
    /// relevant file already present is reloaded first; with `enable_retry`,
    /// those reloads are retried a few times before giving up.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        poll_interval: Duration,
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.is_dir() {
            bail!("directory {} does not exist", dir.display());
        }

        // 1) existing files
        if initial_scan {
            for path in existing_files(&dir)? {
                if watched.is_relevant(&path) {
                    try_reload(&watched, &path, enable_retry).await;
                }
            }
        }

        // 2) poll watcher, kept alive by its task; setup errors come back over `ready`
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let watch_dir = dir.clone();
        let handle_watcher = tokio::spawn(async move {
            let started = PollWatcher::new(
                move |res| {
                    // nobody is listening once the dispatcher is gone
                    let _ = tx.send(res);
                },
                Config::default().with_poll_interval(poll_interval),
            )
            .and_then(|mut w| w.watch(&watch_dir, RecursiveMode::Recursive).map(|_| w));
            match started {
                Ok(_watcher) => {
                    let _ = ready_tx.send(Ok(()));
                    futures::future::pending::<()>().await;
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(anyhow!(e).context(format!("watching {}", watch_dir.display()))));
                }
            }
        });
        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => bail!("watcher task for {} ended before starting", dir.display()),
        }

        // 3) dispatch
        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind: EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)),
                        paths,
                        ..
                    }) => {
                        for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                            let inner = watched.clone();
                            tokio::spawn(async move {
                                if let Err(e) = inner.on_create_or_modify(&path).await {
                                    warn!(?path, "failed to handle create/modify: {e:#}");
                                }
                            });
                        }
                    }
                    Ok(Event {
                        kind: EventKind::Remove(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                            if let Err(e) = watched.on_remove(&path).await {
                                warn!(?path, "failed to handle removal: {e:#}");
                            }
                        }
                    }
                    Err(e) => warn!(?e, "watcher error"),
                    _ => {}
                }
            }
        });

        info!("watching {}", dir.display());
        Ok(DirectoryWatcher {
            dir,
            handles: vec![handle_dispatch, handle_watcher],
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Aborts the polling and dispatch tasks.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
        debug!("stopped watching {}", self.dir.display());
    }
}

/// Files directly in `dir` plus those one directory down.
fn existing_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            for nested in std::fs::read_dir(&path)? {
                files.push(nested?.path());
            }
        } else {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) if retry && attempt + 1 < MAX_RETRIES => {
                warn!("retrying reload {:?} (attempt {}): {e:#}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
            Err(e) => {
                error!("failed to reload {:?}: {e:#}", path);
                return;
            }
        }
    }
}

/// Hot reload of plugin manifests: a created or changed manifest reloads
/// its plugin, a removed one shuts it down.
pub struct PluginWatcher {
    manager: Arc<PluginManager>,
}

impl PluginWatcher {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }

    /// Watches the manager's plugin directory.
    pub async fn start(manager: Arc<PluginManager>, poll_interval: Duration) -> Result<DirectoryWatcher> {
        let dir = manager.loader().dir().to_path_buf();
        DirectoryWatcher::new(dir, Arc::new(Self::new(manager)), poll_interval, false, false).await
    }
}

#[async_trait]
impl WatchedType for PluginWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        self.manager.loader().is_manifest_path(path)
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let name = self.manager.loader().read(path)?.manifest.metadata.name;
        let manager = self.manager.clone();
        let plugin = name.clone();
        // plugin code blocks; keep it off the runtime workers
        let reloaded = spawn_blocking(move || manager.reload_plugin(&plugin, None)).await?;
        if !reloaded {
            bail!("plugin `{name}` did not come back after reload");
        }
        info!(plugin = %name, "plugin hot-reloaded from {}", path.display());
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        let Some(name) = self.manager.plugin_for_manifest(path) else {
            debug!("no plugin known for {}", path.display());
            return Ok(());
        };
        let manager = self.manager.clone();
        let plugin = name.clone();
        if spawn_blocking(move || manager.shutdown_plugin(&plugin)).await? {
            info!(plugin = %name, "plugin shut down, manifest {} removed", path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PluginConfigStore, WiseflowConfig},
        manager::WiseflowContext,
        registry::PluginCatalog,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Counting {
        created: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl WatchedType for Counting {
        fn is_relevant(&self, path: &Path) -> bool {
            path.extension().and_then(|e| e.to_str()) == Some("txt")
        }

        async fn on_create_or_modify(&self, _path: &Path) -> Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_remove(&self, _path: &Path) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatches_relevant_changes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("seed.txt"), "x").unwrap();
        let counting = Arc::new(Counting {
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        });
        let watcher = DirectoryWatcher::new(
            dir.path().to_path_buf(),
            counting.clone(),
            Duration::from_millis(50),
            true,
            false,
        )
        .await
        .unwrap();
        assert_eq!(counting.created.load(Ordering::SeqCst), 1);

        std::fs::write(dir.path().join("new.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("ignored.bin"), "hello").unwrap();
        assert!(eventually(|| counting.created.load(Ordering::SeqCst) >= 2).await);

        std::fs::remove_file(dir.path().join("new.txt")).unwrap();
        assert!(eventually(|| counting.removed.load(Ordering::SeqCst) >= 1).await);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let counting = Arc::new(Counting {
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        });
        let res = DirectoryWatcher::new(dir.path().join("nope"), counting, Duration::from_millis(50), false, false).await;
        assert!(res.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manifests_are_hot_reloaded() {
        let dir = tempdir().unwrap();
        let config = WiseflowConfig {
            plugin_dir: dir.path().to_path_buf(),
            ..WiseflowConfig::default()
        };
        let manager = Arc::new(PluginManager::with_parts(
            WiseflowContext::new(config),
            PluginCatalog::builtin(),
            PluginConfigStore::in_memory(),
        ));
        let watcher = PluginWatcher::start(manager.clone(), Duration::from_millis(50))
            .await
            .unwrap();

        let manifest = dir.path().join("shouty.json");
        let staged = dir.path().join("shouty.tmp");
        std::fs::write(
            &staged,
            r#"{"name": "shouty", "version": "1.0.0", "kind": "processor", "factory": "text_cleaner"}"#,
        )
        .unwrap();
        std::fs::rename(&staged, &manifest).unwrap();
        assert!(eventually(|| manager.get_plugin("shouty").is_some()).await);

        std::fs::remove_file(&manifest).unwrap();
        assert!(eventually(|| manager.get_plugin("shouty").is_none()).await);
        watcher.shutdown();
    }
}
