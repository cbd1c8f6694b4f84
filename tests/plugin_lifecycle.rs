use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::Value;
use tempfile::tempdir;
use wiseflow::{
    config::{PluginConfigStore, WiseflowConfig},
    isolation::PluginIsolationManager,
    manager::{PluginManager, WiseflowContext},
    plugin::{
        EventType, FnResource, Plugin, PluginContext, PluginError, PluginMetadata, PluginState,
    },
    registry::PluginCatalog,
};

type Log = Arc<Mutex<Vec<String>>>;

/// Appends its name to the shared log on initialize and on shutdown.
struct Recording {
    name: &'static str,
    depends_on: Option<&'static str>,
    log: Log,
    releases: Arc<AtomicUsize>,
}

impl Plugin for Recording {
    fn metadata(&self) -> PluginMetadata {
        let meta = PluginMetadata::new(self.name, "1.0.0");
        match self.depends_on {
            Some(dep) => meta.with_dependency(dep, ">=1.0"),
            None => meta,
        }
    }

    fn initialize(&mut self, ctx: PluginContext) -> anyhow::Result<()> {
        let releases = self.releases.clone();
        ctx.register_resource(
            "buffer",
            Box::new(FnResource::new(move || {
                releases.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
        self.log.lock().push(format!("init {}", self.name));
        Ok(())
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.log.lock().push(format!("shutdown {}", self.name));
        Ok(())
    }
}

struct Fixture {
    manager: PluginManager,
    log: Log,
    releases: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let config = WiseflowConfig {
        plugin_dir: dir.path().to_path_buf(),
        plugin_timeout_secs: 5,
        ..WiseflowConfig::default()
    };
    let manager = PluginManager::with_parts(
        WiseflowContext::new(config),
        PluginCatalog::new(),
        PluginConfigStore::in_memory(),
    );
    let log: Log = Arc::default();
    let releases = Arc::new(AtomicUsize::new(0));

    // B is registered first so only the dependency puts A ahead of it
    for (name, depends_on) in [("B", Some("A")), ("A", None)] {
        let log = log.clone();
        let releases = releases.clone();
        manager
            .register_plugin(move || {
                Box::new(Recording {
                    name,
                    depends_on,
                    log: log.clone(),
                    releases: releases.clone(),
                })
            })
            .unwrap();
    }

    Fixture {
        manager,
        log,
        releases,
        _dir: dir,
    }
}

#[test]
fn dependencies_initialize_first_and_shut_down_last() {
    let f = fixture();
    let actions = Arc::new(Mutex::new(Vec::new()));
    let seen = actions.clone();
    f.manager.bus().subscribe_fn(Some(EventType::Custom), None, move |e| {
        let action = e.get_str("action").unwrap_or_default();
        let plugin = e.get_str("plugin_name").unwrap_or_default();
        seen.lock().push(format!("{action} {plugin}"));
        Ok(())
    });

    assert_eq!(f.manager.load_all_plugins().unwrap(), vec!["A", "B"]);
    let started = f.manager.initialize_all_plugins();
    assert_eq!(started.get("A"), Some(&true));
    assert_eq!(started.get("B"), Some(&true));

    let all = f.manager.get_all_plugins();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|p| p.state == PluginState::Active));
    assert!(all.iter().all(|p| p.resources == 1));
    assert_eq!(*f.log.lock(), vec!["init A", "init B"]);

    let actions = actions.lock().clone();
    let pos = |s: &str| actions.iter().position(|a| a == s).unwrap();
    assert!(pos("load A") < pos("initialize A"));
    assert!(pos("initialize A") < pos("activate A"));
    assert!(pos("activate A") < pos("initialize B"));

    assert_eq!(f.manager.shutdown_all_plugins(), vec!["B", "A"]);
    assert_eq!(
        *f.log.lock(),
        vec!["init A", "init B", "shutdown B", "shutdown A"]
    );
    assert_eq!(f.releases.load(Ordering::SeqCst), 2);
    assert!(f.manager.get_all_plugins().is_empty());
}

#[test]
fn shutdown_twice_releases_once() {
    let f = fixture();
    f.manager.load_all_plugins().unwrap();
    f.manager.initialize_all_plugins();

    assert!(f.manager.shutdown_plugin("A"));
    assert!(!f.manager.shutdown_plugin("A"));
    assert_eq!(f.releases.load(Ordering::SeqCst), 1);
    assert_eq!(f.manager.resources().count("A"), 0);

    let unloads = f.manager.bus().get_history(Some(EventType::PluginUnloaded), 10);
    assert_eq!(unloads.len(), 1);
    assert_eq!(unloads[0].get("plugin_name"), Some(&Value::from("A")));
}

#[test]
fn dependent_cannot_start_without_its_dependency() {
    let f = fixture();
    f.manager.load_all_plugins().unwrap();
    assert!(!f.manager.initialize_plugin("B", None));
    assert_eq!(f.manager.plugin_status("B"), Some(PluginState::Error));
    assert!(f.log.lock().is_empty());
    assert_eq!(f.manager.bus().get_history(Some(EventType::PluginFailed), 10).len(), 1);
}

#[test]
fn isolated_call_times_out_within_the_window() {
    let iso = PluginIsolationManager::new(true, Duration::from_millis(200));
    let started = Instant::now();
    let err = iso
        .isolate("sleeper")
        .run("work", || {
            std::thread::sleep(Duration::from_secs(3));
            Ok(())
        })
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, PluginError::Execution { .. }));
    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}
