//! The plugin manager: discovery, checks, dependency ordering and the
//! lifecycle of live instances.
//!
//! All registries sit behind one lock. Plugin code (constructors,
//! `initialize`, `shutdown`, capability calls) never runs while it is held;
//! it runs on isolation threads against an `Arc<Mutex<Box<dyn Plugin>>>`.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use crossbeam_utils::atomic::AtomicCell;
use opentelemetry::KeyValue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use semver::Version;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use wiseflow_plugin::{
    Event, EventType, Plugin, PluginContext, PluginError, PluginKind, PluginMetadata, PluginState,
    metadata::parse_loose_version,
};

use crate::{
    config::{PluginConfigStore, WiseflowConfig},
    dependency::DependencyResolver,
    event_bus::EventBus,
    host::ManagerHost,
    isolation::PluginIsolationManager,
    lifecycle::PluginLifecycleManager,
    loader::{DiscoveredManifest, PluginLoader},
    logger::metrics,
    registry::{PluginCatalog, PluginClass, PluginDescriptor, PluginSource},
    resources::ResourceManager,
    security::{self, SecurityPolicy},
    util::sha256_hex,
};

/// Process-wide services, built once at startup and handed to whoever needs them.
#[derive(Debug, Clone)]
pub struct WiseflowContext {
    pub bus: EventBus,
    pub config: Arc<WiseflowConfig>,
}

impl WiseflowContext {
    pub fn new(config: WiseflowConfig) -> Self {
        Self {
            bus: EventBus::new(config.event_bus.to_bus_config()),
            config: Arc::new(config),
        }
    }
}

/// Snapshot of a plugin as seen from outside the manager.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub kind: PluginKind,
    pub state: PluginState,
    pub is_enabled: bool,
    pub error: Option<String>,
    pub resources: usize,
    pub metadata: PluginMetadata,
}

type SharedPlugin = Arc<Mutex<Box<dyn Plugin>>>;

struct PluginInstance {
    plugin: SharedPlugin,
    class: Arc<PluginClass>,
    metadata: PluginMetadata,
    config: Map<String, Value>,
    state: Arc<AtomicCell<PluginState>>,
    error: Option<String>,
    is_enabled: bool,
    host: Arc<ManagerHost>,
}

/// A plugin that is not live but whose status is still reported.
#[derive(Debug, Clone)]
struct PluginRecord {
    metadata: PluginMetadata,
    state: PluginState,
    error: Option<String>,
}

#[derive(Default)]
struct Registry {
    catalog: PluginCatalog,
    manifests: HashMap<String, DiscoveredManifest>,
    plugin_classes: HashMap<String, Arc<PluginClass>>,
    plugins: HashMap<String, PluginInstance>,
    connectors: BTreeSet<String>,
    processors: BTreeSet<String>,
    analyzers: BTreeSet<String>,
    records: HashMap<String, PluginRecord>,
    hashes: HashMap<String, String>,
    load_order: Vec<String>,
    /// Names whose `initialize_plugin` is running outside the lock.
    initializing: HashSet<String>,
}

impl Registry {
    fn kind_set(&mut self, kind: PluginKind) -> Option<&mut BTreeSet<String>> {
        match kind {
            PluginKind::Connector => Some(&mut self.connectors),
            PluginKind::Processor => Some(&mut self.processors),
            PluginKind::Analyzer => Some(&mut self.analyzers),
            PluginKind::Generic => None,
        }
    }

    /// What a not-yet-loaded plugin declares about itself.
    fn declared_metadata(&self, name: &str) -> Option<PluginMetadata> {
        if let Some(m) = self.manifests.get(name) {
            return Some(m.manifest.metadata.clone());
        }
        self.catalog.get(name).map(|d| d.metadata.clone())
    }

    /// Catalog names first, in registration order, then manifest-only names.
    fn discovered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog.names().map(str::to_string).collect();
        let mut from_manifests: Vec<(&PathBuf, &String)> = self
            .manifests
            .iter()
            .filter(|(name, _)| !self.catalog.contains(name))
            .map(|(name, m)| (&m.path, name))
            .collect();
        from_manifests.sort();
        names.extend(from_manifests.into_iter().map(|(_, n)| n.clone()));
        names
    }

    /// Live plugins in reverse load order; anything not in the order last.
    fn shutdown_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self
            .load_order
            .iter()
            .rev()
            .filter(|n| self.plugins.contains_key(*n))
            .cloned()
            .collect();
        let mut rest: Vec<String> = self
            .plugins
            .keys()
            .filter(|n| !order.contains(n))
            .cloned()
            .collect();
        rest.sort();
        order.extend(rest);
        order
    }
}

/// Everything needed to build a class, resolved under the lock.
struct LoadRequest {
    descriptor: PluginDescriptor,
    metadata: PluginMetadata,
    kind: PluginKind,
    imports: Vec<String>,
    attributes: Vec<String>,
    enabled: bool,
    default_config: Map<String, Value>,
    source: PluginSource,
    hash: String,
}

pub struct PluginManager {
    ctx: WiseflowContext,
    registry: Mutex<Registry>,
    settled: Condvar,
    isolation: PluginIsolationManager,
    lifecycle: PluginLifecycleManager,
    resources: Arc<ResourceManager>,
    host: Arc<ManagerHost>,
    config_store: PluginConfigStore,
    loader: PluginLoader,
    security: SecurityPolicy,
    resolver: DependencyResolver,
    system_version: Version,
}

/// Clears the in-flight mark of one initialize and wakes whoever waits on it.
struct InFlight<'a> {
    manager: &'a PluginManager,
    name: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.manager.registry.lock().initializing.remove(self.name);
        self.manager.settled.notify_all();
    }
}

impl PluginManager {
    /// Manager with the builtin catalog and the config file named in `ctx`.
    pub fn new(ctx: WiseflowContext) -> anyhow::Result<Self> {
        let store = PluginConfigStore::json_file(&ctx.config.plugin_config_file)?;
        Ok(Self::with_parts(ctx, PluginCatalog::builtin(), store))
    }

    pub fn with_parts(ctx: WiseflowContext, catalog: PluginCatalog, config_store: PluginConfigStore) -> Self {
        let config = ctx.config.clone();
        let system_version = parse_loose_version(&config.system_version).unwrap_or_else(|| {
            warn!("invalid system version `{}`, using 0.0.0", config.system_version);
            Version::new(0, 0, 0)
        });
        let resources = Arc::new(ResourceManager::new());
        let host = Arc::new(ManagerHost::new(ctx.bus.clone(), resources.clone()));
        Self {
            lifecycle: PluginLifecycleManager::new(ctx.bus.clone()),
            isolation: config.isolation_manager(),
            registry: Mutex::new(Registry {
                catalog,
                ..Registry::default()
            }),
            settled: Condvar::new(),
            resources,
            host,
            config_store,
            loader: PluginLoader::new(&config.plugin_dir),
            security: config.security.clone(),
            resolver: DependencyResolver::new(),
            system_version,
            ctx,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    pub fn context(&self) -> &WiseflowContext {
        &self.ctx
    }

    pub fn lifecycle(&self) -> &PluginLifecycleManager {
        &self.lifecycle
    }

    pub fn isolation(&self) -> &PluginIsolationManager {
        &self.isolation
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Adds a compiled-in plugin to the catalog; it is picked up by the next
    /// discovery.
    pub fn register_plugin<F>(&self, factory: F) -> Result<String, PluginError>
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.registry.lock().catalog.register(factory)
    }

    // ---- discovery & loading -------------------------------------------------

    /// Names of every plugin that could be loaded: the catalog plus the
    /// manifests currently in the plugin directory.
    pub fn discover_plugins(&self) -> Vec<String> {
        let scanned = self.loader.scan();
        let mut reg = self.registry.lock();
        reg.manifests.clear();
        for m in scanned {
            let name = m.manifest.metadata.name.clone();
            if let Some(previous) = reg.manifests.get(&name) {
                warn!(
                    plugin = %name,
                    "manifest {} shadows {}",
                    m.path.display(),
                    previous.path.display()
                );
            }
            reg.manifests.insert(name, m);
        }
        let names = reg.discovered_names();
        debug!(count = names.len(), "plugins discovered");
        names
    }

    /// Runs every load check and registers the class. Failures are logged,
    /// recorded as `Error` and reported through the lifecycle; `None` is returned.
    pub fn load_plugin(&self, name: &str) -> Option<Arc<PluginClass>> {
        match self.try_load_plugin(name) {
            Ok(class) => {
                metrics().plugins_loaded.add(1, &[KeyValue::new("plugin", name.to_string())]);
                info!(plugin = name, version = %class.metadata.version, kind = %class.kind, "plugin loaded");
                self.lifecycle.on_plugin_load(&class.metadata);
                self.publish(EventType::PluginLoaded, &class.metadata, None);
                Some(class)
            }
            Err(err) => {
                let metadata = self
                    .registry
                    .lock()
                    .declared_metadata(name)
                    .unwrap_or_else(|| PluginMetadata::new(name, "0.0.0"));
                self.fail(&metadata, &err);
                None
            }
        }
    }

    fn load_request(&self, name: &str) -> Result<LoadRequest, PluginError> {
        let reg = self.registry.lock();
        let not_found = |reason: String| PluginError::Load {
            plugin: name.to_string(),
            reason,
        };

        if let Some(found) = reg.manifests.get(name) {
            let m = &found.manifest;
            let descriptor = reg
                .catalog
                .get(m.factory_key())
                .cloned()
                .ok_or_else(|| not_found(format!("no compiled plugin named `{}`", m.factory_key())))?;
            return Ok(LoadRequest {
                descriptor,
                metadata: m.metadata.clone(),
                kind: m.kind,
                imports: m.imports.clone(),
                attributes: m.attributes.clone(),
                enabled: m.enabled,
                default_config: m.config.clone(),
                source: PluginSource::Manifest(found.path.clone()),
                hash: found.hash.clone(),
            });
        }

        let descriptor = reg
            .catalog
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("not found in catalog or plugin directory".into()))?;
        let hash = sha256_hex(&serde_json::to_vec(&descriptor.metadata).unwrap_or_default());
        Ok(LoadRequest {
            metadata: descriptor.metadata.clone(),
            kind: descriptor.kind,
            imports: Vec::new(),
            attributes: Vec::new(),
            enabled: true,
            default_config: Map::new(),
            source: PluginSource::Catalog,
            hash,
            descriptor,
        })
    }

    fn try_load_plugin(&self, name: &str) -> Result<Arc<PluginClass>, PluginError> {
        // 1) where it comes from
        let req = self.load_request(name)?;
        let mut metadata = req.metadata;

        // 2) declared imports and attributes
        self.security
            .check(name, metadata.security_level, &req.imports, &req.attributes)?;

        // 3) integrity
        {
            let mut reg = self.registry.lock();
            if let Some(previous) = reg.hashes.insert(name.to_string(), req.hash.clone()) {
                if previous != req.hash {
                    info!(plugin = name, previous = %previous, current = %req.hash, "plugin content changed");
                }
            }
        }

        // 4) metadata and system version
        security::validate_metadata(&metadata)?;
        security::check_compatibility(&metadata, &self.system_version)?;

        // 5) structure, on a probe instance
        let factory = req.descriptor.factory();
        let key = req.descriptor.key.clone();
        let kind = req.kind;
        self.isolation.isolate(name).run("validate", move || {
            let mut probe = factory();
            Ok(security::validate_structure(&key, kind, probe.as_mut()))
        })??;

        // 6) register
        metadata.load_time = Some(Utc::now());
        metadata.file_hash = Some(req.hash);
        let class = Arc::new(PluginClass::new(
            &req.descriptor,
            metadata,
            req.kind,
            req.enabled,
            req.default_config,
            req.source,
        ));
        let mut reg = self.registry.lock();
        reg.plugin_classes.insert(name.to_string(), class.clone());
        reg.records.remove(name);
        Ok(class)
    }

    /// Discovers, orders and loads everything. Returns the names that loaded,
    /// in dependency order. A dependency cycle aborts before anything loads.
    pub fn load_all_plugins(&self) -> Result<Vec<String>, PluginError> {
        let names = self.discover_plugins();
        let declared: Vec<PluginMetadata> = {
            let reg = self.registry.lock();
            names.iter().filter_map(|n| reg.declared_metadata(n)).collect()
        };
        let order = self.resolver.resolve_dependencies(&declared)?;
        self.registry.lock().load_order = order.clone();

        // also enforced by initialize_plugin
        for mismatch in self.resolver.check_versions(&declared) {
            warn!(
                plugin = %mismatch.plugin,
                dependency = %mismatch.dependency,
                required = %mismatch.required,
                found = %mismatch.found,
                "dependency version mismatch"
            );
        }

        let loaded: Vec<String> = order
            .into_iter()
            .filter(|name| self.load_plugin(name).is_some())
            .collect();
        info!(loaded = loaded.len(), discovered = names.len(), "plugins loaded");
        Ok(loaded)
    }

    // ---- initialization & shutdown -------------------------------------------

    /// Instantiates and initializes a loaded plugin. `config` falls back to
    /// the config store, then to the manifest's defaults. Returns `false` on
    /// any failure; the plugin is then reported in `Error` state.
    ///
    /// Concurrent calls for one name run one after the other: a caller that
    /// finds an initialize in flight waits for it and then sees its outcome.
    pub fn initialize_plugin(&self, name: &str, config: Option<Map<String, Value>>) -> bool {
        let (class, _in_flight) = {
            let mut reg = self.lock_settled(name);
            if let Some(live) = reg.plugins.get(name) {
                debug!(plugin = name, state = %live.state.load(), "already initialized");
                return true;
            }
            let class = match reg.plugin_classes.get(name) {
                Some(c) => c.clone(),
                None => {
                    warn!(plugin = name, "cannot initialize a plugin that is not loaded");
                    return false;
                }
            };
            reg.initializing.insert(name.to_string());
            (class, InFlight { manager: self, name })
        };

        let host = Arc::new(self.host.for_instance());
        match self.try_initialize(&class, config, host.clone()) {
            Ok(instance) => {
                let metadata = instance.metadata.clone();
                let enabled = instance.is_enabled;
                let state = instance.state.clone();
                {
                    let mut reg = self.registry.lock();
                    if let Some(set) = reg.kind_set(class.kind) {
                        set.insert(name.to_string());
                    }
                    reg.records.remove(name);
                    reg.plugins.insert(name.to_string(), instance);
                }
                info!(plugin = name, "plugin initialized");
                self.lifecycle.on_plugin_initialize(&metadata);
                if enabled && state.compare_exchange(PluginState::Initialized, PluginState::Active).is_ok() {
                    self.lifecycle.on_plugin_activate(&metadata);
                }
                true
            }
            Err(err) => {
                // a timed-out initialize may still be running with this host
                host.revoke();
                self.resources.release_all(name);
                self.ctx.bus.unsubscribe_by_source(name);
                self.fail(&class.metadata, &err);
                false
            }
        }
    }

    /// Locks the registry once no initialize of `name` is in flight.
    fn lock_settled(&self, name: &str) -> MutexGuard<'_, Registry> {
        let mut reg = self.registry.lock();
        while reg.initializing.contains(name) {
            self.settled.wait(&mut reg);
        }
        reg
    }

    fn try_initialize(
        &self,
        class: &Arc<PluginClass>,
        config: Option<Map<String, Value>>,
        host: Arc<ManagerHost>,
    ) -> Result<PluginInstance, PluginError> {
        let name = class.name.as_str();

        // 1) dependencies must be live and at a compatible version
        self.check_dependencies(class)?;

        // 2) config
        let config = config
            .or_else(|| self.config_store.get(name))
            .unwrap_or_else(|| class.default_config.clone());

        // 3) construct and initialize in isolation
        let call = self.isolation.isolate(name);
        let factory = class.factory();
        let plugin: SharedPlugin = Arc::new(Mutex::new(call.run("create", move || Ok(factory()))?));
        let state = Arc::new(AtomicCell::new(PluginState::Loaded));

        let ctx = PluginContext::new(name, config.clone(), host.clone());
        let target = plugin.clone();
        call.run("initialize", move || target.lock().initialize(ctx))?;
        transition(name, &state, PluginState::Initialized)?;

        let mut metadata = class.metadata.clone();
        metadata.init_time = Some(Utc::now());
        Ok(PluginInstance {
            plugin,
            class: class.clone(),
            metadata,
            config,
            state,
            error: None,
            is_enabled: class.enabled,
            host,
        })
    }

    fn check_dependencies(&self, class: &PluginClass) -> Result<(), PluginError> {
        let reg = self.registry.lock();
        for dep in class.metadata.dependency_names() {
            let dependency_error = |reason: String| PluginError::Dependency {
                plugin: class.name.clone(),
                reason,
            };
            let live = reg
                .plugins
                .get(dep)
                .ok_or_else(|| dependency_error(format!("`{dep}` is not initialized")))?;
            if !live.state.load().is_running() {
                return Err(dependency_error(format!("`{dep}` is {}", live.state.load())));
            }
            if let Some(req) = class.metadata.dependency_requirement(dep) {
                let req = req?;
                let found = live.metadata.parsed_version()?;
                if !req.matches(&found) {
                    return Err(dependency_error(format!("`{dep}` {found} does not satisfy `{req}`")));
                }
            }
        }
        Ok(())
    }

    /// Initializes every loaded plugin in dependency order.
    pub fn initialize_all_plugins(&self) -> BTreeMap<String, bool> {
        let order: Vec<String> = {
            let reg = self.registry.lock();
            let mut order: Vec<String> = reg
                .load_order
                .iter()
                .filter(|n| reg.plugin_classes.contains_key(*n))
                .cloned()
                .collect();
            let mut rest: Vec<String> = reg
                .plugin_classes
                .keys()
                .filter(|n| !order.contains(n))
                .cloned()
                .collect();
            rest.sort();
            order.extend(rest);
            order
        };
        order
            .into_iter()
            .map(|name| {
                let ok = self.initialize_plugin(&name, None);
                (name, ok)
            })
            .collect()
    }

    /// Shuts a live plugin down: its own `shutdown`, then a sweep of its
    /// resources and subscriptions. `false` when it was not live.
    pub fn shutdown_plugin(&self, name: &str) -> bool {
        let instance = {
            let mut reg = self.lock_settled(name);
            let Some(instance) = reg.plugins.remove(name) else {
                return false;
            };
            if let Some(set) = reg.kind_set(instance.class.kind) {
                set.remove(name);
            }
            instance
        };

        // 1) plugin's own cleanup
        let target = instance.plugin.clone();
        if let Err(e) = self.isolation.isolate(name).run("shutdown", move || target.lock().shutdown()) {
            warn!(plugin = name, "shutdown failed, sweeping anyway: {e}");
        }

        // 2) central sweep
        instance.host.revoke();
        let released = self.resources.release_all(name);
        let unsubscribed = self.ctx.bus.unsubscribe_by_source(name);
        debug!(plugin = name, released, unsubscribed, "plugin resources swept");

        instance.state.store(PluginState::Unloaded);
        info!(plugin = name, "plugin shut down");
        self.lifecycle.on_plugin_shutdown(&instance.metadata);
        self.publish(EventType::PluginUnloaded, &instance.metadata, None);
        true
    }

    /// Shuts down every live plugin, dependents before their dependencies.
    pub fn shutdown_all_plugins(&self) -> Vec<String> {
        let order = self.registry.lock().shutdown_order();
        order.into_iter().filter(|n| self.shutdown_plugin(n)).collect()
    }

    /// Shutdown, rediscovery, load and initialize. Any failing step leaves
    /// the plugin unloaded.
    pub fn reload_plugin(&self, name: &str, config: Option<Map<String, Value>>) -> bool {
        info!(plugin = name, "reloading plugin");
        self.shutdown_plugin(name);
        self.registry.lock().plugin_classes.remove(name);
        self.discover_plugins();
        if self.load_plugin(name).is_none() {
            return false;
        }
        self.initialize_plugin(name, config)
    }

    /// Removes a plugin for good: shut down if live, class dropped, status
    /// reported as `Uninstalled`.
    pub fn uninstall_plugin(&self, name: &str) -> bool {
        self.shutdown_plugin(name);
        let mut reg = self.registry.lock();
        let Some(class) = reg.plugin_classes.remove(name) else {
            return false;
        };
        reg.load_order.retain(|n| n != name);
        reg.records.insert(
            name.to_string(),
            PluginRecord {
                metadata: class.metadata.clone(),
                state: PluginState::Uninstalled,
                error: None,
            },
        );
        info!(plugin = name, "plugin uninstalled");
        true
    }

    // ---- enable / disable ----------------------------------------------------

    /// `Disabled` (or initialized but not yet active) → `Active`. Returns
    /// whether the plugin is active afterwards.
    pub fn enable_plugin(&self, name: &str) -> bool {
        let (metadata, changed) = {
            let mut reg = self.registry.lock();
            let Some(instance) = reg.plugins.get_mut(name) else {
                return false;
            };
            if instance.error.is_some() {
                return false;
            }
            instance.is_enabled = true;
            let current = instance.state.load();
            let changed = match current {
                PluginState::Active => false,
                PluginState::Disabled | PluginState::Initialized => {
                    instance.state.store(PluginState::Active);
                    true
                }
                _ => return false,
            };
            (instance.metadata.clone(), changed)
        };
        if changed {
            self.lifecycle.on_plugin_activate(&metadata);
        }
        true
    }

    /// `Active`/`Initialized` → `Disabled`.
    pub fn disable_plugin(&self, name: &str) -> bool {
        let (metadata, changed) = {
            let mut reg = self.registry.lock();
            let Some(instance) = reg.plugins.get_mut(name) else {
                return false;
            };
            instance.is_enabled = false;
            let changed = match instance.state.load() {
                PluginState::Disabled => false,
                s @ (PluginState::Active | PluginState::Initialized) if s.can_transition_to(PluginState::Disabled) => {
                    instance.state.store(PluginState::Disabled);
                    true
                }
                _ => return false,
            };
            (instance.metadata.clone(), changed)
        };
        if changed {
            self.lifecycle.on_plugin_deactivate(&metadata);
        }
        true
    }

    // ---- accessors -----------------------------------------------------------

    fn info(&self, instance: &PluginInstance) -> PluginInfo {
        PluginInfo {
            name: instance.class.name.clone(),
            version: instance.metadata.version.clone(),
            kind: instance.class.kind,
            state: instance.state.load(),
            is_enabled: instance.is_enabled,
            error: instance.error.clone(),
            resources: self.resources.count(&instance.class.name),
            metadata: instance.metadata.clone(),
        }
    }

    pub fn get_plugin(&self, name: &str) -> Option<PluginInfo> {
        let reg = self.registry.lock();
        reg.plugins.get(name).map(|i| self.info(i))
    }

    /// Every live plugin, by name.
    pub fn get_all_plugins(&self) -> Vec<PluginInfo> {
        let reg = self.registry.lock();
        let mut all: Vec<PluginInfo> = reg.plugins.values().map(|i| self.info(i)).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn get_plugin_class(&self, name: &str) -> Option<Arc<PluginClass>> {
        self.registry.lock().plugin_classes.get(name).cloned()
    }

    /// State of a live plugin, a failed or uninstalled one, or `Loaded` for a
    /// registered class without an instance.
    pub fn plugin_status(&self, name: &str) -> Option<PluginState> {
        let reg = self.registry.lock();
        if let Some(i) = reg.plugins.get(name) {
            return Some(i.state.load());
        }
        if let Some(r) = reg.records.get(name) {
            return Some(r.state);
        }
        reg.plugin_classes.get(name).map(|_| PluginState::Loaded)
    }

    /// Last error recorded for `name`, live or not.
    pub fn plugin_error(&self, name: &str) -> Option<String> {
        let reg = self.registry.lock();
        reg.plugins
            .get(name)
            .and_then(|i| i.error.clone())
            .or_else(|| reg.records.get(name).and_then(|r| r.error.clone()))
    }

    /// Plugin last discovered from the manifest at `path`.
    pub fn plugin_for_manifest(&self, path: &Path) -> Option<String> {
        let reg = self.registry.lock();
        reg.manifests
            .iter()
            .find(|(_, m)| m.path == path)
            .map(|(name, _)| name.clone())
    }

    pub fn plugin_config(&self, name: &str) -> Option<Map<String, Value>> {
        self.registry.lock().plugins.get(name).map(|i| i.config.clone())
    }

    pub fn get_connectors(&self) -> Vec<String> {
        self.registry.lock().connectors.iter().cloned().collect()
    }

    pub fn get_processors(&self) -> Vec<String> {
        self.registry.lock().processors.iter().cloned().collect()
    }

    pub fn get_analyzers(&self) -> Vec<String> {
        self.registry.lock().analyzers.iter().cloned().collect()
    }

    // ---- invocation ----------------------------------------------------------

    /// Runs `f` against an active plugin under isolation.
    pub fn with_plugin<F, T>(&self, name: &str, operation: &str, f: F) -> Result<T, PluginError>
    where
        F: FnOnce(&mut dyn Plugin) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (plugin, state) = {
            let reg = self.registry.lock();
            let instance = reg.plugins.get(name).ok_or_else(|| PluginError::Load {
                plugin: name.to_string(),
                reason: "not initialized".into(),
            })?;
            (instance.plugin.clone(), instance.state.load())
        };
        if state != PluginState::Active {
            return Err(PluginError::Permission {
                plugin: name.to_string(),
                permission: format!("{operation} while {state}"),
            });
        }
        let result = self.isolation.isolate(name).run(operation, move || {
            let mut guard = plugin.lock();
            f(guard.as_mut())
        });
        if let Err(e) = &result {
            error!(plugin = name, operation, "plugin call failed: {e}");
        }
        result
    }

    /// One collection run: connect, fetch, disconnect.
    pub fn call_connector_fetch(&self, name: &str, query: Value) -> Result<Value, PluginError> {
        self.with_plugin(name, "fetch_data", move |p| {
            let connector = p
                .as_connector()
                .ok_or_else(|| anyhow::anyhow!("not a connector"))?;
            connector.connect()?;
            let fetched = connector.fetch_data(&query);
            let disconnected = connector.disconnect();
            let data = fetched?;
            disconnected?;
            Ok(data)
        })
    }

    pub fn call_processor(&self, name: &str, data: Value, options: Map<String, Value>) -> Result<Value, PluginError> {
        self.with_plugin(name, "process", move |p| {
            p.as_processor()
                .ok_or_else(|| anyhow::anyhow!("not a processor"))?
                .process(data, &options)
        })
    }

    pub fn call_analyzer(&self, name: &str, data: Value, options: Map<String, Value>) -> Result<Value, PluginError> {
        self.with_plugin(name, "analyze", move |p| {
            p.as_analyzer()
                .ok_or_else(|| anyhow::anyhow!("not an analyzer"))?
                .analyze(data, &options)
        })
    }

    // ---- configuration -------------------------------------------------------

    /// Re-reads the plugin config file. Live instances keep their config
    /// until they are reloaded.
    pub fn reload_config(&self) -> anyhow::Result<()> {
        self.config_store.reload()?;
        self.ctx.bus.publish_sync(
            Event::from_json(EventType::ConfigChanged, json!({ "plugins": self.config_store.plugins() }))
                .with_source("plugin_manager"),
        )?;
        Ok(())
    }

    pub fn save_plugin_config(&self, name: &str, config: Map<String, Value>) -> anyhow::Result<()> {
        self.config_store.set(name, config)?;
        self.ctx.bus.publish_sync(
            Event::from_json(EventType::ConfigChanged, json!({ "plugin_name": name }))
                .with_source("plugin_manager"),
        )?;
        Ok(())
    }

    // ---- helpers -------------------------------------------------------------

    fn fail(&self, metadata: &PluginMetadata, err: &PluginError) {
        let name = metadata.name.as_str();
        metrics().plugins_failed.add(
            1,
            &[
                KeyValue::new("plugin", name.to_string()),
                KeyValue::new("kind", err.kind().to_string()),
            ],
        );
        error!(plugin = name, kind = %err.kind(), "{err}");
        self.registry.lock().records.insert(
            name.to_string(),
            PluginRecord {
                metadata: metadata.clone(),
                state: PluginState::Error,
                error: Some(err.to_string()),
            },
        );
        self.lifecycle.on_plugin_error(metadata, err);
        self.publish(EventType::PluginFailed, metadata, Some(err));
    }

    fn publish(&self, event_type: EventType, metadata: &PluginMetadata, err: Option<&PluginError>) {
        let mut data = Map::new();
        data.insert("plugin_name".into(), json!(metadata.name));
        data.insert("plugin_version".into(), json!(metadata.version));
        if let Some(err) = err {
            data.insert("error".into(), json!(err.to_string()));
            data.insert("error_type".into(), json!(err.type_name()));
        }
        let event = Event::new(event_type, data).with_source("plugin_manager");
        if let Err(e) = self.ctx.bus.publish_sync(event) {
            warn!(plugin = %metadata.name, "{event_type} delivery: {e}");
        }
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.registry.lock();
        f.debug_struct("PluginManager")
            .field("catalog", &reg.catalog.len())
            .field("classes", &reg.plugin_classes.len())
            .field("live", &reg.plugins.len())
            .field("plugin_dir", &self.loader.dir())
            .finish()
    }
}

fn transition(name: &str, state: &AtomicCell<PluginState>, target: PluginState) -> Result<(), PluginError> {
    let current = state.load();
    if !current.can_transition_to(target) {
        return Err(PluginError::Validation {
            plugin: name.to_string(),
            reason: format!("invalid state transition {current} -> {target}"),
        });
    }
    state.store(target);
    Ok(())
}
