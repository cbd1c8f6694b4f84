use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{event_bus::EventBusConfig, isolation::PluginIsolationManager, security::SecurityPolicy};

/// Per-plugin configuration maps, keyed by plugin name.
#[typetag::serde]
pub trait PluginConfigStoreType: Send + Sync {
    fn get(&self, plugin: &str) -> Option<Map<String, Value>>;
    fn set(&self, plugin: &str, config: Map<String, Value>) -> Result<()>;
    fn plugins(&self) -> Vec<String>;
    /// Re-reads the backing storage, if there is one.
    fn reload(&self) -> Result<()>;
    fn clone_box(&self) -> Box<dyn PluginConfigStoreType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct PluginConfigStore(pub Box<dyn PluginConfigStoreType>);

impl PluginConfigStore {
    /// Store backed by a JSON file; a missing file is an empty store.
    pub fn json_file(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self(JsonFileConfigStore::open(path)?))
    }

    pub fn in_memory() -> Self {
        Self(MapConfigStore::new())
    }
}

impl std::ops::Deref for PluginConfigStore {
    type Target = dyn PluginConfigStoreType;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Clone for PluginConfigStore {
    fn clone(&self) -> Self {
        PluginConfigStore(self.0.clone_box())
    }
}

impl std::fmt::Debug for PluginConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// The plugin config file: one JSON object, plugin name → config map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    #[serde(skip)]
    cache: Arc<DashMap<String, Map<String, Value>>>,
}

impl JsonFileConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Box<Self>> {
        let store = Self {
            path: path.into(),
            cache: Arc::new(DashMap::new()),
        };
        store.reload()?;
        Ok(Box::new(store))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<BTreeMap<String, Map<String, Value>>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }

    fn write_file(&self) -> Result<()> {
        let all: BTreeMap<String, Map<String, Value>> = self
            .cache
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&all)?)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

#[typetag::serde]
impl PluginConfigStoreType for JsonFileConfigStore {
    fn get(&self, plugin: &str) -> Option<Map<String, Value>> {
        self.cache.get(plugin).map(|c| c.clone())
    }

    fn set(&self, plugin: &str, config: Map<String, Value>) -> Result<()> {
        self.cache.insert(plugin.to_string(), config);
        self.write_file()
    }

    fn plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn reload(&self) -> Result<()> {
        let fresh = self.read_file()?;
        self.cache.clear();
        for (k, v) in fresh {
            self.cache.insert(k, v);
        }
        info!("loaded plugin config for {} plugin(s) from {}", self.cache.len(), self.path.display());
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn PluginConfigStoreType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("JsonFileConfigStore({})", self.path.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigStore {
    #[schemars(with = "std::collections::HashMap<String, Map<String, Value>>")]
    map: DashMap<String, Map<String, Value>>,
}

impl MapConfigStore {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
impl PluginConfigStoreType for MapConfigStore {
    fn get(&self, plugin: &str) -> Option<Map<String, Value>> {
        self.map.get(plugin).map(|c| c.clone())
    }

    fn set(&self, plugin: &str, config: Map<String, Value>) -> Result<()> {
        self.map.insert(plugin.to_string(), config);
        Ok(())
    }

    fn plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn reload(&self) -> Result<()> {
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn PluginConfigStoreType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigStore({} entries)", self.map.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EventBusSettings {
    pub max_history: usize,
    pub callback_timeout_ms: u64,
    pub max_consecutive_failures: u32,
    pub propagate_errors: bool,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        let d = EventBusConfig::default();
        Self {
            max_history: d.max_history,
            callback_timeout_ms: d.callback_timeout.as_millis() as u64,
            max_consecutive_failures: d.max_consecutive_failures,
            propagate_errors: d.propagate_errors,
        }
    }
}

impl EventBusSettings {
    pub fn to_bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            max_history: self.max_history,
            callback_timeout: Duration::from_millis(self.callback_timeout_ms),
            max_consecutive_failures: self.max_consecutive_failures,
            propagate_errors: self.propagate_errors,
        }
    }
}

/// Process configuration. Defaults, then `WISEFLOW_*` environment variables
/// (a `.env` file is honoured).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WiseflowConfig {
    /// Directory scanned for plugin manifests.
    pub plugin_dir: PathBuf,
    /// JSON file with per-plugin configuration.
    pub plugin_config_file: PathBuf,
    /// Version plugins check their `min/max_system_version` against.
    pub system_version: String,
    pub isolation_enabled: bool,
    pub plugin_timeout_secs: u64,
    /// Per-plugin override of `plugin_timeout_secs`, in milliseconds.
    pub plugin_timeouts_ms: BTreeMap<String, u64>,
    pub event_bus: EventBusSettings,
    pub security: SecurityPolicy,
    /// Watch `plugin_dir` and reload plugins whose manifest changes.
    pub hot_reload: bool,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub otel_endpoint: Option<String>,
}

impl Default for WiseflowConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            plugin_config_file: PathBuf::from("config/plugins.json"),
            system_version: env!("CARGO_PKG_VERSION").to_string(),
            isolation_enabled: true,
            plugin_timeout_secs: 30,
            plugin_timeouts_ms: BTreeMap::new(),
            event_bus: EventBusSettings::default(),
            security: SecurityPolicy::default(),
            hot_reload: false,
            log_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
            otel_endpoint: None,
        }
    }
}

impl WiseflowConfig {
    /// Defaults overridden by the process environment, after loading `.env`
    /// from the working directory if there is one.
    pub fn from_env() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded .env from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => warn!("could not load .env: {e}"),
        }
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Applies overrides from `lookup`. Unparseable values are logged and skipped.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("ignoring {key}={raw}: not a valid value");
                    None
                }
            }
        }

        if let Some(v) = lookup("WISEFLOW_PLUGIN_DIR") {
            self.plugin_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WISEFLOW_PLUGIN_CONFIG") {
            self.plugin_config_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("WISEFLOW_SYSTEM_VERSION") {
            self.system_version = v;
        }
        if let Some(v) = parsed("WISEFLOW_ISOLATION", lookup("WISEFLOW_ISOLATION")) {
            self.isolation_enabled = v;
        }
        if let Some(v) = parsed("WISEFLOW_PLUGIN_TIMEOUT_SECS", lookup("WISEFLOW_PLUGIN_TIMEOUT_SECS")) {
            self.plugin_timeout_secs = v;
        }
        if let Some(v) = parsed("WISEFLOW_EVENT_HISTORY", lookup("WISEFLOW_EVENT_HISTORY")) {
            self.event_bus.max_history = v;
        }
        if let Some(v) = parsed("WISEFLOW_CALLBACK_TIMEOUT_MS", lookup("WISEFLOW_CALLBACK_TIMEOUT_MS")) {
            self.event_bus.callback_timeout_ms = v;
        }
        if let Some(v) = parsed("WISEFLOW_PROPAGATE_ERRORS", lookup("WISEFLOW_PROPAGATE_ERRORS")) {
            self.event_bus.propagate_errors = v;
        }
        if let Some(v) = parsed("WISEFLOW_HOT_RELOAD", lookup("WISEFLOW_HOT_RELOAD")) {
            self.hot_reload = v;
        }
        if let Some(v) = lookup("WISEFLOW_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WISEFLOW_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            self.otel_endpoint = Some(v);
        }
    }

    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }

    pub fn isolation_manager(&self) -> PluginIsolationManager {
        let iso = PluginIsolationManager::new(self.isolation_enabled, self.plugin_timeout());
        for (plugin, ms) in &self.plugin_timeouts_ms {
            iso.set_plugin_timeout(plugin, Duration::from_millis(*ms));
        }
        iso
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn cfg(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn map_store_roundtrip_through_wrapper() {
        let store = PluginConfigStore::in_memory();
        store.set("rss", cfg(json!({"interval": 60}))).unwrap();
        let copy = store.clone();
        assert_eq!(copy.get("rss").unwrap()["interval"], json!(60));
        assert_eq!(store.plugins(), vec!["rss".to_string()]);
        assert!(format!("{store:?}").contains("1 entries"));
    }

    #[test]
    fn json_file_store_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let store = PluginConfigStore::json_file(&path).unwrap();
        assert!(store.plugins().is_empty());
        store.set("text_cleaner", cfg(json!({"lowercase": true}))).unwrap();
        assert!(path.exists());

        let other = PluginConfigStore::json_file(&path).unwrap();
        assert_eq!(other.get("text_cleaner").unwrap()["lowercase"], json!(true));

        fs::write(&path, r#"{"keyword_analyzer": {"top_n": 3}}"#).unwrap();
        other.reload().unwrap();
        assert!(other.get("text_cleaner").is_none());
        assert_eq!(other.get("keyword_analyzer").unwrap()["top_n"], json!(3));
    }

    #[test]
    fn broken_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(PluginConfigStore::json_file(&path).is_err());
    }

    #[test]
    fn store_serializes_with_its_type_tag() {
        let store = PluginConfigStore::in_memory();
        store.set("a", Map::new()).unwrap();
        let raw = serde_json::to_string(&store).unwrap();
        assert!(raw.contains("MapConfigStore"));
        let back: PluginConfigStore = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.plugins(), vec!["a".to_string()]);
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("WISEFLOW_PLUGIN_DIR", "/opt/wf/plugins"),
            ("WISEFLOW_ISOLATION", "false"),
            ("WISEFLOW_PLUGIN_TIMEOUT_SECS", "not-a-number"),
            ("WISEFLOW_EVENT_HISTORY", "50"),
            ("WISEFLOW_HOT_RELOAD", "true"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", ""),
        ]);
        let mut config = WiseflowConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.plugin_dir, PathBuf::from("/opt/wf/plugins"));
        assert!(!config.isolation_enabled);
        assert_eq!(config.plugin_timeout_secs, 30);
        assert_eq!(config.event_bus.max_history, 50);
        assert!(config.hot_reload);
        assert!(config.otel_endpoint.is_none());
    }

    #[test]
    fn isolation_manager_from_config() {
        let mut config = WiseflowConfig::default();
        config.plugin_timeouts_ms.insert("slow".into(), 250);
        let iso = config.isolation_manager();
        assert_eq!(iso.timeout_for("slow"), Duration::from_millis(250));
        assert_eq!(iso.timeout_for("other"), Duration::from_secs(30));
    }
}
