//! Manifest discovery in the plugin directory.
//!
//! A manifest is either `<dir>/<anything>.json` or `<dir>/<sub>/plugin.json`.
//! It names a compiled-in factory and declares what the plugin uses, so the
//! security checks can run before anything is instantiated.
use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use wiseflow_plugin::{PluginKind, PluginMetadata};

use crate::util::sha256_hex;

pub const MANIFEST_FILE: &str = "plugin.json";

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginManifest {
    #[serde(flatten)]
    pub metadata: PluginMetadata,
    #[serde(default)]
    pub kind: PluginKind,
    /// Catalog key of the constructor; the plugin name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<String>,
    /// Module paths the plugin code uses.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Attributes the plugin exposes.
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Used when the plugin config file has no entry for this plugin.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl PluginManifest {
    pub fn factory_key(&self) -> &str {
        self.factory.as_deref().unwrap_or(&self.metadata.name)
    }
}

/// A parsed manifest with where it came from and its content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredManifest {
    pub manifest: PluginManifest,
    pub path: PathBuf,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct PluginLoader {
    dir: PathBuf,
}

impl PluginLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether `path` is a manifest location under this loader's directory.
    pub fn is_manifest_path(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.dir) else {
            return false;
        };
        let parts: Vec<_> = rel.components().collect();
        match parts.len() {
            1 => path.extension().and_then(|e| e.to_str()) == Some("json"),
            2 => path.file_name().and_then(|f| f.to_str()) == Some(MANIFEST_FILE),
            _ => false,
        }
    }

    fn manifest_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| format!("reading {}", self.dir.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                let nested = path.join(MANIFEST_FILE);
                if nested.is_file() {
                    paths.push(nested);
                }
            } else if self.is_manifest_path(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn read(&self, path: &Path) -> Result<DiscoveredManifest> {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let manifest: PluginManifest =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(DiscoveredManifest {
            manifest,
            path: path.to_path_buf(),
            hash: sha256_hex(&bytes),
        })
    }

    /// Every readable manifest, in path order. Unreadable ones are logged
    /// and skipped; a missing directory yields nothing.
    pub fn scan(&self) -> Vec<DiscoveredManifest> {
        if !self.dir.is_dir() {
            debug!("plugin directory {} does not exist", self.dir.display());
            return Vec::new();
        }
        let paths = match self.manifest_paths() {
            Ok(p) => p,
            Err(e) => {
                warn!("could not scan {}: {e:#}", self.dir.display());
                return Vec::new();
            }
        };
        paths
            .into_iter()
            .filter_map(|p| match self.read(&p) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("skipping manifest: {e:#}");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn scan_finds_flat_and_nested_manifests() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("rss.json"),
            json!({"name": "rss", "version": "0.1.0", "kind": "connector", "factory": "file_connector"}).to_string(),
        )
        .unwrap();
        fs::create_dir(dir.path().join("cleaner")).unwrap();
        fs::write(
            dir.path().join("cleaner/plugin.json"),
            json!({"name": "text_cleaner", "version": "1.0.0", "kind": "processor", "enabled": false}).to_string(),
        )
        .unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loader = PluginLoader::new(dir.path());
        let found = loader.scan();
        assert_eq!(found.len(), 2);

        let cleaner = found.iter().find(|m| m.manifest.metadata.name == "text_cleaner").unwrap();
        assert!(!cleaner.manifest.enabled);
        assert_eq!(cleaner.manifest.factory_key(), "text_cleaner");
        assert_eq!(cleaner.hash.len(), 64);

        let rss = found.iter().find(|m| m.manifest.metadata.name == "rss").unwrap();
        assert_eq!(rss.manifest.kind, PluginKind::Connector);
        assert_eq!(rss.manifest.factory_key(), "file_connector");
        assert!(rss.manifest.enabled);
    }

    #[test]
    fn manifest_paths() {
        let loader = PluginLoader::new("/srv/plugins");
        assert!(loader.is_manifest_path(Path::new("/srv/plugins/a.json")));
        assert!(loader.is_manifest_path(Path::new("/srv/plugins/a/plugin.json")));
        assert!(!loader.is_manifest_path(Path::new("/srv/plugins/a/other.json")));
        assert!(!loader.is_manifest_path(Path::new("/srv/plugins/a/b/plugin.json")));
        assert!(!loader.is_manifest_path(Path::new("/elsewhere/a.json")));
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        assert!(PluginLoader::new(dir.path().join("nope")).scan().is_empty());
    }

    #[test]
    fn hash_follows_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.json");
        fs::write(&path, r#"{"name": "p", "version": "1.0.0"}"#).unwrap();
        let loader = PluginLoader::new(dir.path());
        let first = loader.read(&path).unwrap();
        fs::write(&path, r#"{"name": "p", "version": "1.0.1"}"#).unwrap();
        let second = loader.read(&path).unwrap();
        assert_ne!(first.hash, second.hash);
    }
}
