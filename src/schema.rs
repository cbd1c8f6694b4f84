use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use schemars::schema_for;
use tracing::info;

use crate::{config::WiseflowConfig, loader::PluginManifest};

pub const MANIFEST_SCHEMA_FILE: &str = "plugin-manifest.schema.json";
pub const CONFIG_SCHEMA_FILE: &str = "wiseflow-config.schema.json";

/// Writes the JSON schemas of the plugin manifest and of the process
/// configuration into `out_dir`. Returns the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let manifest = out_dir.join(MANIFEST_SCHEMA_FILE);
    fs::write(&manifest, serde_json::to_string_pretty(&schema_for!(PluginManifest))?)
        .with_context(|| format!("writing {}", manifest.display()))?;

    let config = out_dir.join(CONFIG_SCHEMA_FILE);
    fs::write(&config, serde_json::to_string_pretty(&schema_for!(WiseflowConfig))?)
        .with_context(|| format!("writing {}", config.display()))?;

    info!("schemas written to {}", out_dir.display());
    Ok(vec![manifest, config])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn writes_both_schemas() {
        let dir = tempdir().unwrap();
        let written = write_schema(&dir.path().join("schemas")).unwrap();
        assert_eq!(written.len(), 2);

        let manifest: Value = serde_json::from_str(&fs::read_to_string(&written[0]).unwrap()).unwrap();
        let props = manifest["properties"].as_object().unwrap();
        for key in ["name", "version", "kind", "factory", "imports"] {
            assert!(props.contains_key(key), "missing {key}");
        }

        let config: Value = serde_json::from_str(&fs::read_to_string(&written[1]).unwrap()).unwrap();
        assert!(config["properties"]["plugin_dir"].is_object());
    }
}
