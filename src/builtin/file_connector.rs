use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, anyhow, bail};
use serde_json::{Map, Value, json};
use tracing::debug;
use wiseflow_plugin::{
    Connector, EventType, FnResource, Plugin, PluginContext, PluginKind, PluginMetadata, ResourceId,
};

const DEFAULT_EXTENSIONS: &[&str] = &["txt", "md"];

/// Reads text documents from a directory.
///
/// Config: `directory` (default `.`), `extensions` (default `["txt", "md"]`),
/// `max_bytes` per file (default 1 MiB).
#[derive(Debug, Default)]
pub struct FileConnector {
    ctx: Option<PluginContext>,
    directory: PathBuf,
    extensions: Vec<String>,
    max_bytes: u64,
    connection: Option<ResourceId>,
}

impl FileConnector {
    fn resolve(&self, rel: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(rel);
        if rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            bail!("path `{}` escapes the connector directory", rel.display());
        }
        Ok(self.directory.join(rel))
    }

    fn wanted(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x == e))
    }

    fn read_document(&self, path: &Path) -> anyhow::Result<Value> {
        let len = fs::metadata(path)?.len();
        if len > self.max_bytes {
            bail!("{} is {len} bytes, over the {} byte limit", path.display(), self.max_bytes);
        }
        let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let rel = path.strip_prefix(&self.directory).unwrap_or(path);
        Ok(json!({ "path": rel.to_string_lossy(), "content": content }))
    }
}

impl Plugin for FileConnector {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("file_connector", "1.0.0")
            .with_description("Collects text documents from a local directory")
            .with_author("wiseflow developers")
            .with_license("MIT")
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Connector
    }

    fn initialize(&mut self, ctx: PluginContext) -> anyhow::Result<()> {
        self.directory = ctx
            .config_value("directory")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        self.extensions = match ctx.config_value("extensions").and_then(Value::as_array) {
            Some(list) => list.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            None => DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        };
        self.max_bytes = ctx
            .config_value("max_bytes")
            .and_then(Value::as_u64)
            .unwrap_or(1024 * 1024);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn shutdown(&mut self) -> anyhow::Result<()> {
        self.disconnect()
    }

    fn as_connector(&mut self) -> Option<&mut dyn Connector> {
        Some(self)
    }
}

impl Connector for FileConnector {
    fn connect(&mut self) -> anyhow::Result<()> {
        let ctx = self.ctx.as_ref().ok_or_else(|| anyhow!("not initialized"))?;
        if self.connection.is_some() {
            return Ok(());
        }
        if !self.directory.is_dir() {
            bail!("{} is not a directory", self.directory.display());
        }
        let dir = self.directory.display().to_string();
        let id = ctx.register_resource(
            "directory",
            Box::new(FnResource::new(move || {
                debug!("closing directory {dir}");
                Ok(())
            })),
        );
        self.connection = Some(id);

        let mut data = Map::new();
        data.insert("directory".into(), json!(self.directory.display().to_string()));
        ctx.publish(EventType::ConnectorStarted, data)?;
        Ok(())
    }

    /// `{"path": "a.txt"}` reads one file, `{}` reads every matching file.
    fn fetch_data(&mut self, query: &Value) -> anyhow::Result<Value> {
        let ctx = self.ctx.as_ref().ok_or_else(|| anyhow!("not initialized"))?;
        if self.connection.is_none() {
            bail!("not connected");
        }

        let documents = match query.get("path").and_then(Value::as_str) {
            Some(rel) => vec![self.read_document(&self.resolve(rel)?)?],
            None => {
                let mut paths: Vec<PathBuf> = fs::read_dir(&self.directory)?
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && self.wanted(p))
                    .collect();
                paths.sort();
                let limit = query.get("limit").and_then(Value::as_u64).map_or(usize::MAX, |l| l as usize);
                paths
                    .iter()
                    .take(limit)
                    .map(|p| self.read_document(p))
                    .collect::<anyhow::Result<Vec<_>>>()?
            }
        };

        let mut data = Map::new();
        data.insert("documents".into(), json!(documents.len()));
        ctx.publish(EventType::DataCollected, data)?;
        Ok(json!({ "documents": documents }))
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        let Some(id) = self.connection.take() else {
            return Ok(());
        };
        if let Some(ctx) = &self.ctx {
            ctx.release_resource(id)?;
            ctx.publish(EventType::ConnectorCompleted, Map::new())?;
        }
        Ok(())
    }
}
