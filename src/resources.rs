use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};
use wiseflow_plugin::{PluginError, Resource, ResourceId};

// `Resource` is only `Send`; the mutex makes the map shareable.
struct Tracked {
    id: ResourceId,
    kind: String,
    resource: Mutex<Box<dyn Resource>>,
}

/// Central record of what every plugin holds, so a shutdown can sweep
/// whatever the plugin itself failed to release.
pub struct ResourceManager {
    by_plugin: DashMap<String, Vec<Tracked>>,
    next_id: AtomicU64,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            by_plugin: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, plugin: &str, kind: &str, resource: Box<dyn Resource>) -> ResourceId {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.by_plugin.entry(plugin.to_string()).or_default().push(Tracked {
            id,
            kind: kind.to_string(),
            resource: Mutex::new(resource),
        });
        debug!(plugin, kind, resource = %id, "resource registered");
        id
    }

    /// Releases and untracks one resource. A resource is untracked before
    /// its release runs, so it is never released twice.
    pub fn release(&self, plugin: &str, id: ResourceId) -> Result<(), PluginError> {
        let tracked = {
            let Some(mut list) = self.by_plugin.get_mut(plugin) else {
                return Err(unknown(plugin, id));
            };
            let Some(pos) = list.iter().position(|t| t.id == id) else {
                return Err(unknown(plugin, id));
            };
            list.remove(pos)
        };
        release_one(plugin, tracked)
    }

    /// Releases everything `plugin` still holds, newest first. Failures are
    /// logged; the return value counts successful releases.
    pub fn release_all(&self, plugin: &str) -> usize {
        let Some((_, list)) = self.by_plugin.remove(plugin) else {
            return 0;
        };
        let total = list.len();
        let released = list
            .into_iter()
            .rev()
            .map(|t| release_one(plugin, t))
            .filter(Result::is_ok)
            .count();
        if released < total {
            warn!(plugin, released, total, "some resources failed to release");
        }
        released
    }

    /// `(id, kind)` of every resource `plugin` still holds, in registration order.
    pub fn resources_of(&self, plugin: &str) -> Vec<(ResourceId, String)> {
        self.by_plugin
            .get(plugin)
            .map(|l| l.iter().map(|t| (t.id, t.kind.clone())).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, plugin: &str) -> usize {
        self.by_plugin.get(plugin).map_or(0, |l| l.len())
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("plugins", &self.by_plugin.len())
            .finish()
    }
}

fn unknown(plugin: &str, id: ResourceId) -> PluginError {
    PluginError::Resource {
        plugin: plugin.to_string(),
        reason: format!("{id} is not tracked"),
    }
}

fn release_one(plugin: &str, mut tracked: Tracked) -> Result<(), PluginError> {
    tracked.resource.get_mut().release().map_err(|e| {
        warn!(plugin, resource = %tracked.id, kind = %tracked.kind, "release failed: {e:#}");
        PluginError::Resource {
            plugin: plugin.to_string(),
            reason: format!("releasing {} ({}): {e:#}", tracked.id, tracked.kind),
        }
    })
}
