use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::Arc,
};

use serde_json::{Map, Value};
use tracing::{debug, warn};
use wiseflow_plugin::{Plugin, PluginError, PluginKind, PluginMetadata};

use crate::{builtin, util::panic_message};

pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// A compiled-in plugin constructor with what it reports about itself.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub key: String,
    pub metadata: PluginMetadata,
    pub kind: PluginKind,
    factory: PluginFactory,
}

impl PluginDescriptor {
    pub fn factory(&self) -> PluginFactory {
        self.factory.clone()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("key", &self.key)
            .field("version", &self.metadata.version)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Name → constructor table. Keeps registration order, which is also the
/// discovery order.
#[derive(Clone, Default, Debug)]
pub struct PluginCatalog {
    entries: Vec<PluginDescriptor>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The plugins shipped with wiseflow.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for factory in builtin::factories() {
            // builtin constructors do not fail
            let _ = catalog.register_factory(factory);
        }
        catalog
    }

    /// Registers a constructor under the name its instances report.
    pub fn register<F>(&mut self, factory: F) -> Result<String, PluginError>
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.register_factory(Arc::new(factory))
    }

    pub fn register_factory(&mut self, factory: PluginFactory) -> Result<String, PluginError> {
        let (metadata, kind) = catch_unwind(AssertUnwindSafe(|| {
            let probe = factory();
            (probe.metadata(), probe.kind())
        }))
        .map_err(|p| PluginError::Load {
            plugin: "<unnamed>".into(),
            reason: format!("constructor panicked: {}", panic_message(p.as_ref())),
        })?;
        let key = metadata.name.clone();
        self.insert(PluginDescriptor {
            key: key.clone(),
            metadata,
            kind,
            factory,
        });
        Ok(key)
    }

    /// Adds `descriptor`, replacing (and returning) an entry with the same
    /// key. The replaced entry keeps its position.
    fn insert(&mut self, descriptor: PluginDescriptor) -> Option<PluginDescriptor> {
        debug!(plugin = %descriptor.key, kind = %descriptor.kind, "catalog entry registered");
        match self.entries.iter_mut().find(|d| d.key == descriptor.key) {
            Some(existing) => {
                warn!(
                    plugin = %descriptor.key,
                    old_version = %existing.metadata.version,
                    new_version = %descriptor.metadata.version,
                    "catalog entry replaced by a second registration"
                );
                Some(std::mem::replace(existing, descriptor))
            }
            None => {
                self.entries.push(descriptor);
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&PluginDescriptor> {
        self.entries.iter().find(|d| d.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|d| d.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PluginSource {
    Catalog,
    Manifest(PathBuf),
}

/// A plugin that passed every load check and can be instantiated.
#[derive(Clone)]
pub struct PluginClass {
    pub name: String,
    /// Catalog key the instances come from.
    pub factory_key: String,
    pub metadata: PluginMetadata,
    pub kind: PluginKind,
    pub enabled: bool,
    pub default_config: Map<String, Value>,
    pub source: PluginSource,
    factory: PluginFactory,
}

impl PluginClass {
    pub(crate) fn new(
        descriptor: &PluginDescriptor,
        metadata: PluginMetadata,
        kind: PluginKind,
        enabled: bool,
        default_config: Map<String, Value>,
        source: PluginSource,
    ) -> Self {
        Self {
            name: metadata.name.clone(),
            factory_key: descriptor.key.clone(),
            metadata,
            kind,
            enabled,
            default_config,
            source,
            factory: descriptor.factory(),
        }
    }

    pub fn instantiate(&self) -> Box<dyn Plugin> {
        (self.factory)()
    }

    pub fn factory(&self) -> PluginFactory {
        self.factory.clone()
    }
}

impl fmt::Debug for PluginClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginClass")
            .field("name", &self.name)
            .field("factory_key", &self.factory_key)
            .field("version", &self.metadata.version)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiseflow_plugin::PluginContext;

    struct Named(&'static str);

    impl Plugin for Named {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new(self.0, "0.1.0")
        }

        fn initialize(&mut self, _ctx: PluginContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Versioned(&'static str);

    impl Plugin for Versioned {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("clash", self.0)
        }

        fn initialize(&mut self, _ctx: PluginContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registration_keeps_order_and_replaces() {
        let mut catalog = PluginCatalog::new();
        catalog.register(|| Box::new(Named("b"))).unwrap();
        catalog.register(|| Box::new(Named("a"))).unwrap();
        catalog.register(|| Box::new(Named("b"))).unwrap();
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(catalog.get("a").unwrap().kind, PluginKind::Generic);
    }

    #[test]
    fn second_registration_replaces_and_hands_back_the_first() {
        let mut catalog = PluginCatalog::new();
        catalog.register(|| Box::new(Versioned("1.0.0"))).unwrap();
        let descriptor = |v: &'static str| {
            let factory: PluginFactory = Arc::new(move || -> Box<dyn Plugin> { Box::new(Versioned(v)) });
            PluginDescriptor {
                key: "clash".into(),
                metadata: factory().metadata(),
                kind: PluginKind::Generic,
                factory,
            }
        };

        let replaced = catalog.insert(descriptor("2.0.0")).unwrap();
        assert_eq!(replaced.metadata.version, "1.0.0");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("clash").unwrap().metadata.version, "2.0.0");
        assert!(catalog.insert(descriptor("3.0.0")).is_some());
        assert_eq!((catalog.get("clash").unwrap().factory())().metadata().version, "3.0.0");
    }

    #[test]
    fn panicking_constructor_is_a_load_error() {
        let mut catalog = PluginCatalog::new();
        let err = catalog.register(|| -> Box<dyn Plugin> { panic!("no") }).unwrap_err();
        assert!(matches!(err, PluginError::Load { .. }));
        assert!(catalog.is_empty());
    }

    #[test]
    fn builtin_catalog_has_every_capability() {
        let catalog = PluginCatalog::builtin();
        let kinds: Vec<PluginKind> = catalog.names().map(|n| catalog.get(n).unwrap().kind).collect();
        assert!(kinds.contains(&PluginKind::Connector));
        assert!(kinds.contains(&PluginKind::Processor));
        assert!(kinds.contains(&PluginKind::Analyzer));
    }
}
