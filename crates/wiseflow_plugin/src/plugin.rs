use std::{fmt, sync::Arc};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};

use crate::{
    error::PluginError,
    event::{Event, EventCallback, EventType, SubscriptionId},
    metadata::{PluginKind, PluginMetadata},
};

/// Where a plugin instance is in its lifecycle.
///
/// ```text
/// Unloaded -> Loaded -> Initialized -> Active <-> Disabled
///     any state -> Error -> Uninstalled
/// ```
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default,
    Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PluginState {
    #[default]
    Unloaded,
    Loaded,
    Initialized,
    Active,
    Disabled,
    Error,
    Uninstalled,
}

impl PluginState {
    pub fn valid_transitions(&self) -> &'static [PluginState] {
        use PluginState::*;
        match self {
            Unloaded => &[Loaded, Error, Uninstalled],
            Loaded => &[Initialized, Unloaded, Error, Uninstalled],
            Initialized => &[Active, Disabled, Unloaded, Error],
            Active => &[Disabled, Unloaded, Error],
            Disabled => &[Active, Unloaded, Error],
            Error => &[Uninstalled],
            Uninstalled => &[],
        }
    }

    pub fn can_transition_to(&self, target: PluginState) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Running states, i.e. the ones a shutdown applies to.
    pub fn is_running(&self) -> bool {
        matches!(self, PluginState::Initialized | PluginState::Active | PluginState::Disabled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PluginState::Error | PluginState::Uninstalled)
    }
}

/// The one trait plugin authors implement.
///
/// Capability contracts are reached through the `as_*` accessors; a plugin
/// declaring [`PluginKind::Processor`] must return `Some` from
/// [`Plugin::as_processor`], and so on. Every call the host makes goes
/// through the isolation layer, so implementations may block or fail freely.
pub trait Plugin: Send {
    /// Static description; `metadata().name` is the registry key.
    fn metadata(&self) -> PluginMetadata;

    fn kind(&self) -> PluginKind {
        PluginKind::Generic
    }

    /// Called once per instance. The context stays valid for the lifetime of
    /// the instance and may be stored.
    fn initialize(&mut self, ctx: PluginContext) -> anyhow::Result<()>;

    /// Release whatever `initialize` acquired. Resources registered through
    /// the context are swept by the host afterwards regardless.
    fn shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_connector(&mut self) -> Option<&mut dyn Connector> {
        None
    }

    fn as_processor(&mut self) -> Option<&mut dyn Processor> {
        None
    }

    fn as_analyzer(&mut self) -> Option<&mut dyn Analyzer> {
        None
    }
}

/// Pulls data from an external source.
pub trait Connector: Send {
    fn connect(&mut self) -> anyhow::Result<()>;

    fn fetch_data(&mut self, query: &Value) -> anyhow::Result<Value>;

    fn disconnect(&mut self) -> anyhow::Result<()>;
}

/// Transforms data.
pub trait Processor: Send {
    fn process(&mut self, data: Value, options: &Map<String, Value>) -> anyhow::Result<Value>;
}

/// Derives insights from data.
pub trait Analyzer: Send {
    fn analyze(&mut self, data: Value, options: &Map<String, Value>) -> anyhow::Result<Value>;
}

/// Something a plugin holds that must be released on shutdown
/// (file handles, sockets, worker threads).
pub trait Resource: Send {
    fn release(&mut self) -> anyhow::Result<()>;
}

/// A [`Resource`] backed by a release closure. The closure runs at most once.
pub struct FnResource {
    release: Option<Box<dyn FnOnce() -> anyhow::Result<()> + Send>>,
}

impl FnResource {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self { release: Some(Box::new(release)) }
    }
}

impl Resource for FnResource {
    fn release(&mut self) -> anyhow::Result<()> {
        match self.release.take() {
            Some(release) => release(),
            None => Ok(()),
        }
    }
}

/// Handle of a resource tracked by the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

/// Services the host exposes to plugins. Every call carries the owning
/// plugin's name so the host can clean up after it.
pub trait PluginHost: Send + Sync {
    fn publish(&self, event: Event) -> anyhow::Result<()>;

    fn subscribe(&self, owner: &str, event_type: Option<EventType>, callback: EventCallback) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn register_resource(&self, owner: &str, kind: &str, resource: Box<dyn Resource>) -> ResourceId;

    fn release_resource(&self, owner: &str, id: ResourceId) -> Result<(), PluginError>;
}

/// Per-instance view of the host handed to [`Plugin::initialize`].
#[derive(Clone)]
pub struct PluginContext {
    plugin_name: String,
    config: Map<String, Value>,
    host: Arc<dyn PluginHost>,
}

impl PluginContext {
    pub fn new(plugin_name: impl Into<String>, config: Map<String, Value>, host: Arc<dyn PluginHost>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            config,
            host,
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Publishes an event stamped with this plugin as its source.
    pub fn publish(&self, event_type: EventType, data: Map<String, Value>) -> anyhow::Result<()> {
        self.host
            .publish(Event::new(event_type, data).with_source(self.plugin_name.clone()))
    }

    /// Subscribes on behalf of this plugin; the host drops the subscription
    /// when the plugin shuts down.
    pub fn subscribe(&self, event_type: Option<EventType>, callback: EventCallback) -> SubscriptionId {
        self.host.subscribe(&self.plugin_name, event_type, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.host.unsubscribe(id)
    }

    pub fn register_resource(&self, kind: &str, resource: Box<dyn Resource>) -> ResourceId {
        self.host.register_resource(&self.plugin_name, kind, resource)
    }

    pub fn release_resource(&self, id: ResourceId) -> Result<(), PluginError> {
        self.host.release_resource(&self.plugin_name, id)
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_name", &self.plugin_name)
            .field("config_keys", &self.config.keys().collect::<Vec<_>>())
            .field("host", &"<PluginHost>")
            .finish()
    }
}
