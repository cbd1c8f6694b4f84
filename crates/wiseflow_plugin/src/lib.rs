pub mod error;
pub mod event;
pub mod metadata;
pub mod plugin;

pub use error::{PluginError, PluginErrorKind};
pub use event::{AsyncEventHandler, Event, EventCallback, EventType, SubscriptionId};
pub use metadata::{PluginKind, PluginMetadata, SecurityLevel};
pub use plugin::{
    Analyzer, Connector, FnResource, Plugin, PluginContext, PluginHost, PluginState, Processor,
    Resource, ResourceId,
};

/// Version of the plugin contract.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
