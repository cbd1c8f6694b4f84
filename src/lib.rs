pub mod builtin;
pub mod config;
pub mod dependency;
pub mod event_bus;
pub mod host;
pub mod isolation;
pub mod lifecycle;
pub mod llm;
pub mod loader;
pub mod logger;
pub mod manager;
pub mod registry;
pub mod resources;
pub mod schema;
pub mod security;
pub mod util;
pub mod watcher;

pub use wiseflow_plugin as plugin;
