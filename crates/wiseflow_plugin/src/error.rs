use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

/// Coarse classification of a [`PluginError`], for callers that branch on
/// the failure kind instead of matching every variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PluginErrorKind {
    Load,
    Validation,
    Security,
    Compatibility,
    Dependency,
    Timeout,
    Resource,
    Permission,
    Execution,
}

/// Errors raised by the plugin subsystem.
#[derive(Error, Debug)]
pub enum PluginError {
    /// The plugin could not be found or constructed.
    #[error("could not load plugin `{plugin}`: {reason}")]
    Load { plugin: String, reason: String },

    /// The plugin does not satisfy the structural contract of its kind.
    #[error("plugin `{plugin}` failed validation: {reason}")]
    Validation { plugin: String, reason: String },

    /// A denylisted import or dangerous attribute was declared.
    #[error("plugin `{plugin}` rejected by security check: {reason}")]
    Security { plugin: String, reason: String },

    /// The running system version is outside the plugin's supported range.
    #[error("plugin `{plugin}` is not compatible with system version {system_version}: {reason}")]
    Compatibility {
        plugin: String,
        system_version: String,
        reason: String,
    },

    /// A dependency is missing, not running, or has the wrong version.
    #[error("dependency error for plugin `{plugin}`: {reason}")]
    Dependency { plugin: String, reason: String },

    /// The dependency graph contains a cycle; members are listed in path order.
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    /// An isolated call did not finish before its deadline.
    #[error("plugin `{plugin}` operation `{operation}` timed out after {timeout:?}")]
    Timeout {
        plugin: String,
        operation: String,
        timeout: Duration,
    },

    /// Acquiring or releasing a tracked resource failed.
    #[error("resource error for plugin `{plugin}`: {reason}")]
    Resource { plugin: String, reason: String },

    /// The plugin asked for a capability it was not granted.
    #[error("plugin `{plugin}` lacks permission `{permission}`")]
    Permission { plugin: String, permission: String },

    /// Catch-all raised by the isolation layer around any plugin body failure.
    #[error("plugin `{plugin}` failed in `{operation}`: {source}")]
    Execution {
        plugin: String,
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PluginError {
    pub fn kind(&self) -> PluginErrorKind {
        match self {
            PluginError::Load { .. } => PluginErrorKind::Load,
            PluginError::Validation { .. } => PluginErrorKind::Validation,
            PluginError::Security { .. } => PluginErrorKind::Security,
            PluginError::Compatibility { .. } => PluginErrorKind::Compatibility,
            PluginError::Dependency { .. } | PluginError::DependencyCycle { .. } => {
                PluginErrorKind::Dependency
            }
            PluginError::Timeout { .. } => PluginErrorKind::Timeout,
            PluginError::Resource { .. } => PluginErrorKind::Resource,
            PluginError::Permission { .. } => PluginErrorKind::Permission,
            PluginError::Execution { .. } => PluginErrorKind::Execution,
        }
    }

    /// Name of the plugin the error is about, if any.
    pub fn plugin(&self) -> Option<&str> {
        match self {
            PluginError::Load { plugin, .. }
            | PluginError::Validation { plugin, .. }
            | PluginError::Security { plugin, .. }
            | PluginError::Compatibility { plugin, .. }
            | PluginError::Dependency { plugin, .. }
            | PluginError::Timeout { plugin, .. }
            | PluginError::Resource { plugin, .. }
            | PluginError::Permission { plugin, .. }
            | PluginError::Execution { plugin, .. } => Some(plugin),
            PluginError::DependencyCycle { .. } => None,
        }
    }

    /// True for a timeout, including one wrapped by the isolation layer.
    pub fn is_timeout(&self) -> bool {
        match self {
            PluginError::Timeout { .. } => true,
            PluginError::Execution { source, .. } => source
                .downcast_ref::<PluginError>()
                .map_or(false, PluginError::is_timeout),
            _ => false,
        }
    }

    /// Short type label written into error events (`error_type`).
    pub fn type_name(&self) -> String {
        match self {
            PluginError::Execution { source, .. } => match source.downcast_ref::<PluginError>() {
                Some(inner) => inner.type_name(),
                None => "execution".to_string(),
            },
            other => other.kind().to_string(),
        }
    }
}
