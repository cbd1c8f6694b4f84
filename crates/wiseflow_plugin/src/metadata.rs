use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::PluginError;

/// How much the host should trust a plugin.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// The capability contract a plugin implements.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default,
    Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PluginKind {
    Connector,
    Processor,
    Analyzer,
    #[default]
    Generic,
}

/// Descriptive data about a plugin. `name` is the registry key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PluginMetadata {
    pub name: String,
    /// Semantic version, e.g. `1.2.0`.
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub license: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_system_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_system_version: Option<String>,
    /// plugin name → semver requirement (`"*"` or empty accepts anything)
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub security_level: SecurityLevel,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            website: String::new(),
            license: String::new(),
            min_system_version: None,
            max_system_version: None,
            dependencies: BTreeMap::new(),
            security_level: SecurityLevel::default(),
            load_time: None,
            init_time: None,
            file_hash: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = license.into();
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>, requirement: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), requirement.into());
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn with_system_range(mut self, min: Option<&str>, max: Option<&str>) -> Self {
        self.min_system_version = min.map(str::to_string);
        self.max_system_version = max.map(str::to_string);
        self
    }

    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    pub fn parsed_version(&self) -> Result<Version, PluginError> {
        Version::parse(&self.version).map_err(|e| PluginError::Validation {
            plugin: self.name.clone(),
            reason: format!("invalid version `{}`: {}", self.version, e),
        })
    }

    /// Parsed requirement for `dependency`; `None` when it is not declared.
    pub fn dependency_requirement(&self, dependency: &str) -> Option<Result<VersionReq, PluginError>> {
        self.dependencies
            .get(dependency)
            .map(|raw| parse_requirement(&self.name, dependency, raw))
    }

    /// Checks `[min_system_version, max_system_version]` (both inclusive)
    /// against the running system version.
    pub fn check_system_compatibility(&self, system_version: &Version) -> Result<(), PluginError> {
        let incompatible = |reason: String| PluginError::Compatibility {
            plugin: self.name.clone(),
            system_version: system_version.to_string(),
            reason,
        };

        if let Some(min) = &self.min_system_version {
            let min = parse_loose_version(min)
                .ok_or_else(|| incompatible(format!("unparseable min_system_version `{}`", min)))?;
            if system_version < &min {
                return Err(incompatible(format!("requires at least {}", min)));
            }
        }
        if let Some(max) = &self.max_system_version {
            let max = parse_loose_version(max)
                .ok_or_else(|| incompatible(format!("unparseable max_system_version `{}`", max)))?;
            if system_version > &max {
                return Err(incompatible(format!("supports at most {}", max)));
            }
        }
        Ok(())
    }
}

/// Parses a dependency requirement. Empty strings and `*` match any version.
pub fn parse_requirement(plugin: &str, dependency: &str, raw: &str) -> Result<VersionReq, PluginError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "*" {
        return Ok(VersionReq::STAR);
    }
    VersionReq::parse(raw).map_err(|e| PluginError::Validation {
        plugin: plugin.to_string(),
        reason: format!("invalid requirement `{}` for dependency `{}`: {}", raw, dependency, e),
    })
}

/// Accepts `1`, `1.2` and full `1.2.3` forms.
pub fn parse_loose_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }
    let mut parts = raw.split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = match parts.next() {
        Some(p) => p.ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(Version::new(major, minor, 0))
}
