//! Checks a plugin has to pass before its class is registered.
use schemars::JsonSchema;
use semver::Version;
use serde::{Deserialize, Serialize};
use wiseflow_plugin::{Plugin, PluginError, PluginKind, PluginMetadata, SecurityLevel};

use crate::util::is_valid_plugin_name;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Module paths a plugin may not declare. A prefix match on a path
    /// boundary (`::` or `.`) counts.
    pub denied_imports: Vec<String>,
    /// Attribute names that reject a plugin outright.
    pub dangerous_attributes: Vec<String>,
    /// The only imports a `high` security plugin may declare.
    pub allowed_high_security_imports: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        Self {
            denied_imports: owned(&["std::process", "libc", "std::ffi", "subprocess", "os.system", "ctypes"]),
            dangerous_attributes: owned(&["exec", "eval", "unsafe_ffi", "__import__", "raw_pointer"]),
            allowed_high_security_imports: owned(&["serde_json", "std::collections", "std::fmt", "wiseflow_plugin"]),
        }
    }
}

fn path_matches(import: &str, pattern: &str) -> bool {
    match import.strip_prefix(pattern) {
        Some("") => true,
        Some(rest) => rest.starts_with("::") || rest.starts_with('.'),
        None => false,
    }
}

impl SecurityPolicy {
    /// Rejects denylisted imports and dangerous attributes; `high` plugins
    /// are further limited to the allowlist.
    pub fn check(
        &self,
        plugin: &str,
        level: SecurityLevel,
        imports: &[String],
        attributes: &[String],
    ) -> Result<(), PluginError> {
        let reject = |reason: String| PluginError::Security {
            plugin: plugin.to_string(),
            reason,
        };

        for import in imports {
            if let Some(denied) = self.denied_imports.iter().find(|d| path_matches(import, d)) {
                return Err(reject(format!("import `{import}` is denied (`{denied}`)")));
            }
        }
        if let Some(attr) = attributes.iter().find(|a| self.dangerous_attributes.contains(a)) {
            return Err(reject(format!("dangerous attribute `{attr}`")));
        }
        if level == SecurityLevel::High {
            for import in imports {
                if !self
                    .allowed_high_security_imports
                    .iter()
                    .any(|allowed| path_matches(import, allowed))
                {
                    return Err(reject(format!("import `{import}` is not allowed at high security level")));
                }
            }
        }
        Ok(())
    }
}

/// Name, version and dependency requirements are well formed.
pub fn validate_metadata(meta: &PluginMetadata) -> Result<(), PluginError> {
    if !is_valid_plugin_name(&meta.name) {
        return Err(PluginError::Validation {
            plugin: meta.name.clone(),
            reason: "name must start with a letter and contain only letters, digits, `_` or `-`".into(),
        });
    }
    meta.parsed_version()?;
    for dep in meta.dependency_names() {
        if let Some(req) = meta.dependency_requirement(dep) {
            req?;
        }
    }
    Ok(())
}

/// Structural check of a freshly built probe instance against what its
/// registration declares.
pub fn validate_structure(
    declared_name: &str,
    declared_kind: PluginKind,
    probe: &mut dyn Plugin,
) -> Result<(), PluginError> {
    let invalid = |reason: String| PluginError::Validation {
        plugin: declared_name.to_string(),
        reason,
    };

    let meta = probe.metadata();
    if meta.name != declared_name {
        return Err(invalid(format!("instance reports name `{}`", meta.name)));
    }
    let kind = probe.kind();
    if kind != declared_kind {
        return Err(invalid(format!("declared as {declared_kind} but instance is {kind}")));
    }
    let exposes = match declared_kind {
        PluginKind::Connector => probe.as_connector().is_some(),
        PluginKind::Processor => probe.as_processor().is_some(),
        PluginKind::Analyzer => probe.as_analyzer().is_some(),
        PluginKind::Generic => true,
    };
    if !exposes {
        return Err(invalid(format!("{declared_kind} does not implement its capability contract")));
    }
    Ok(())
}

pub fn check_compatibility(meta: &PluginMetadata, system_version: &Version) -> Result<(), PluginError> {
    meta.check_system_compatibility(system_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};
    use wiseflow_plugin::{PluginContext, Processor};

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn denylist_and_attributes() {
        let policy = SecurityPolicy::default();
        let ok = policy.check("p", SecurityLevel::Medium, &strings(&["std::fs", "processing"]), &[]);
        assert!(ok.is_ok());

        let err = policy
            .check("p", SecurityLevel::Low, &strings(&["std::process::Command"]), &[])
            .unwrap_err();
        assert!(matches!(err, PluginError::Security { .. }));
        assert!(policy.check("p", SecurityLevel::Low, &strings(&["os.system"]), &[]).is_err());
        assert!(
            policy
                .check("p", SecurityLevel::Low, &[], &strings(&["name", "eval"]))
                .is_err()
        );
    }

    #[test]
    fn high_security_uses_allowlist() {
        let policy = SecurityPolicy::default();
        assert!(
            policy
                .check("p", SecurityLevel::High, &strings(&["serde_json", "std::collections::HashMap"]), &[])
                .is_ok()
        );
        assert!(policy.check("p", SecurityLevel::High, &strings(&["std::net"]), &[]).is_err());
    }

    #[test]
    fn metadata_validation() {
        assert!(validate_metadata(&PluginMetadata::new("good_one", "1.2.3")).is_ok());
        assert!(validate_metadata(&PluginMetadata::new("bad name", "1.2.3")).is_err());
        assert!(validate_metadata(&PluginMetadata::new("good", "one")).is_err());
        let bad_req = PluginMetadata::new("good", "1.0.0").with_dependency("base", ">>1");
        assert!(validate_metadata(&bad_req).is_err());
    }

    struct Upper {
        claims: PluginKind,
    }

    impl Plugin for Upper {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("upper", "1.0.0")
        }

        fn kind(&self) -> PluginKind {
            self.claims
        }

        fn initialize(&mut self, _ctx: PluginContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn as_processor(&mut self) -> Option<&mut dyn Processor> {
            Some(self)
        }
    }

    impl Processor for Upper {
        fn process(&mut self, data: Value, _options: &Map<String, Value>) -> anyhow::Result<Value> {
            Ok(Value::String(data.as_str().unwrap_or_default().to_uppercase()))
        }
    }

    #[test]
    fn structure_matches_declaration() {
        let mut probe = Upper { claims: PluginKind::Processor };
        assert!(validate_structure("upper", PluginKind::Processor, &mut probe).is_ok());
        assert!(validate_structure("other", PluginKind::Processor, &mut probe).is_err());
        assert!(validate_structure("upper", PluginKind::Analyzer, &mut probe).is_err());

        let mut liar = Upper { claims: PluginKind::Connector };
        let err = validate_structure("upper", PluginKind::Connector, &mut liar).unwrap_err();
        assert!(err.to_string().contains("capability"));
    }

    #[test]
    fn compatibility_range() {
        let meta = PluginMetadata::new("p", "1.0.0").with_system_range(Some("0.2"), Some("0.3.5"));
        assert!(check_compatibility(&meta, &Version::new(0, 2, 0)).is_ok());
        assert!(check_compatibility(&meta, &Version::new(0, 3, 5)).is_ok());
        assert!(check_compatibility(&meta, &Version::new(0, 1, 9)).is_err());
        assert!(check_compatibility(&meta, &Version::new(0, 4, 0)).is_err());
    }
}
