use std::collections::HashMap;

use petgraph::{Direction::Outgoing, graphmap::DiGraphMap};
use semver::Version;
use tracing::{debug, warn};
use wiseflow_plugin::{PluginError, PluginMetadata};

#[derive(Copy, Clone, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// A dependency whose present version does not satisfy the declared requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionMismatch {
    pub plugin: String,
    pub dependency: String,
    pub required: String,
    pub found: String,
}

impl VersionMismatch {
    pub fn into_error(self) -> PluginError {
        PluginError::Dependency {
            plugin: self.plugin,
            reason: format!(
                "`{}` {} does not satisfy `{}`",
                self.dependency, self.found, self.required
            ),
        }
    }
}

/// Orders plugins so that every plugin comes after the plugins it depends on.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Returns plugin names in load order.
    ///
    /// Edges point from a plugin to its dependencies; a post-order walk then
    /// emits dependencies first. Plugins with no constraint between them keep
    /// their input order. Dependencies that are not in `plugins` are skipped
    /// with a warning; any cycle is an error.
    pub fn resolve_dependencies(&self, plugins: &[PluginMetadata]) -> Result<Vec<String>, PluginError> {
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        let index_of: HashMap<&str, usize> = plugins
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.as_str(), i))
            .collect();

        // 1) nodes, in input order
        for i in 0..plugins.len() {
            graph.add_node(i);
        }

        // 2) edges plugin -> dependency
        for (i, meta) in plugins.iter().enumerate() {
            for dep in meta.dependency_names() {
                match index_of.get(dep) {
                    Some(&j) => {
                        graph.add_edge(i, j, ());
                    }
                    None => warn!(plugin = %meta.name, dependency = dep, "dependency not found, skipping"),
                }
            }
        }

        // 3) depth-first post-order with cycle detection
        let mut marks: HashMap<usize, Mark> = HashMap::new();
        let mut path = Vec::new();
        let mut order = Vec::with_capacity(plugins.len());
        for i in 0..plugins.len() {
            visit(&graph, i, &mut marks, &mut path, &mut order).map_err(|cycle| {
                PluginError::DependencyCycle {
                    cycle: cycle.into_iter().map(|n| plugins[n].name.clone()).collect(),
                }
            })?;
        }

        let names: Vec<String> = order.into_iter().map(|i| plugins[i].name.clone()).collect();
        debug!(order = ?names, "resolved plugin order");
        Ok(names)
    }

    /// Every declared requirement whose dependency is present but at an
    /// incompatible version. Unparseable versions and requirements are
    /// reported as mismatches too.
    pub fn check_versions(&self, plugins: &[PluginMetadata]) -> Vec<VersionMismatch> {
        let versions: HashMap<&str, &str> = plugins
            .iter()
            .map(|m| (m.name.as_str(), m.version.as_str()))
            .collect();
        let mut mismatches = Vec::new();
        for meta in plugins {
            for (dep, raw_req) in &meta.dependencies {
                let Some(found) = versions.get(dep.as_str()) else {
                    continue;
                };
                let ok = match (meta.dependency_requirement(dep), Version::parse(found)) {
                    (Some(Ok(req)), Ok(version)) => req.matches(&version),
                    _ => false,
                };
                if !ok {
                    mismatches.push(VersionMismatch {
                        plugin: meta.name.clone(),
                        dependency: dep.clone(),
                        required: raw_req.clone(),
                        found: found.to_string(),
                    });
                }
            }
        }
        mismatches
    }
}

/// Returns the cycle, closed on its first member, when one is found.
fn visit(
    graph: &DiGraphMap<usize, ()>,
    node: usize,
    marks: &mut HashMap<usize, Mark>,
    path: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> Result<(), Vec<usize>> {
    match marks.get(&node) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::InProgress) => {
            let start = path.iter().position(|&n| n == node).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(node);
            return Err(cycle);
        }
        None => {}
    }
    marks.insert(node, Mark::InProgress);
    path.push(node);
    for dep in graph.neighbors_directed(node, Outgoing) {
        visit(graph, dep, marks, path, order)?;
    }
    path.pop();
    marks.insert(node, Mark::Done);
    order.push(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, deps: &[&str]) -> PluginMetadata {
        deps.iter()
            .fold(PluginMetadata::new(name, "1.0.0"), |m, d| m.with_dependency(*d, "*"))
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn dependencies_come_first() {
        let plugins = vec![
            meta("report", &["analyzer", "cleaner"]),
            meta("analyzer", &["cleaner"]),
            meta("standalone", &[]),
            meta("cleaner", &["fetcher"]),
            meta("fetcher", &[]),
        ];
        let order = DependencyResolver::new().resolve_dependencies(&plugins).unwrap();
        assert_eq!(order.len(), plugins.len());
        for p in &plugins {
            assert_eq!(order.iter().filter(|n| **n == p.name).count(), 1);
            for dep in p.dependency_names() {
                assert!(position(&order, dep) < position(&order, &p.name), "{dep} before {}", p.name);
            }
        }
    }

    #[test]
    fn unconstrained_plugins_keep_input_order() {
        let plugins = vec![meta("c", &[]), meta("a", &[]), meta("b", &[])];
        let order = DependencyResolver::new().resolve_dependencies(&plugins).unwrap();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn three_node_cycle_is_reported() {
        let plugins = vec![meta("A", &["B"]), meta("B", &["C"]), meta("C", &["A"])];
        let err = DependencyResolver::new().resolve_dependencies(&plugins).unwrap_err();
        match err {
            PluginError::DependencyCycle { cycle } => {
                assert_eq!(cycle, vec!["A", "B", "C", "A"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plugins = vec![meta("ok", &[]), meta("loop", &["loop"])];
        assert!(matches!(
            DependencyResolver::new().resolve_dependencies(&plugins),
            Err(PluginError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn missing_dependencies_are_skipped() {
        let plugins = vec![meta("b", &["a", "ghost"]), meta("a", &[])];
        let order = DependencyResolver::new().resolve_dependencies(&plugins).unwrap();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn version_requirements_are_checked() {
        let plugins = vec![
            PluginMetadata::new("base", "1.4.0"),
            PluginMetadata::new("ok", "1.0.0").with_dependency("base", "^1.2"),
            PluginMetadata::new("stale", "1.0.0").with_dependency("base", ">=2"),
            PluginMetadata::new("orphan", "1.0.0").with_dependency("missing", "1"),
        ];
        let mismatches = DependencyResolver::new().check_versions(&plugins);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].plugin, "stale");
        assert_eq!(mismatches[0].found, "1.4.0");
        assert!(matches!(
            mismatches[0].clone().into_error(),
            PluginError::Dependency { .. }
        ));
    }
}
