// src/project/graph.rs

//! Dependency links between targets.
//!
//! `before`/`after` lists are pattern-completed against the target set, then
//! resolved into a bidirectional adjacency keyed by name: `depends` (targets
//! this one waits for) and `activates` (the inverse). Cycles are rejected at
//! finalization.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};
use globset::Glob;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use regex::Regex;

use crate::errors::{Errors, HmakeError};
use crate::project::model::Target;

/// Name-keyed adjacency for the target DAG.
#[derive(Debug, Clone, Default)]
pub struct TargetGraph {
    depends: BTreeMap<String, BTreeSet<String>>,
    activates: BTreeMap<String, BTreeSet<String>>,
}

impl TargetGraph {
    /// Targets `name` waits for.
    pub fn depends_of(&self, name: &str) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.depends.get(name).unwrap_or(&EMPTY)
    }

    /// Targets waiting for `name`.
    pub fn activates_of(&self, name: &str) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.activates.get(name).unwrap_or(&EMPTY)
    }

    fn add_dep(&mut self, target: &str, dep: &str) {
        self.depends
            .entry(target.to_string())
            .or_default()
            .insert(dep.to_string());
        self.activates
            .entry(dep.to_string())
            .or_default()
            .insert(target.to_string());
    }

    /// Resolve `before`/`after` of every target into dependency links.
    /// Unknown names after pattern completion are errors; all problems are
    /// reported together.
    pub fn build(targets: &BTreeMap<String, Target>) -> Result<Self> {
        let mut graph = TargetGraph::default();
        for name in targets.keys() {
            graph.depends.entry(name.clone()).or_default();
            graph.activates.entry(name.clone()).or_default();
        }

        let mut errs = Errors::new();
        for t in targets.values() {
            for (list, relation) in [(&t.before, "before"), (&t.after, "after")] {
                for pattern in list {
                    let completed = match complete_name(pattern, targets) {
                        Ok(c) => c,
                        Err(e) => {
                            errs.add(e);
                            continue;
                        }
                    };
                    for dest in completed {
                        if !targets.contains_key(&dest) {
                            errs.add(HmakeError::UnknownDependency {
                                target: t.name.clone(),
                                source_file: t.source.clone(),
                                relation: relation.to_string(),
                                name: dest,
                            });
                        } else if relation == "before" {
                            // t runs before dest: dest depends on t.
                            graph.add_dep(&dest, &t.name);
                        } else {
                            graph.add_dep(&t.name, &dest);
                        }
                    }
                }
            }
        }
        errs.aggregate()?;

        graph.check_cycles(targets)?;
        Ok(graph)
    }

    /// Detect dependency cycles, reporting every involved target with its
    /// source file.
    fn check_cycles(&self, targets: &BTreeMap<String, Target>) -> Result<()> {
        let mut g: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in self.depends.keys() {
            g.add_node(name.as_str());
        }
        for (name, deps) in &self.depends {
            for dep in deps {
                g.add_edge(dep.as_str(), name.as_str(), ());
            }
        }

        let mut errs = Errors::new();
        for scc in tarjan_scc(&g) {
            let cyclic = scc.len() > 1 || scc.iter().any(|n| g.contains_edge(n, n));
            if !cyclic {
                continue;
            }
            let mut names: Vec<&str> = scc;
            names.sort_unstable();
            for name in names {
                let source = targets
                    .get(name)
                    .map(|t| t.source.clone())
                    .unwrap_or_default();
                errs.add(HmakeError::CyclicDependency {
                    target: name.to_string(),
                    source_file: source,
                });
            }
        }
        errs.aggregate()
    }
}

/// Resolve a target reference into concrete names.
///
/// - a pure literal resolves to itself;
/// - a string containing `*?[\` is matched as a shell-style glob;
/// - `/<regex>/` is matched as a regular expression.
pub fn complete_name(name: &str, targets: &BTreeMap<String, Target>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    if let Some(stripped) = name.strip_prefix('/') {
        let rex_str = stripped
            .strip_suffix('/')
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("incomplete regexp: {name}"))?;
        let rex =
            Regex::new(rex_str).map_err(|e| anyhow!("invalid regexp: {rex_str}: {e}"))?;
        for n in targets.keys() {
            if rex.is_match(n) {
                out.push(n.clone());
            }
        }
    } else if name.contains(['*', '?', '[', '\\']) {
        let glob = Glob::new(name)
            .map_err(|e| anyhow!("malformed pattern: {name}: {e}"))?
            .compile_matcher();
        for n in targets.keys() {
            if glob.is_match(n) {
                out.push(n.clone());
            }
        }
    } else {
        out.push(name.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(names: &[&str]) -> BTreeMap<String, Target> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    Target {
                        name: n.to_string(),
                        source: "HyperMake".to_string(),
                        ..Target::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn literal_completion_is_identity() {
        let set = targets(&["build", "test"]);
        assert_eq!(complete_name("build", &set).unwrap(), ["build"]);
        // Even names not in the set pass through untouched.
        assert_eq!(complete_name("nope", &set).unwrap(), ["nope"]);
    }

    #[test]
    fn glob_and_regex_completion() {
        let set = targets(&["test-unit", "test-e2e", "build"]);
        let mut globbed = complete_name("test-*", &set).unwrap();
        globbed.sort();
        assert_eq!(globbed, ["test-e2e", "test-unit"]);

        let rexed = complete_name("/^test-u/", &set).unwrap();
        assert_eq!(rexed, ["test-unit"]);

        assert!(complete_name("/unterminated", &set).is_err());
    }

    #[test]
    fn before_becomes_reverse_dependency() {
        let mut set = targets(&["gen", "build"]);
        set.get_mut("gen").unwrap().before = vec!["build".to_string()];
        let g = TargetGraph::build(&set).unwrap();
        assert!(g.depends_of("build").contains("gen"));
        assert!(g.activates_of("gen").contains("build"));
    }

    #[test]
    fn cycle_reports_both_targets() {
        let mut set = targets(&["t1", "t2"]);
        set.get_mut("t1").unwrap().after = vec!["t2".to_string()];
        set.get_mut("t2").unwrap().after = vec!["t1".to_string()];
        let err = TargetGraph::build(&set).unwrap_err().to_string();
        assert!(err.contains("t1"), "missing t1 in: {err}");
        assert!(err.contains("t2"), "missing t2 in: {err}");
        assert!(err.contains("cyclic"), "missing kind in: {err}");
    }

    #[test]
    fn unknown_dependency_is_error() {
        let mut set = targets(&["a"]);
        set.get_mut("a").unwrap().after = vec!["ghost".to_string()];
        assert!(TargetGraph::build(&set).is_err());
    }
}
