// src/project/mod.rs

//! Project model and composer.
//!
//! A project is rooted at the directory holding the `HyperMake` root file.
//! Loading merges the root, any `includes`-matched files and `.hmakerc`
//! overlays into a single master view with a flat target namespace, then
//! finalization resolves the dependency graph.

pub mod graph;
pub mod loader;
pub mod model;
pub mod settings;
pub mod watch;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::GlobBuilder;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{Errors, HmakeError};
pub use graph::TargetGraph;
pub use model::{File, Target};
pub use settings::Settings;

/// Default root file name.
pub const ROOT_FILE: &str = "HyperMake";
/// Per-directory local override file.
pub const RC_FILE: &str = ".hmakerc";
/// Name of the generated work area under the project root.
pub const WORK_FOLDER: &str = ".hmake";
/// Summary file name inside the work area.
pub const SUMMARY_FILE_NAME: &str = "hmake.summary.json";
/// Debug log file name inside the work area.
pub const LOG_FILE_NAME: &str = "hmake.debug.log";

/// Well-known settings keys.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CommonSettings {
    #[serde(default, rename = "default-targets")]
    pub default_targets: Vec<String>,
    #[serde(default, rename = "exec-target")]
    pub exec_target: String,
    #[serde(default, rename = "exec-shell")]
    pub exec_shell: String,
}

/// The world view of hmake.
#[derive(Debug, Clone, Default)]
pub struct Project {
    /// Project name from the root file.
    pub name: String,
    /// Root directory of the project.
    pub base_dir: PathBuf,
    /// Relative path under `base_dir` where hmake was launched.
    pub launch_path: String,
    /// Merge of all loaded files.
    pub master_file: File,
    /// All loaded files, root first.
    pub files: Vec<File>,
    /// Finalized targets by name.
    pub targets: BTreeMap<String, Target>,
    /// Dependency links, available after [`Project::finalize`].
    pub graph: TargetGraph,
}

impl Project {
    /// Create a project by walking up from `start_dir` until `project_file`
    /// is found.
    pub fn locate_from(start_dir: &Path, project_file: &str) -> Result<Project> {
        let mut wd = start_dir
            .canonicalize()
            .with_context(|| format!("resolving start directory {}", start_dir.display()))?;
        let mut launch_path = String::new();

        loop {
            if wd.join(project_file).is_file() {
                let mut p = Project {
                    base_dir: wd,
                    launch_path,
                    ..Project::default()
                };
                p.load(project_file)?;
                return Ok(p);
            }
            let Some(parent) = wd.parent().map(Path::to_path_buf) else {
                bail!("project not found: no {project_file} from {}", start_dir.display());
            };
            if parent == wd {
                bail!("project not found: no {project_file} from {}", start_dir.display());
            }
            let base = wd
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            launch_path = if launch_path.is_empty() {
                base
            } else {
                format!("{base}/{launch_path}")
            };
            wd = parent;
        }
    }

    /// Locate, resolve and finalize a project starting at `start_dir`.
    pub fn load_from(start_dir: &Path, project_file: &str) -> Result<Project> {
        let mut p = Project::locate_from(start_dir, project_file)?;
        p.load_rc_files()?;
        p.resolve()?;
        p.finalize()?;
        Ok(p)
    }

    /// Load and merge one file. Loading is memoized by path; the first loaded
    /// file is the root and fixes the project name and master source.
    pub fn load(&mut self, path: &str) -> Result<()> {
        if self.files.iter().any(|f| f.source == path) {
            return Ok(());
        }
        let allow_wrapper = self.files.is_empty();
        let f = loader::load_file(&self.base_dir, path, allow_wrapper)?;

        self.master_file.merge(&f)?;
        if self.files.is_empty() {
            self.master_file.source = f.source.clone();
            self.master_file.wrapper_target = f.wrapper_target.clone();
            self.name = f.name.clone();
            model::validate_project_name(&self.name)?;
        }
        self.files.push(f);
        Ok(())
    }

    /// Load `.hmakerc` overlays from the launch path upward to the project
    /// root, outermost first so inner directories override outer ones.
    pub fn load_rc_files(&mut self) -> Result<()> {
        let mut rc_paths = Vec::new();
        let mut path = self.launch_path.clone();
        loop {
            if path.is_empty() {
                rc_paths.push(RC_FILE.to_string());
                break;
            }
            rc_paths.push(format!("{path}/{RC_FILE}"));
            path = match path.rsplit_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => String::new(),
            };
        }

        let mut errs = Errors::new();
        for rc in rc_paths.iter().rev() {
            if !self.base_dir.join(rc).is_file() {
                continue;
            }
            errs.add_result(self.load(rc));
        }
        errs.aggregate()
    }

    /// Match project-relative paths against a glob pattern with `**` support.
    /// Returns files and directories; the `.hmake` work area is never
    /// matched.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid glob pattern: {pattern}"))?
            .compile_matcher();

        let mut out = Vec::new();
        let walker = WalkDir::new(&self.base_dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.file_name().to_str() != Some(WORK_FOLDER));
        for entry in walker.flatten() {
            let rel = match entry.path().strip_prefix(&self.base_dir) {
                Ok(rel) => model::to_slash(rel),
                Err(_) => continue,
            };
            if matcher.is_match(&rel) {
                out.push(rel);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Expand include patterns, loading every matched file. Files loaded this
    /// way may bring further includes; the loop runs to a fixed point.
    pub fn resolve(&mut self) -> Result<()> {
        let mut errs = Errors::new();
        let mut i = 0;
        while i < self.master_file.includes.len() {
            let pattern = self.master_file.includes[i].clone();
            i += 1;
            let paths = match self.glob(&pattern) {
                Ok(paths) => paths,
                Err(e) => {
                    errs.add(e);
                    continue;
                }
            };
            for path in paths {
                if self.base_dir.join(&path).is_dir() {
                    continue;
                }
                errs.add_result(self.load(&path));
            }
        }
        errs.aggregate()
    }

    /// Build the target map and dependency graph and verify acyclicity.
    pub fn finalize(&mut self) -> Result<()> {
        self.targets = self.master_file.targets.clone();
        self.graph = TargetGraph::build(&self.targets)?;
        debug!(project = %self.name, targets = self.targets.len(), "project finalized");
        Ok(())
    }

    /// Sorted names of all targets.
    pub fn target_names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    /// Sorted names matching a pattern (literal, glob or `/regex/`).
    pub fn target_names_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut names = graph::complete_name(pattern, &self.targets)?;
        names.sort();
        Ok(names)
    }

    /// The wrapper target, when the project was loaded in wrapper mode.
    pub fn wrapper_target(&self) -> Option<&Target> {
        self.master_file
            .wrapper_target
            .as_deref()
            .and_then(|name| self.targets.get(name))
    }

    /// Project the master settings section at `key` onto `T`.
    pub fn settings_as<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        self.master_file.settings.section_as(key)
    }

    /// Well-known settings view.
    pub fn common_settings(&self) -> Result<CommonSettings> {
        self.master_file.settings.as_type()
    }

    /// Merge a flat key/value map (dotted keys) into the master settings.
    pub fn merge_settings_flat(&mut self, flat: &BTreeMap<String, Value>) {
        self.master_file.settings.merge_flat(flat);
    }

    /// Settings lookup for a target: master settings at `section`, overlaid
    /// by the target file's local settings at `section`.
    pub fn target_settings_as<T: DeserializeOwned + Default>(
        &self,
        target: &Target,
        section: &str,
    ) -> Result<T> {
        self.target_section_value(target, section, false)
            .map(|v| serde_yaml::from_value(v))
            .transpose()
            .with_context(|| format!("mapping settings section '{section}' for target {}", target.name))
            .map(Option::unwrap_or_default)
    }

    /// Like [`Project::target_settings_as`] with the target's extension bag
    /// overlaid on top.
    pub fn target_settings_with_ext<T: DeserializeOwned + Default>(
        &self,
        target: &Target,
        section: &str,
    ) -> Result<T> {
        self.target_section_value(target, section, true)
            .map(|v| serde_yaml::from_value(v))
            .transpose()
            .with_context(|| format!("mapping settings section '{section}' for target {}", target.name))
            .map(Option::unwrap_or_default)
    }

    fn target_section_value(&self, target: &Target, section: &str, with_ext: bool) -> Option<Value> {
        let mut out: Option<Value> = None;
        if let Some(v) = self.master_file.settings.get(section) {
            overlay(&mut out, v);
        }
        if let Some(f) = self.file_of(target) {
            if let Some(v) = f.local.get(section) {
                overlay(&mut out, v);
            }
        }
        if with_ext && !target.ext.is_empty() {
            let m: Mapping = target
                .ext
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                .collect();
            overlay(&mut out, &Value::Mapping(m));
        }
        out
    }

    /// The file a target was defined in.
    pub fn file_of(&self, target: &Target) -> Option<&File> {
        self.files.iter().find(|f| f.source == target.source)
    }

    /// Full path to the work area (`<project>/.hmake`).
    pub fn work_path(&self) -> PathBuf {
        self.base_dir.join(WORK_FOLDER)
    }

    /// Full path to the summary file.
    pub fn summary_file(&self) -> PathBuf {
        self.work_path().join(SUMMARY_FILE_NAME)
    }

    /// Full path to the debug log file.
    pub fn debug_log_file(&self) -> PathBuf {
        self.work_path().join(LOG_FILE_NAME)
    }
}

fn overlay(out: &mut Option<Value>, v: &Value) {
    match out {
        Some(dst) => settings::merge_value(dst, v),
        None => *out = Some(v.clone()),
    }
}

impl File {
    /// Merge targets, settings and includes from another file into this
    /// master view. Duplicate target names across files are errors naming
    /// both sources.
    pub fn merge(&mut self, other: &File) -> Result<()> {
        let mut errs = Errors::new();
        for (name, t) in &other.targets {
            if let Some(existing) = self.targets.get(name) {
                errs.add(HmakeError::DuplicateTarget {
                    name: name.clone(),
                    source1: existing.source.clone(),
                    source2: other.source.clone(),
                });
            } else {
                self.targets.insert(name.clone(), t.clone());
            }
        }
        self.settings.merge(&other.settings);
        for inc in &other.includes {
            let path = model::rel_path(&other.source, inc);
            if !self.includes.contains(&path) {
                self.includes.push(path);
            }
        }
        errs.aggregate()
    }
}
