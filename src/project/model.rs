// src/project/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::errors::HmakeError;
use crate::project::settings::Settings;

/// The only supported manifest format tag.
pub const FORMAT: &str = "hypermake.v0";

/// Maximum length of a project/target name in bytes.
pub const MAX_NAME_LEN: usize = 1024;

/// One manifest file: the root `HyperMake`, an included `*.hmake` file, or a
/// `.hmakerc` overlay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct File {
    /// Format tag, must equal [`FORMAT`].
    #[serde(default)]
    pub format: String,

    /// Project name; required on the root file only.
    #[serde(default)]
    pub name: String,

    #[serde(default, rename = "description")]
    pub desc: String,

    /// Targets defined in this file, keyed by (possibly expandable) name.
    #[serde(default)]
    pub targets: BTreeMap<String, Target>,

    /// Settings merged into the project master view.
    #[serde(default)]
    pub settings: Settings,

    /// Settings visible only to targets defined in this file.
    #[serde(default)]
    pub local: Settings,

    /// Glob patterns of additional files to load, relative to this file.
    #[serde(default)]
    pub includes: Vec<String>,

    /// Path of this file relative to the project root.
    #[serde(skip)]
    pub source: String,

    /// Default target in wrapper mode.
    #[serde(skip)]
    pub wrapper_target: Option<String>,
}

/// A build target as declared in a manifest.
///
/// Fields the drivers care about (image, volumes, resource limits, ...) live
/// in the schema-less extension bag `ext` and are projected onto driver
/// config structs via [`Settings`] views.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Target {
    #[serde(skip)]
    pub name: String,

    #[serde(default, rename = "description")]
    pub desc: String,

    /// Targets (or patterns) this one must run before.
    #[serde(default)]
    pub before: Vec<String>,

    /// Targets (or patterns) this one runs after, i.e. depends on.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default, rename = "exec-driver")]
    pub exec_driver: String,

    /// Working directory relative to the file defining the target.
    #[serde(default)]
    pub workdir: String,

    /// Extra environment entries (`NAME=value`) for the target process.
    #[serde(default)]
    pub envs: Vec<String>,

    /// Commands synthesized into a script when `script` is absent.
    #[serde(default)]
    pub cmds: Vec<Command>,

    /// Raw script body; takes precedence over `cmds`.
    #[serde(default)]
    pub script: String,

    /// Watch patterns; `!`-prefixed entries are excludes.
    #[serde(default)]
    pub watches: Vec<String>,

    /// Glob patterns that must match at least one path after success.
    #[serde(default)]
    pub artifacts: Vec<String>,

    /// Never skip this target.
    #[serde(default)]
    pub always: bool,

    /// Interactive one-shot exec mode (no build/commit/push).
    #[serde(default)]
    pub exec: bool,

    /// Arguments for exec mode.
    #[serde(default)]
    pub args: Vec<String>,

    /// Driver-specific extension bag.
    #[serde(flatten)]
    pub ext: BTreeMap<String, Value>,

    /// Path of the defining file relative to the project root.
    #[serde(skip)]
    pub source: String,
}

/// A single command entry: either a plain shell string or a structured
/// extension map a driver may interpret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Ext(BTreeMap<String, Value>),
}

impl Command {
    pub fn shell(&self) -> Option<&str> {
        match self {
            Command::Shell(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }
}

impl Target {
    /// Translate a path relative to the defining file into a project-relative
    /// path.
    pub fn project_path(&self, path: &str) -> String {
        rel_path(&self.source, path)
    }

    /// Project-relative working directory for executing the target.
    pub fn working_dir(&self) -> String {
        self.project_path(&self.workdir)
    }

    /// A transit target carries no work of its own: no script, no cmds, no
    /// image, no compose file. It only aggregates dependencies.
    pub fn is_transit(&self) -> bool {
        self.script.is_empty()
            && self.cmds.iter().all(|c| c.shell().is_none())
            && !self.ext.contains_key("image")
            && !self.ext.contains_key("compose")
    }

    /// Look up a string value in the extension bag.
    pub fn ext_str(&self, key: &str) -> Option<&str> {
        self.ext.get(key).and_then(Value::as_str)
    }
}

/// Translate a path relative to `source`'s directory into a project-relative
/// path. `source` is itself project-relative.
pub fn rel_path(source: &str, path: &str) -> String {
    let src_dir = Path::new(source).parent().unwrap_or(Path::new(""));
    if src_dir.as_os_str().is_empty() {
        path.to_string()
    } else {
        normalize_rel(&src_dir.join(path))
    }
}

/// Lexically normalize a relative path, resolving `.` and `..` components and
/// forcing forward slashes.
pub fn normalize_rel(path: &Path) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.components() {
        use std::path::Component;
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(s) => parts.push(s.to_str().unwrap_or("")),
            _ => {}
        }
    }
    parts.join("/")
}

/// Forward-slashed form of a path for use inside containers.
pub fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Join project-relative `rel` onto `base`, tolerating an empty `rel`.
pub fn join_rel(base: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() {
        base.to_path_buf()
    } else {
        base.join(rel)
    }
}

/// Check a target name: starts with a letter or underscore, body of letters,
/// digits, `_`, `-`, `.`, at most [`MAX_NAME_LEN`] bytes.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is required".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name is too long".to_string());
    }
    for (n, ch) in name.chars().enumerate() {
        if n == 0 {
            if !ch.is_alphabetic() && ch != '_' {
                return Err("name must start from a letter or an underscore".to_string());
            }
        } else if !ch.is_alphanumeric() && ch != '_' && ch != '-' && ch != '.' {
            return Err(format!("invalid character in name '{ch}'"));
        }
    }
    Ok(())
}

/// Validate the project name from the root file.
pub fn validate_project_name(name: &str) -> Result<(), HmakeError> {
    if name.is_empty() {
        return Err(HmakeError::ProjectNameMissing);
    }
    validate_name(name).map_err(|reason| HmakeError::IllegalName {
        file: String::new(),
        name: name.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_rules() {
        assert!(validate_name("build").is_ok());
        assert!(validate_name("_x.y-z2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("9lives").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn rel_path_resolves_against_source_dir() {
        assert_eq!(rel_path("HyperMake", "src"), "src");
        assert_eq!(rel_path("mod/a.hmake", "src"), "mod/src");
        assert_eq!(rel_path("mod/a.hmake", "../top"), "top");
    }
}
