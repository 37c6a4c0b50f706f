// src/project/loader.rs

//! Manifest file loading.
//!
//! A file is either a regular YAML manifest (`format: hypermake.v0`) or, for
//! the root file only, a wrapper script starting with
//! `#hmake-wrapper <image> [<dockerfile-dir> [<build-arg> ...]]` which is
//! synthesized into a one-target project.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde_yaml::Value;
use tracing::debug;

use crate::errors::HmakeError;
use crate::project::model::{validate_name, Command, File, Target, FORMAT};

/// Magic first-line prefix of a wrapper file.
pub const WRAPPER_MAGIC: &str = "#hmake-wrapper";

/// Project name used in wrapper mode.
pub const WRAPPER_NAME: &str = "wrapper";

const WRAPPER_DESC: &str = "wrapped HyperMake project";

/// Load a manifest from `base_dir`/`path`. `allow_wrapper` is true only for
/// the root file.
pub fn load_file(base_dir: &Path, path: &str, allow_wrapper: bool) -> Result<File> {
    let full = base_dir.join(path);
    let data = fs::read_to_string(&full)
        .with_context(|| format!("reading manifest at {}", full.display()))?;

    if allow_wrapper {
        if let Some(mut f) = load_as_wrapper(&data)? {
            f.source = path.to_string();
            for (name, t) in f.targets.iter_mut() {
                t.name = name.clone();
                t.source = f.source.clone();
            }
            return Ok(f);
        }
    }

    let val: Value = serde_yaml::from_str(&data)
        .with_context(|| format!("parsing YAML manifest from {path}"))?;

    let format = val
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if format != FORMAT {
        bail!(HmakeError::UnsupportedFormat {
            file: path.to_string(),
            format,
        });
    }

    let mut f: File = serde_yaml::from_value(val)
        .with_context(|| format!("mapping manifest structure from {path}"))?;

    f.targets = expand_targets(&f.targets)?;
    f.source = path.to_string();
    for (name, t) in f.targets.iter_mut() {
        validate_name(name).map_err(|reason| HmakeError::IllegalName {
            file: path.to_string(),
            name: name.clone(),
            reason,
        })?;
        t.name = name.clone();
        t.source = f.source.clone();
    }
    debug!(file = %path, targets = f.targets.len(), "manifest loaded");
    Ok(f)
}

/// Parse a wrapper file. Returns `Ok(None)` when the first line does not
/// carry the wrapper magic.
fn load_as_wrapper(data: &str) -> Result<Option<File>> {
    let Some(first_line) = data.lines().next() else {
        return Ok(None);
    };
    if first_line != WRAPPER_MAGIC && !first_line.starts_with(&format!("{WRAPPER_MAGIC} ")) {
        return Ok(None);
    }

    let rest = first_line
        .strip_prefix(WRAPPER_MAGIC)
        .unwrap_or_default()
        .trim();
    let mut tokens = rest.split(' ').filter(|t| !t.is_empty());
    let image = tokens
        .next()
        .ok_or(HmakeError::WrapperImageMissing)?
        .to_string();
    let build_from = tokens.next().map(str::to_string);
    let build_args: Vec<String> = tokens.map(str::to_string).collect();

    let mut f = File {
        format: FORMAT.to_string(),
        name: WRAPPER_NAME.to_string(),
        desc: WRAPPER_DESC.to_string(),
        ..File::default()
    };

    if let Some(dir) = &build_from {
        let mut toolchain = Target {
            name: "toolchain".to_string(),
            desc: "build toolchain image".to_string(),
            watches: vec![dir.clone()],
            ..Target::default()
        };
        toolchain
            .ext
            .insert("image".to_string(), Value::String(image.clone()));
        toolchain
            .ext
            .insert("build".to_string(), Value::String(dir.clone()));
        if !build_args.is_empty() {
            toolchain.ext.insert(
                "build-args".to_string(),
                Value::Sequence(build_args.iter().cloned().map(Value::String).collect()),
            );
        }
        f.targets.insert(toolchain.name.clone(), toolchain);
    }

    let mut build = Target {
        name: "build".to_string(),
        desc: "wrapped build target".to_string(),
        always: true,
        ..Target::default()
    };
    build
        .ext
        .insert("image".to_string(), Value::String(image));

    // Body of the file becomes the build script; an empty body delegates to
    // make so `hmake <args>` behaves like `make <args>`.
    let body: String = data
        .lines()
        .skip(1)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    if !body.is_empty() {
        build.script = if body.starts_with("#!") {
            body
        } else {
            format!("#!/bin/sh\n{body}")
        };
    } else {
        build.cmds = vec![Command::Shell("make \"$@\"".to_string())];
    }
    if build_from.is_some() {
        build.after.push("toolchain".to_string());
    }

    f.settings.insert(
        "default-targets",
        Value::Sequence(vec![Value::String(build.name.clone())]),
    );
    f.settings
        .insert("exec-target", Value::String(build.name.clone()));
    f.wrapper_target = Some(build.name.clone());
    f.targets.insert(build.name.clone(), build);

    Ok(Some(f))
}

/// One piece of an expandable target name: either literal text or a bracket
/// group `[var:v1,v2,...]`.
#[derive(Debug)]
enum ExpToken {
    Text(String),
    Group { name: String, values: Vec<String> },
}

fn parse_target_name(name: &str) -> Result<Vec<ExpToken>> {
    let mut tokens = Vec::new();
    let mut str = name;
    while !str.is_empty() {
        match str.find('[') {
            Some(pos) => {
                if pos > 0 {
                    tokens.push(ExpToken::Text(str[..pos].to_string()));
                }
                let close = str[pos..]
                    .find(']')
                    .filter(|p| *p > 1)
                    .ok_or_else(|| {
                        anyhow!("invalid expandable target name: {name}: missing ]")
                    })?;
                let text = &str[pos + 1..pos + close];
                let (var, values) = text.split_once(':').ok_or_else(|| {
                    anyhow!("invalid expandable target name: {name}: bad format: {text}")
                })?;
                if validate_name(var).is_err() {
                    bail!("invalid expandable target name: {name}: bad format: {text}");
                }
                let values: Vec<String> = values.split(',').map(str::to_string).collect();
                if values.iter().any(|v| v.is_empty()) {
                    bail!("invalid expandable target name: {name}: bad format: {text}");
                }
                tokens.push(ExpToken::Group {
                    name: var.to_string(),
                    values,
                });
                str = &str[pos + close + 1..];
            }
            None => {
                tokens.push(ExpToken::Text(str.to_string()));
                break;
            }
        }
    }
    Ok(tokens)
}

/// Substitute `$[var]` occurrences. `$[$]` yields a literal `$`; undefined
/// variables are left intact.
pub fn subst_string(vars: &BTreeMap<String, String>, val: &str) -> String {
    let mut res = String::with_capacity(val.len());
    let mut rest = val;
    while let Some(pos) = rest.find("$[") {
        res.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match tail.find(']') {
            Some(end) if end > 2 => {
                let name = &tail[2..end];
                if name == "$" {
                    res.push('$');
                } else if let Some(v) = vars.get(name) {
                    res.push_str(v);
                } else {
                    res.push_str(&tail[..=end]);
                }
                rest = &tail[end + 1..];
            }
            _ => {
                res.push_str(tail);
                return res;
            }
        }
    }
    res.push_str(rest);
    res
}

fn subst_strings(vars: &BTreeMap<String, String>, strs: &[String]) -> Vec<String> {
    strs.iter().map(|s| subst_string(vars, s)).collect()
}

fn subst_value(vars: &BTreeMap<String, String>, v: &Value) -> Value {
    match v {
        Value::String(s) => Value::String(subst_string(vars, s)),
        Value::Sequence(seq) => Value::Sequence(seq.iter().map(|v| subst_value(vars, v)).collect()),
        Value::Mapping(m) => Value::Mapping(
            m.iter()
                .map(|(k, v)| (subst_value(vars, k), subst_value(vars, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Construct one concrete target for a variable combination.
///
/// `$[var]` substitution covers exactly: description, before, after,
/// exec-driver, workdir, watches, artifacts, and the extension bag
/// (recursively). The body fields (envs, cmds, script, args) are carried
/// over verbatim.
fn build_expanded(
    origin: &Target,
    name: &str,
    vars: &BTreeMap<String, String>,
    result: &mut BTreeMap<String, Target>,
) -> Result<()> {
    if result.contains_key(name) {
        bail!(HmakeError::DuplicateExpandedTarget(name.to_string()));
    }
    let t = Target {
        name: name.to_string(),
        desc: subst_string(vars, &origin.desc),
        before: subst_strings(vars, &origin.before),
        after: subst_strings(vars, &origin.after),
        exec_driver: subst_string(vars, &origin.exec_driver),
        workdir: subst_string(vars, &origin.workdir),
        envs: origin.envs.clone(),
        cmds: origin.cmds.clone(),
        script: origin.script.clone(),
        watches: subst_strings(vars, &origin.watches),
        artifacts: subst_strings(vars, &origin.artifacts),
        always: origin.always,
        exec: origin.exec,
        args: origin.args.clone(),
        ext: origin
            .ext
            .iter()
            .map(|(k, v)| (subst_string(vars, k), subst_value(vars, v)))
            .collect(),
        source: origin.source.clone(),
    };
    result.insert(name.to_string(), t);
    Ok(())
}

fn construct_targets(
    tokens: &[ExpToken],
    prefix: &str,
    n: usize,
    origin: &Target,
    vars: &mut BTreeMap<String, String>,
    result: &mut BTreeMap<String, Target>,
) -> Result<()> {
    if n >= tokens.len() {
        return build_expanded(origin, prefix, vars, result);
    }
    match &tokens[n] {
        ExpToken::Group { name, values } => {
            for val in values {
                vars.insert(name.clone(), val.clone());
                construct_targets(
                    tokens,
                    &format!("{prefix}{val}"),
                    n + 1,
                    origin,
                    vars,
                    result,
                )?;
            }
            Ok(())
        }
        ExpToken::Text(text) => construct_targets(
            tokens,
            &format!("{prefix}{text}"),
            n + 1,
            origin,
            vars,
            result,
        ),
    }
}

/// Expand all bracket groups in target names, producing one concrete target
/// per combination; see `build_expanded` for the substitution scope.
pub fn expand_targets(origin: &BTreeMap<String, Target>) -> Result<BTreeMap<String, Target>> {
    let mut result = BTreeMap::new();
    for (key, target) in origin {
        let tokens = parse_target_name(key)?;
        let mut vars = BTreeMap::new();
        construct_targets(&tokens, "", 0, target, &mut vars, &mut result)?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subst_basics() {
        let mut vars = BTreeMap::new();
        vars.insert("os".to_string(), "linux".to_string());
        assert_eq!(subst_string(&vars, "run-$[os]"), "run-linux");
        assert_eq!(subst_string(&vars, "$[$]HOME"), "$HOME");
        assert_eq!(subst_string(&vars, "$[undefined]"), "$[undefined]");
        assert_eq!(subst_string(&vars, "plain"), "plain");
    }

    #[test]
    fn expansion_cross_product() {
        let mut origin = BTreeMap::new();
        origin.insert(
            "test[os:linux,darwin][arch:amd64,arm64]".to_string(),
            Target {
                desc: "for $[os]/$[arch]".to_string(),
                watches: vec!["dist/$[os]/**".to_string()],
                script: "echo $[os]".to_string(),
                ..Target::default()
            },
        );
        let out = expand_targets(&origin).unwrap();
        let names: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            [
                "testdarwinamd64",
                "testdarwinarm64",
                "testlinuxamd64",
                "testlinuxarm64"
            ]
        );
        assert_eq!(out["testlinuxarm64"].desc, "for linux/arm64");
        assert_eq!(out["testlinuxarm64"].watches, ["dist/linux/**"]);
        // Body fields are carried verbatim, outside the substitution set.
        assert_eq!(out["testlinuxarm64"].script, "echo $[os]");
    }

    #[test]
    fn expansion_duplicate_is_error() {
        let mut origin = BTreeMap::new();
        origin.insert("t[v:a,a]".to_string(), Target::default());
        assert!(expand_targets(&origin).is_err());
    }

    #[test]
    fn wrapper_without_image_fails() {
        assert!(load_as_wrapper("#hmake-wrapper \nbody\n").is_err());
        assert!(load_as_wrapper("#hmake-wrapper").is_err());
    }

    #[test]
    fn wrapper_with_toolchain() {
        let f = load_as_wrapper("#hmake-wrapper golang:1.22 toolchain ARG=1\ngo build ./...\n")
            .unwrap()
            .unwrap();
        assert_eq!(f.name, WRAPPER_NAME);
        assert!(f.targets.contains_key("toolchain"));
        let build = &f.targets["build"];
        assert!(build.always);
        assert_eq!(build.after, ["toolchain"]);
        assert!(build.script.starts_with("#!/bin/sh\n"));
        assert_eq!(f.wrapper_target.as_deref(), Some("build"));
    }

    #[test]
    fn non_wrapper_passthrough() {
        assert!(load_as_wrapper("format: hypermake.v0\n").unwrap().is_none());
    }
}
