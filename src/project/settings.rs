// src/project/settings.rs

//! The schema-less settings tree.
//!
//! Settings are YAML mappings merged from multiple files plus flat-key
//! overrides from the command line. Drivers project sections of the tree onto
//! their own config structs with [`Settings::section_as`]; unknown fields are
//! tolerated.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// A string-keyed tree of YAML values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings(pub Mapping);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(&Value::String(key.to_string()))
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(Value::String(key.to_string()), value);
    }

    /// Deep-merge `other` into `self`: mappings merge recursively, any other
    /// value replaces the existing one. Later files override earlier ones at
    /// leaf values.
    pub fn merge(&mut self, other: &Settings) {
        merge_mapping(&mut self.0, &other.0);
    }

    /// Merge a flat key/value map where keys may be dot-separated paths
    /// (`a.b.c`). A mapping value merges into an existing sub-tree; any other
    /// value replaces it. List values are replaced wholesale, never appended.
    pub fn merge_flat(&mut self, flat: &BTreeMap<String, Value>) {
        for (key, val) in flat {
            let paths: Vec<&str> = key.split('.').collect();
            let mut dict = &mut self.0;
            for (n, path) in paths.iter().enumerate() {
                let k = Value::String(path.to_string());
                if n + 1 == paths.len() {
                    let merged = match (val, dict.get_mut(&k)) {
                        (Value::Mapping(vm), Some(Value::Mapping(existing))) => {
                            merge_mapping(existing, vm);
                            true
                        }
                        _ => false,
                    };
                    if !merged {
                        dict.insert(k, val.clone());
                    }
                } else {
                    if !matches!(dict.get(&k), Some(Value::Mapping(_))) {
                        dict.insert(k.clone(), Value::Mapping(Mapping::new()));
                    }
                    dict = match dict.get_mut(&k) {
                        Some(Value::Mapping(m)) => m,
                        _ => unreachable!(),
                    };
                }
            }
        }
    }

    /// Project the whole tree onto `T`.
    pub fn as_type<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.0.is_empty() {
            return Ok(T::default());
        }
        serde_yaml::from_value(Value::Mapping(self.0.clone()))
            .context("mapping settings onto typed view")
    }

    /// Project the section at `key` onto `T`; absent sections yield the
    /// default.
    pub fn section_as<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(v) => serde_yaml::from_value(v.clone())
                .with_context(|| format!("mapping settings section '{key}' onto typed view")),
        }
    }

    /// The section at `key` as a [`Settings`] layer, empty when absent or not
    /// a mapping.
    pub fn section(&self, key: &str) -> Settings {
        match self.get(key) {
            Some(Value::Mapping(m)) => Settings(m.clone()),
            _ => Settings::new(),
        }
    }
}

impl From<Mapping> for Settings {
    fn from(m: Mapping) -> Self {
        Settings(m)
    }
}

/// Overlay `src` onto `dst`: mappings merge recursively, anything else
/// replaces.
pub fn merge_value(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Mapping(d), Value::Mapping(s)) => merge_mapping(d, s),
        (d, s) => *d = s.clone(),
    }
}

fn merge_mapping(dst: &mut Mapping, src: &Mapping) {
    for (key, val) in src {
        match (dst.get_mut(key), val) {
            (Some(Value::Mapping(d)), Value::Mapping(s)) => merge_mapping(d, s),
            _ => {
                dst.insert(key.clone(), val.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(yaml: &str) -> Settings {
        Settings(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn deep_merge_overrides_leaves_and_merges_maps() {
        let mut a = settings("docker:\n  image: base\n  net: host\ntop: 1\n");
        let b = settings("docker:\n  image: other\nextra: true\n");
        a.merge(&b);

        let docker = a.section("docker");
        assert_eq!(docker.get("image").unwrap().as_str(), Some("other"));
        assert_eq!(docker.get("net").unwrap().as_str(), Some("host"));
        assert_eq!(a.get("top").unwrap().as_i64(), Some(1));
        assert_eq!(a.get("extra").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn merge_is_associative_on_leaves() {
        let a = settings("x:\n  p: 1\n");
        let b = settings("x:\n  p: 2\n  q: 2\n");
        let c = settings("x:\n  q: 3\n");

        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);

        assert_eq!(
            serde_yaml::to_string(&left.0).unwrap(),
            serde_yaml::to_string(&right.0).unwrap()
        );
    }

    #[test]
    fn flat_merge_creates_intermediate_nodes() {
        let mut s = Settings::new();
        let mut flat = BTreeMap::new();
        flat.insert("docker.image".to_string(), Value::String("busybox".into()));
        flat.insert("p".to_string(), Value::Bool(true));
        s.merge_flat(&flat);

        assert_eq!(
            s.section("docker").get("image").unwrap().as_str(),
            Some("busybox")
        );
        assert_eq!(s.get("p").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn flat_merge_replaces_list_values() {
        let mut s = settings("docker:\n  env:\n    - A=1\n");
        let mut flat = BTreeMap::new();
        flat.insert(
            "docker.env".to_string(),
            serde_yaml::from_str("[\"B=2\"]").unwrap(),
        );
        s.merge_flat(&flat);

        let env = s.section("docker");
        let list = env.get("env").unwrap().as_sequence().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].as_str(), Some("B=2"));
    }
}
