// src/project/watch.rs

//! Watch-lists: the file set a target is sensitive to.
//!
//! Each pattern in `watches` resolves relative to the target's source file;
//! `!`-prefixed patterns form the exclude set. Matched directories expand to
//! every file underneath. The sorted `"<path> <unix-seconds>"` text form is
//! hashed with SHA-1 into the skip digest.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::UNIX_EPOCH;

use sha1::{Digest, Sha1};
use tracing::debug;
use walkdir::WalkDir;

use crate::project::model::Target;
use crate::project::Project;

/// One watched file: project-relative path plus modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchItem {
    pub path: String,
    pub mod_time: i64,
}

/// Ordered (by path) list of watched items.
#[derive(Debug, Clone, Default)]
pub struct WatchList(pub Vec<WatchItem>);

impl WatchList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Line-oriented text form: `"<path> <unix-seconds>\n"` per item.
    pub fn text(&self) -> String {
        let mut s = String::new();
        for item in &self.0 {
            let _ = writeln!(s, "{} {}", item.path, item.mod_time);
        }
        s
    }

    /// SHA-1 hex digest of the text form. Stable across calls as long as the
    /// filesystem state is unchanged.
    pub fn digest(&self) -> String {
        sha1_hex(self.text().as_bytes())
    }
}

/// SHA-1 of `data` as lowercase hex.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut h = Sha1::new();
    h.update(data);
    hex::encode(h.finalize())
}

/// Collect the current state of everything `target` watches.
pub fn build_watch_list(project: &Project, target: &Target) -> WatchList {
    let mut files: BTreeMap<String, WatchItem> = BTreeMap::new();
    let mut excludes: BTreeMap<String, WatchItem> = BTreeMap::new();

    for pattern in &target.watches {
        let (dict, pattern) = match pattern.strip_prefix('!') {
            Some(rest) => (&mut excludes, rest),
            None => (&mut files, pattern.as_str()),
        };
        let rooted = target.project_path(pattern);
        let paths = match project.glob(&rooted) {
            Ok(paths) => paths,
            Err(err) => {
                debug!(target = %target.name, pattern = %rooted, error = %err, "watch glob failed");
                continue;
            }
        };
        for path in paths {
            let full = project.base_dir.join(&path);
            let Ok(meta) = std::fs::metadata(&full) else {
                continue;
            };
            if meta.is_dir() {
                // Expand to every file underneath.
                for entry in WalkDir::new(&full).into_iter().flatten() {
                    if entry.file_type().is_dir() {
                        continue;
                    }
                    let rel = entry
                        .path()
                        .strip_prefix(&project.base_dir)
                        .map(crate::project::model::to_slash)
                        .unwrap_or_default();
                    if rel.is_empty() {
                        continue;
                    }
                    if let Ok(m) = entry.metadata() {
                        dict.insert(
                            rel.clone(),
                            WatchItem {
                                path: rel,
                                mod_time: mod_time_unix(&m),
                            },
                        );
                    }
                }
            } else {
                dict.insert(
                    path.clone(),
                    WatchItem {
                        path,
                        mod_time: mod_time_unix(&meta),
                    },
                );
            }
        }
    }

    for path in excludes.keys() {
        files.remove(path);
    }

    // BTreeMap iteration already yields ascending path order.
    WatchList(files.into_values().collect())
}

fn mod_time_unix(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_text_and_digest() {
        let wl = WatchList::default();
        assert!(wl.is_empty());
        assert_eq!(wl.text(), "");
        // SHA-1 of the empty string.
        assert_eq!(wl.digest(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn text_form_is_line_oriented() {
        let wl = WatchList(vec![
            WatchItem {
                path: "a.txt".to_string(),
                mod_time: 10,
            },
            WatchItem {
                path: "b/c.txt".to_string(),
                mod_time: 20,
            },
        ]);
        assert_eq!(wl.text(), "a.txt 10\nb/c.txt 20\n");
        assert_eq!(wl.digest(), wl.digest());
    }
}
