use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use hypermake::project::watch::build_watch_list;
use hypermake::project::Project;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn project(dir: &Path) -> Arc<Project> {
    Arc::new(Project::load_from(dir, "HyperMake").unwrap())
}

#[test]
fn collects_sorted_files_with_excludes() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  t:
    watches:
      - 'src/**'
      - '!src/tmp/**'
    cmds: [echo t]
"#,
    );
    write(dir.path(), "src/b.txt", "b");
    write(dir.path(), "src/a.txt", "a");
    write(dir.path(), "src/tmp/scratch.txt", "x");

    let p = project(dir.path());
    let wl = build_watch_list(&p, &p.targets["t"]);

    let paths: Vec<&str> = wl.0.iter().map(|i| i.path.as_str()).collect();
    assert_eq!(paths, ["src/a.txt", "src/b.txt"]);
}

#[test]
fn directories_expand_recursively() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  t:
    watches: [src]
    cmds: [echo t]
"#,
    );
    write(dir.path(), "src/one.txt", "1");
    write(dir.path(), "src/nested/two.txt", "2");

    let p = project(dir.path());
    let wl = build_watch_list(&p, &p.targets["t"]);

    let paths: Vec<&str> = wl.0.iter().map(|i| i.path.as_str()).collect();
    assert_eq!(paths, ["src/nested/two.txt", "src/one.txt"]);
}

#[test]
fn digest_is_stable_and_sensitive_to_changes() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  t:
    watches: ['src/**']
    cmds: [echo t]
"#,
    );
    write(dir.path(), "src/f.txt", "1");

    let p = project(dir.path());
    let d1 = build_watch_list(&p, &p.targets["t"]).digest();
    let d2 = build_watch_list(&p, &p.targets["t"]).digest();
    assert_eq!(d1, d2, "digest must be stable for unchanged state");

    // A new file changes the digest.
    write(dir.path(), "src/g.txt", "2");
    let d3 = build_watch_list(&p, &p.targets["t"]).digest();
    assert_ne!(d1, d3);
}

#[test]
fn watch_patterns_resolve_relative_to_defining_file() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  root-watch:
    watches: [data]
    cmds: [echo r]
includes: ['mod/*.hmake']
"#,
    );
    write(
        dir.path(),
        "mod/sub.hmake",
        r#"
format: hypermake.v0
targets:
  sub-watch:
    watches: [data]
    cmds: [echo s]
"#,
    );
    write(dir.path(), "data/root.txt", "r");
    write(dir.path(), "mod/data/sub.txt", "s");

    let p = project(dir.path());

    let root_paths: Vec<String> = build_watch_list(&p, &p.targets["root-watch"])
        .0
        .into_iter()
        .map(|i| i.path)
        .collect();
    assert_eq!(root_paths, ["data/root.txt"]);

    let sub_paths: Vec<String> = build_watch_list(&p, &p.targets["sub-watch"])
        .0
        .into_iter()
        .map(|i| i.path)
        .collect();
    assert_eq!(sub_paths, ["mod/data/sub.txt"]);
}

#[test]
fn work_area_is_never_watched() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  t:
    watches: ['**']
    cmds: [echo t]
"#,
    );
    write(dir.path(), "src/f.txt", "1");
    write(dir.path(), ".hmake/t.success", "stale");

    let p = project(dir.path());
    let wl = build_watch_list(&p, &p.targets["t"]);
    assert!(wl.0.iter().all(|i| !i.path.starts_with(".hmake")));
}
