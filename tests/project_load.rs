use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tempfile::TempDir;

use hypermake::project::Project;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn loads_root_and_includes() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  build:
    description: build it
    cmds:
      - echo build
includes:
  - 'mod/**/*.hmake'
settings:
  exec-driver: shell
"#,
    );
    write(
        dir.path(),
        "mod/extra.hmake",
        r#"
format: hypermake.v0
targets:
  test:
    after:
      - build
    cmds:
      - echo test
"#,
    );

    let p = Project::load_from(dir.path(), "HyperMake").unwrap();
    assert_eq!(p.name, "demo");
    assert_eq!(p.files.len(), 2);
    assert!(p.targets.contains_key("build"));
    assert_eq!(p.targets["test"].source, "mod/extra.hmake");
    assert!(p.graph.depends_of("test").contains("build"));
    assert!(p.graph.activates_of("build").contains("test"));
}

#[test]
fn rejects_unsupported_format() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "HyperMake", "format: hypermake.v9\nname: x\n");
    let err = Project::load_from(dir.path(), "HyperMake")
        .unwrap_err()
        .to_string();
    assert!(err.contains("unsupported format"), "got: {err}");
}

#[test]
fn rejects_illegal_target_name() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        "format: hypermake.v0\nname: x\ntargets:\n  9bad:\n    cmds: []\n",
    );
    let err = Project::load_from(dir.path(), "HyperMake")
        .unwrap_err()
        .to_string();
    assert!(err.contains("illegal target name"), "got: {err}");
}

#[test]
fn duplicate_target_across_files_names_both_sources() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  t:
    cmds: [echo root]
includes: ['sub/*.hmake']
"#,
    );
    write(
        dir.path(),
        "sub/dup.hmake",
        "format: hypermake.v0\ntargets:\n  t:\n    cmds: [echo dup]\n",
    );
    let err = Project::load_from(dir.path(), "HyperMake")
        .unwrap_err()
        .to_string();
    assert!(err.contains("duplicated target t"), "got: {err}");
    assert!(err.contains("HyperMake"), "got: {err}");
    assert!(err.contains("sub/dup.hmake"), "got: {err}");
}

#[test]
fn cycle_is_rejected_naming_both_targets() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  t1:
    after: [t2]
    cmds: [echo 1]
  t2:
    after: [t1]
    cmds: [echo 2]
"#,
    );
    let err = Project::load_from(dir.path(), "HyperMake")
        .unwrap_err()
        .to_string();
    assert!(err.contains("cyclic"), "got: {err}");
    assert!(err.contains("t1"), "got: {err}");
    assert!(err.contains("t2"), "got: {err}");
}

#[test]
fn wrapper_mode_synthesizes_build_target() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        "#hmake-wrapper golang:1.22\ngo build ./...\n",
    );
    let p = Project::load_from(dir.path(), "HyperMake").unwrap();
    assert_eq!(p.name, "wrapper");
    let build = &p.targets["build"];
    assert!(build.always);
    assert_eq!(build.ext_str("image"), Some("golang:1.22"));
    assert!(build.script.contains("go build"));
    assert_eq!(p.wrapper_target().unwrap().name, "build");

    let common = p.common_settings().unwrap();
    assert_eq!(common.default_targets, ["build"]);
    assert_eq!(common.exec_target, "build");
}

#[test]
fn wrapper_mode_with_toolchain_dir() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        "#hmake-wrapper my/tool:1 support/docker\n",
    );
    let p = Project::load_from(dir.path(), "HyperMake").unwrap();
    let toolchain = &p.targets["toolchain"];
    assert_eq!(toolchain.ext_str("build"), Some("support/docker"));
    assert_eq!(toolchain.watches, ["support/docker"]);
    assert!(p.graph.depends_of("build").contains("toolchain"));
}

#[test]
fn rc_files_overlay_outermost_first() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  t:
    cmds: [echo t]
settings:
  prop:
    from: root
"#,
    );
    write(
        dir.path(),
        ".hmakerc",
        "format: hypermake.v0\nsettings:\n  prop:\n    from: outer\n    outer: 'yes'\n",
    );
    write(
        dir.path(),
        "sub/.hmakerc",
        "format: hypermake.v0\nsettings:\n  prop:\n    from: inner\n",
    );

    let p = Project::load_from(&dir.path().join("sub"), "HyperMake").unwrap();
    assert_eq!(p.launch_path, "sub");

    let prop: BTreeMap<String, String> = p.settings_as("prop").unwrap();
    assert_eq!(prop["from"], "inner");
    assert_eq!(prop["outer"], "yes");
}

#[test]
fn local_settings_apply_only_to_defining_file() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  root-t:
    cmds: [echo r]
settings:
  docker:
    image: 'base:1'
    net: host
includes: ['sub/*.hmake']
"#,
    );
    write(
        dir.path(),
        "sub/inner.hmake",
        r#"
format: hypermake.v0
targets:
  sub-t:
    cmds: [echo s]
local:
  docker:
    image: 'override:2'
"#,
    );

    let p = Project::load_from(dir.path(), "HyperMake").unwrap();

    let root_view: BTreeMap<String, String> = p
        .target_settings_as(&p.targets["root-t"], "docker")
        .unwrap();
    assert_eq!(root_view["image"], "base:1");

    let sub_view: BTreeMap<String, String> = p
        .target_settings_as(&p.targets["sub-t"], "docker")
        .unwrap();
    assert_eq!(sub_view["image"], "override:2");
    // Non-overridden keys still come from the project settings.
    assert_eq!(sub_view["net"], "host");
}

#[test]
fn target_name_expansion_in_manifest() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  'pack-[os:linux,darwin]':
    description: 'package for $[os]'
    workdir: 'build/$[os]'
    watches:
      - 'dist/$[os]/**'
    cmds:
      - 'echo $[os]'
"#,
    );
    let p = Project::load_from(dir.path(), "HyperMake").unwrap();
    assert!(p.targets.contains_key("pack-linux"));
    assert!(p.targets.contains_key("pack-darwin"));

    let darwin = &p.targets["pack-darwin"];
    assert_eq!(darwin.desc, "package for darwin");
    assert_eq!(darwin.workdir, "build/darwin");
    assert_eq!(darwin.watches, ["dist/darwin/**"]);
    // cmds sit outside the expansion substitution set and are kept verbatim.
    assert_eq!(darwin.cmds[0].shell(), Some("echo $[os]"));
}

#[test]
fn flat_properties_override_settings() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  t:
    cmds: [echo t]
settings:
  docker:
    image: 'a:1'
"#,
    );
    let mut p = Project::load_from(dir.path(), "HyperMake").unwrap();
    let mut flat = BTreeMap::new();
    flat.insert(
        "docker.image".to_string(),
        serde_yaml::Value::String("b:2".to_string()),
    );
    p.merge_settings_flat(&flat);

    let view: BTreeMap<String, String> = p.settings_as("docker").unwrap();
    assert_eq!(view["image"], "b:2");
}

#[test]
fn target_name_patterns_resolve_from_cli() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  test-unit:
    cmds: [echo u]
  test-e2e:
    cmds: [echo e]
  build:
    cmds: [echo b]
"#,
    );
    let p = Project::load_from(dir.path(), "HyperMake").unwrap();

    assert_eq!(p.target_names_match("build").unwrap(), ["build"]);
    assert_eq!(
        p.target_names_match("test-*").unwrap(),
        ["test-e2e", "test-unit"]
    );
    assert_eq!(p.target_names_match("/e2e$/").unwrap(), ["test-e2e"]);
}
