use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use hypermake::driver::{DriverRegistry, Runner as _};
use hypermake::plan::task::TaskContext;
use hypermake::project::Project;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn manifest_with_targets(targets_yaml: &str) -> String {
    format!("format: hypermake.v0\nname: sig\ntargets:\n{targets_yaml}")
}

fn signature_of(dir: &Path, target: &str, env: &BTreeMap<String, String>) -> String {
    let project = Arc::new(Project::load_from(dir, "HyperMake").unwrap());
    let ctx = Arc::new(TaskContext::detached(
        &project.targets[target].clone(),
        project.clone(),
        env,
        &project.work_path(),
    ));
    let registry = DriverRegistry::builtin();
    let runner = registry.create(ctx).unwrap();
    runner.signature()
}

#[test]
fn signature_ignores_ambient_hmake_env() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        &manifest_with_targets(
            r#"  t:
    image: 'busybox:1'
    env:
      - A=1
    cmds: [echo t]
"#,
        ),
    );

    let sig_plain = signature_of(dir.path(), "t", &BTreeMap::new());

    let mut env = BTreeMap::new();
    env.insert("HMAKE_VERSION".to_string(), "9.9.9".to_string());
    env.insert("HMAKE_LAUNCH_PATH".to_string(), "deep/down".to_string());
    let sig_ambient = signature_of(dir.path(), "t", &env);

    assert_eq!(sig_plain, sig_ambient);
}

#[test]
fn signature_changes_with_driver_config() {
    let dir1 = TempDir::new().unwrap();
    write(
        dir1.path(),
        "HyperMake",
        &manifest_with_targets(
            r#"  t:
    image: 'busybox:1'
    cmds: [echo t]
"#,
        ),
    );
    let dir2 = TempDir::new().unwrap();
    write(
        dir2.path(),
        "HyperMake",
        &manifest_with_targets(
            r#"  t:
    image: 'busybox:2'
    cmds: [echo t]
"#,
        ),
    );

    let sig1 = signature_of(dir1.path(), "t", &BTreeMap::new());
    let sig2 = signature_of(dir2.path(), "t", &BTreeMap::new());
    assert_ne!(sig1, sig2);
}

#[test]
fn signature_is_order_insensitive_for_listed_fields() {
    let dir1 = TempDir::new().unwrap();
    write(
        dir1.path(),
        "HyperMake",
        &manifest_with_targets(
            r#"  t:
    image: 'busybox:1'
    commit: ['img:b', 'img:a']
    cap-add: [NET_ADMIN, SYS_TIME]
    cmds: [echo t]
"#,
        ),
    );
    let dir2 = TempDir::new().unwrap();
    write(
        dir2.path(),
        "HyperMake",
        &manifest_with_targets(
            r#"  t:
    image: 'busybox:1'
    commit: ['img:a', 'img:b']
    cap-add: [SYS_TIME, NET_ADMIN]
    cmds: [echo t]
"#,
        ),
    );

    let sig1 = signature_of(dir1.path(), "t", &BTreeMap::new());
    let sig2 = signature_of(dir2.path(), "t", &BTreeMap::new());
    assert_eq!(sig1, sig2);
}

#[test]
fn signature_includes_the_script() {
    let dir1 = TempDir::new().unwrap();
    write(
        dir1.path(),
        "HyperMake",
        &manifest_with_targets(
            r#"  t:
    image: 'busybox:1'
    cmds: [echo one]
"#,
        ),
    );
    let dir2 = TempDir::new().unwrap();
    write(
        dir2.path(),
        "HyperMake",
        &manifest_with_targets(
            r#"  t:
    image: 'busybox:1'
    cmds: [echo two]
"#,
        ),
    );

    let sig1 = signature_of(dir1.path(), "t", &BTreeMap::new());
    let sig2 = signature_of(dir2.path(), "t", &BTreeMap::new());
    assert_ne!(sig1, sig2);
}

#[test]
fn missing_image_is_rejected_by_the_docker_driver() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        &manifest_with_targets(
            r#"  t:
    cmds: [echo t]
"#,
        ),
    );
    let project = Arc::new(Project::load_from(dir.path(), "HyperMake").unwrap());
    let ctx = Arc::new(TaskContext::detached(
        &project.targets["t"].clone(),
        project.clone(),
        &BTreeMap::new(),
        &project.work_path(),
    ));
    let err = DriverRegistry::builtin()
        .create(ctx)
        .err()
        .expect("must fail")
        .to_string();
    assert!(err.contains("missing property image"), "got: {err}");
}
