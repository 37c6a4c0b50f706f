use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::mpsc;

use hypermake::driver::DriverRegistry;
use hypermake::plan::{ExecEvent, ExecPlan, TaskResult, TaskState};
use hypermake::project::Project;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// A project running everything through the shell driver: a -> b -> c.
fn chain_project(dir: &Path) -> Arc<Project> {
    write(
        dir,
        "HyperMake",
        r#"
format: hypermake.v0
name: chain
targets:
  a:
    watches: [srcfile]
    cmds: [echo a]
  b:
    after: [a]
    cmds: [echo b]
  c:
    after: [b]
    cmds: [echo c]
settings:
  exec-driver: shell
"#,
    );
    write(dir, "srcfile", "v1\n");
    Arc::new(Project::load_from(dir, "HyperMake").unwrap())
}

fn new_plan(project: &Arc<Project>) -> ExecPlan {
    ExecPlan::new(project.clone(), Arc::new(DriverRegistry::builtin()))
}

async fn run_plan(plan: &mut ExecPlan) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel(2);
    let res = plan.execute(rx).await;
    drop(tx);
    res
}

fn result_of(plan: &ExecPlan, name: &str) -> TaskResult {
    plan.task(name).unwrap().result
}

fn bump_mtime(path: &Path, secs_forward: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    let when = std::time::SystemTime::now() + Duration::from_secs(secs_forward);
    file.set_times(fs::FileTimes::new().set_modified(when))
        .unwrap();
}

#[tokio::test]
async fn linear_chain_runs_then_skips() {
    let dir = TempDir::new().unwrap();
    let project = chain_project(dir.path());

    let mut plan = new_plan(&project);
    plan.require(&["c".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "a"), TaskResult::Success);
    assert_eq!(result_of(&plan, "b"), TaskResult::Success);
    assert_eq!(result_of(&plan, "c"), TaskResult::Success);

    // Success marks exist now; an unchanged project skips everything.
    let mut plan = new_plan(&project);
    plan.require(&["c".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "a"), TaskResult::Skipped);
    assert_eq!(result_of(&plan, "b"), TaskResult::Skipped);
    assert_eq!(result_of(&plan, "c"), TaskResult::Skipped);

    let c = plan.task("c").unwrap();
    assert_eq!(c.start_time, c.finish_time);
    let summary = plan.summary();
    assert_eq!(summary.len(), 3);
    assert!(summary
        .iter()
        .all(|s| s.result.as_deref() == Some("Skipped")));
}

#[tokio::test]
async fn touched_watch_reruns_only_the_owner() {
    let dir = TempDir::new().unwrap();
    let project = chain_project(dir.path());

    let mut plan = new_plan(&project);
    plan.require(&["c".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();

    bump_mtime(&dir.path().join("srcfile"), 10);

    // Only a's watch digest changed; b and c have unchanged digests and do
    // not depend on the content of a.
    let mut plan = new_plan(&project);
    plan.require(&["c".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "a"), TaskResult::Success);
    assert_eq!(result_of(&plan, "b"), TaskResult::Skipped);
    assert_eq!(result_of(&plan, "c"), TaskResult::Skipped);
}

#[tokio::test]
async fn rebuild_override_invalidates_downstream() {
    let dir = TempDir::new().unwrap();
    let project = chain_project(dir.path());

    let mut plan = new_plan(&project);
    plan.require(&["c".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();

    let mut plan = new_plan(&project);
    plan.require(&["c".to_string()]).unwrap();
    plan.rebuild(&["b".to_string()]);
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "a"), TaskResult::Skipped);
    assert_eq!(result_of(&plan, "b"), TaskResult::Success);
    assert_eq!(result_of(&plan, "c"), TaskResult::Success);
}

#[tokio::test]
async fn skip_override_wins_over_always() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  t:
    always: true
    cmds: [echo t]
settings:
  exec-driver: shell
"#,
    );
    let project = Arc::new(Project::load_from(dir.path(), "HyperMake").unwrap());

    let mut plan = new_plan(&project);
    plan.require(&["t".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "t"), TaskResult::Success);

    // always=true reruns by default.
    let mut plan = new_plan(&project);
    plan.require(&["t".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "t"), TaskResult::Success);

    // ... but an explicit skip wins.
    let mut plan = new_plan(&project);
    plan.require(&["t".to_string()]).unwrap();
    plan.skip(&["t".to_string()]);
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "t"), TaskResult::Skipped);
}

#[tokio::test]
async fn transit_target_reruns_when_dependency_rebuilt() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  work:
    cmds: [echo w]
  all:
    after: [work]
settings:
  exec-driver: shell
"#,
    );
    let project = Arc::new(Project::load_from(dir.path(), "HyperMake").unwrap());

    let mut plan = new_plan(&project);
    plan.require(&["all".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "work"), TaskResult::Success);
    assert_eq!(result_of(&plan, "all"), TaskResult::Success);

    let mut plan = new_plan(&project);
    plan.require(&["all".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "all"), TaskResult::Skipped);

    // Forcing the dependency pulls the transit hub along with it.
    let mut plan = new_plan(&project);
    plan.require(&["all".to_string()]).unwrap();
    plan.rebuild(&["work".to_string()]);
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "work"), TaskResult::Success);
    assert_eq!(result_of(&plan, "all"), TaskResult::Success);
}

#[tokio::test]
async fn failure_blocks_dependents_and_reports_incomplete() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  bad:
    cmds: ["exit 3"]
  late:
    after: [bad]
    cmds: [echo nope]
settings:
  exec-driver: shell
"#,
    );
    let project = Arc::new(Project::load_from(dir.path(), "HyperMake").unwrap());

    let mut plan = new_plan(&project);
    plan.require(&["late".to_string()]).unwrap();
    let err = run_plan(&mut plan).await.unwrap_err().to_string();

    assert_eq!(result_of(&plan, "bad"), TaskResult::Failure);
    assert_eq!(plan.task("late").unwrap().state, TaskState::Waiting);
    assert!(err.contains("execution incomplete"), "got: {err}");
    assert!(err.contains("late"), "got: {err}");
}

#[tokio::test]
async fn events_are_emitted_once_per_task_in_order() {
    let dir = TempDir::new().unwrap();
    let project = chain_project(dir.path());

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let mut plan = new_plan(&project);
    plan.require(&["c".to_string()]).unwrap();
    plan.on_event(Box::new(move |event: &ExecEvent| {
        let line = match event {
            ExecEvent::TaskStart { target } => format!("start {target}"),
            ExecEvent::TaskFinish { target, .. } => format!("finish {target}"),
            ExecEvent::TaskActivated { target } => format!("activated {target}"),
            ExecEvent::TaskOutput { target, .. } => format!("output {target}"),
            _ => return,
        };
        sink.lock().unwrap().push(line);
    }));
    run_plan(&mut plan).await.unwrap();

    let events = events.lock().unwrap();
    for name in ["a", "b", "c"] {
        let starts = events
            .iter()
            .filter(|e| *e == &format!("start {name}"))
            .count();
        let finishes = events
            .iter()
            .filter(|e| *e == &format!("finish {name}"))
            .count();
        assert_eq!(starts, 1, "{name}: {events:?}");
        assert_eq!(finishes, 1, "{name}: {events:?}");

        // Start precedes output precedes finish for each task.
        let start_at = events.iter().position(|e| e == &format!("start {name}"));
        let finish_at = events.iter().position(|e| e == &format!("finish {name}"));
        assert!(start_at < finish_at, "{name}: {events:?}");
        if let Some(out_at) = events.iter().position(|e| e == &format!("output {name}")) {
            assert!(
                start_at < Some(out_at) && Some(out_at) < finish_at,
                "{events:?}"
            );
        }
    }

    // A finishing task activates its dependent before that one starts.
    let finish_a = events.iter().position(|e| e == "finish a").unwrap();
    let activated_b = events.iter().position(|e| e == "activated b").unwrap();
    let start_b = events.iter().position(|e| e == "start b").unwrap();
    assert!(finish_a < activated_b && activated_b < start_b, "{events:?}");
}

#[tokio::test]
async fn summary_file_is_written() {
    let dir = TempDir::new().unwrap();
    let project = chain_project(dir.path());

    let mut plan = new_plan(&project);
    plan.require(&["c".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();

    let loaded = hypermake::plan::summary::load_summary(&project.summary_file()).unwrap();
    assert_eq!(loaded.len(), 3);
    assert!(loaded.iter().any(|s| s.target == "a"));
    assert!(loaded.iter().all(|s| s.state == "Finished"));
}

#[tokio::test]
async fn dry_run_succeeds_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let project = chain_project(dir.path());

    let mut plan = new_plan(&project);
    plan.dry_run = true;
    plan.require(&["c".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();

    assert_eq!(result_of(&plan, "c"), TaskResult::Success);
    assert!(!project.work_path().exists());
}

#[tokio::test]
async fn cancel_aborts_running_task() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  slow:
    cmds: ["exec sleep 60"]
settings:
  exec-driver: shell
"#,
    );
    let project = Arc::new(Project::load_from(dir.path(), "HyperMake").unwrap());

    let mut plan = new_plan(&project);
    plan.require(&["slow".to_string()]).unwrap();

    let (tx, rx) = mpsc::channel(2);
    let trigger = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = trigger.send(2).await;
    });

    let started = Instant::now();
    let err = plan.execute(rx).await.unwrap_err().to_string();
    drop(tx);

    assert!(started.elapsed() < Duration::from_secs(30), "took too long");
    assert!(err.contains("aborted"), "got: {err}");
    assert_eq!(result_of(&plan, "slow"), TaskResult::Aborted);
}

#[tokio::test]
async fn second_cancel_abandons_immediately() {
    let dir = TempDir::new().unwrap();
    // The script traps INT/TERM so the first signal does not end it.
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  stubborn:
    script: |
      #!/bin/sh
      trap '' INT TERM
      sleep 60
settings:
  exec-driver: shell
"#,
    );
    let project = Arc::new(Project::load_from(dir.path(), "HyperMake").unwrap());

    let mut plan = new_plan(&project);
    plan.require(&["stubborn".to_string()]).unwrap();

    let (tx, rx) = mpsc::channel(2);
    let trigger = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = trigger.send(2).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = trigger.send(2).await;
    });

    let started = Instant::now();
    let err = plan.execute(rx).await.unwrap_err().to_string();
    drop(tx);

    assert!(
        started.elapsed() < Duration::from_secs(20),
        "abandon did not return promptly"
    );
    assert!(err.contains("abandoned"), "got: {err}");
    let task = plan.task("stubborn").unwrap();
    assert_eq!(task.state, TaskState::Abandoned);
    assert_eq!(task.result, TaskResult::Aborted);
}

#[tokio::test]
async fn artifacts_must_exist_after_success() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: demo
targets:
  produce:
    cmds: ["touch out.bin"]
    artifacts: [out.bin]
  claim:
    cmds: ["true"]
    artifacts: [missing.bin]
settings:
  exec-driver: shell
"#,
    );
    let project = Arc::new(Project::load_from(dir.path(), "HyperMake").unwrap());

    let mut plan = new_plan(&project);
    plan.require(&["produce".to_string()]).unwrap();
    run_plan(&mut plan).await.unwrap();
    assert_eq!(result_of(&plan, "produce"), TaskResult::Success);

    let mut plan = new_plan(&project);
    plan.require(&["claim".to_string()]).unwrap();
    let err = run_plan(&mut plan).await.unwrap_err().to_string();
    assert_eq!(result_of(&plan, "claim"), TaskResult::Failure);
    assert!(err.contains("artifacts missing"), "got: {err}");
}

#[tokio::test]
async fn unknown_required_target_is_rejected() {
    let dir = TempDir::new().unwrap();
    let project = chain_project(dir.path());
    let mut plan = new_plan(&project);
    let err = plan
        .require(&["ghost".to_string()])
        .unwrap_err()
        .to_string();
    assert!(err.contains("ghost"), "got: {err}");
}

#[tokio::test]
async fn parallel_diamond_respects_dependencies() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "HyperMake",
        r#"
format: hypermake.v0
name: diamond
targets:
  root:
    cmds: [echo root]
  left:
    after: [root]
    cmds: [echo left]
  right:
    after: [root]
    cmds: [echo right]
  join:
    after: [left, right]
    cmds: [echo join]
settings:
  exec-driver: shell
"#,
    );
    let project = Arc::new(Project::load_from(dir.path(), "HyperMake").unwrap());

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let mut plan = new_plan(&project);
    plan.max_concurrency = 2;
    plan.require(&["join".to_string()]).unwrap();
    plan.on_event(Box::new(move |event: &ExecEvent| {
        match event {
            ExecEvent::TaskStart { target } => sink.lock().unwrap().push(format!("start {target}")),
            ExecEvent::TaskFinish { target, .. } => {
                sink.lock().unwrap().push(format!("finish {target}"))
            }
            _ => {}
        };
    }));
    run_plan(&mut plan).await.unwrap();

    for name in ["root", "left", "right", "join"] {
        assert_eq!(result_of(&plan, name), TaskResult::Success);
    }

    let events = events.lock().unwrap();
    let pos = |e: &str| events.iter().position(|x| x == e).unwrap();
    // No task starts before all of its dependencies finished.
    assert!(pos("finish root") < pos("start left"));
    assert!(pos("finish root") < pos("start right"));
    assert!(pos("finish left") < pos("start join"));
    assert!(pos("finish right") < pos("start join"));
}
