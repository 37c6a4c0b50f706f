// src/driver/docker.rs

//! The docker exec-driver.
//!
//! Translates a target's config into a create/start/remove container
//! lifecycle: optional image build, two-phase create + start with the
//! container id written through `--cidfile`, non-root identity with an
//! on-the-fly `/etc/passwd` patch, optional commit/push, and an
//! unconditional remove at the end. A `compose` config instead brings
//! services up in the background and reports `Started`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::driver::shell::{send_signal, Executor};
use crate::driver::{ids, Runner, SignalReceiver};
use crate::errors::HmakeError;
use crate::plan::task::{TaskContext, TaskResult};
use crate::project::model::to_slash;
use crate::project::watch::sha1_hex;
use crate::project::WORK_FOLDER;

pub const DRIVER_NAME: &str = "docker";
/// Default mount point of the project inside the container.
pub const DEFAULT_SRC_VOLUME: &str = "/src";
/// Settings section consulted for driver config.
pub const SETTING_NAME: &str = "docker";

const DOCKERFILE: &str = "Dockerfile";
const SIGINT: i32 = 2;
const SIGTERM: i32 = 15;

/// docker-compose parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ComposeConfig {
    pub file: String,
    pub project_name: String,
    pub services: Vec<String>,
    pub deps: Option<bool>,
    /// `false` maps to `--no-recreate`, the string `force` to
    /// `--force-recreate`.
    pub recreate: Option<Value>,
    pub build: Option<bool>,
    pub remove_orphans: bool,
}

/// The `compose` key accepts either a file path or a full config mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComposeValue {
    File(String),
    Config(ComposeConfig),
}

/// Driver view of the target config: settings section `docker` overlaid with
/// the target's extension bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DockerConfig {
    pub build: String,
    pub build_from: String,
    pub build_args: Vec<String>,
    #[serde(rename = "commit")]
    pub commits: Vec<String>,
    pub push: Vec<String>,
    pub tags: Vec<String>,
    pub labels: Vec<String>,
    pub label_files: Vec<String>,
    pub force_rm: bool,
    pub pull: bool,
    pub cache: Option<bool>,
    pub content_trust: Option<bool>,
    pub image: String,
    pub src_volume: String,
    pub expose_docker: bool,
    pub env: Vec<String>,
    pub env_files: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub devices: Vec<String>,
    pub privileged: bool,
    #[serde(rename = "net")]
    pub network: String,
    pub ports: Vec<String>,
    pub hosts: Vec<String>,
    #[serde(rename = "dns")]
    pub dns_servers: Vec<String>,
    pub dns_search: String,
    pub dns_opts: Vec<String>,
    pub link: Vec<String>,
    pub user: String,
    pub groups: Vec<String>,
    pub volumes: Vec<String>,
    pub blkio_weight: Option<i64>,
    #[serde(rename = "blkio-weight-devices")]
    pub blkio_weight_devs: Vec<String>,
    pub device_read_bps: Vec<String>,
    pub device_write_bps: Vec<String>,
    pub device_read_iops: Vec<String>,
    pub device_write_iops: Vec<String>,
    pub cpu_shares: Option<i64>,
    pub cpu_period: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
    pub kernel_memory: String,
    pub memory: String,
    pub memory_swap: String,
    pub memory_reservation: String,
    pub memory_swappiness: Option<i64>,
    pub shm_size: String,
    pub ulimit: Vec<String>,
    pub compose: Option<ComposeValue>,
    pub no_passwd_patch: bool,
}

pub struct DockerRunner {
    ctx: Arc<TaskContext>,
    config: DockerConfig,
    compose: Option<ComposeConfig>,
    compose_dir: String,
    compose_args: Vec<String>,
    /// Host path mounted as the source volume; remapped in nested execution.
    project_dir: PathBuf,
}

pub fn factory(ctx: Arc<TaskContext>) -> Result<Box<dyn Runner>> {
    let mut config: DockerConfig = ctx
        .project
        .target_settings_with_ext(&ctx.target, SETTING_NAME)?;

    let compose = match &config.compose {
        Some(ComposeValue::File(f)) => Some(ComposeConfig {
            file: f.clone(),
            ..ComposeConfig::default()
        }),
        Some(ComposeValue::Config(c)) => Some(c.clone()),
        None => None,
    };

    if config.image.is_empty() && compose.is_none() {
        bail!(HmakeError::MissingProperty {
            target: ctx.name.clone(),
            property: "image".to_string(),
        });
    }

    if config.src_volume.is_empty() {
        config.src_volume = DEFAULT_SRC_VOLUME.to_string();
    }
    if config.expose_docker {
        expose_docker(&mut config, &ctx);
    }

    for (name, value) in &ctx.env {
        add_env(&mut config.env, &format!("{name}={value}"));
    }
    add_env(
        &mut config.env,
        &format!("HMAKE_PROJECT_DIR={}", config.src_volume),
    );
    let master_base = Path::new(&ctx.project.master_file.source)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    add_env(
        &mut config.env,
        &format!("HMAKE_PROJECT_FILE={}/{master_base}", config.src_volume),
    );
    add_env(
        &mut config.env,
        &format!("HMAKE_WORK_DIR={}/{WORK_FOLDER}", config.src_volume),
    );

    // In nested execution the project dir seen here is a container path;
    // remap it onto the host path of the outer mount.
    let mut project_dir = ctx.project.base_dir.clone();
    if let (Ok(vol_host), Ok(vol_cntr)) = (
        std::env::var("HMAKE_DOCKER_VOL_HOST"),
        std::env::var("HMAKE_DOCKER_VOL_CNTR"),
    ) {
        if !vol_host.is_empty() && !vol_cntr.is_empty() {
            let prefix = format!("{}/", vol_cntr.trim_end_matches('/'));
            let dir = to_slash(&project_dir);
            if let Some(rest) = dir.strip_prefix(&prefix) {
                project_dir = Path::new(&vol_host).join(rest);
            }
        }
    }

    let mut runner = DockerRunner {
        ctx,
        config,
        compose,
        compose_dir: String::new(),
        compose_args: Vec::new(),
        project_dir,
    };
    add_env(
        &mut runner.config.env,
        &format!(
            "HMAKE_DOCKER_VOL_HOST={}",
            canonical_mount_path(&runner.project_dir)
        ),
    );
    let cntr = format!("HMAKE_DOCKER_VOL_CNTR={}", runner.config.src_volume);
    add_env(&mut runner.config.env, &cntr);

    if runner.compose.is_some() {
        runner.parse_compose()?;
    }
    Ok(Box::new(runner))
}

impl Runner for DockerRunner {
    fn run(&self, mut cancel: SignalReceiver) -> BoxFuture<'_, Result<TaskResult>> {
        Box::pin(async move {
            let mut result = TaskResult::Success;

            if let Some(compose) = &self.compose {
                self.compose_up(compose, &mut cancel).await?;
                result = TaskResult::Started;
            }

            if !self.config.image.is_empty() {
                let _ = std::fs::remove_file(self.ctx.cid_file());
                let run_res = self.run_image(&mut cancel).await;
                self.remove_container().await;
                run_res?;
            }

            Ok(result)
        })
    }

    fn signature(&self) -> String {
        let val = match serde_yaml::to_value(&self.config) {
            Ok(v) => v,
            Err(_) => return String::new(),
        };
        let Value::Mapping(map) = val else {
            return String::new();
        };
        let mut dict: BTreeMap<String, Value> = map
            .into_iter()
            .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
            .collect();

        for key in [
            "commit",
            "push",
            "tags",
            "labels",
            "label-files",
            "cap-add",
            "cap-drop",
            "devices",
        ] {
            if let Some(Value::Sequence(seq)) = dict.get_mut(key) {
                seq.sort_by_key(|v| fmt_value(v));
            }
        }
        // Ambient HMAKE_* variables change between runs and must not
        // invalidate the cache.
        if let Some(Value::Sequence(seq)) = dict.get_mut("env") {
            seq.retain(|v| !matches!(v.as_str(), Some(s) if s.starts_with("HMAKE_")));
            seq.sort_by_key(|v| fmt_value(v));
        }

        let mut text = String::new();
        for (key, value) in &dict {
            text.push_str(key);
            text.push('=');
            text.push_str(&fmt_value(value));
            text.push('\n');
        }
        text.push_str(&self.ctx.build_script());
        sha1_hex(text.as_bytes())
    }

    fn validate_artifacts(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut images: Vec<String> = Vec::new();
            if !self.config.build.is_empty() || !self.config.build_from.is_empty() {
                images.push(self.config.image.clone());
                images.extend(self.config.tags.iter().cloned());
            }
            images.extend(self.config.commits.iter().cloned());

            for image in images {
                let args = ["inspect", "-f", "{{.Id}}", image.as_str()].map(String::from);
                match self.docker(&args).await {
                    Ok(()) => debug!(task = %self.ctx.name, image = %image, "artifact ok"),
                    Err(err) => {
                        warn!(task = %self.ctx.name, image = %image, error = %err, "artifact invalid");
                        return false;
                    }
                }
            }
            true
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.compose.is_some() {
                self.compose_exec(&["down".to_string()], None).await?;
            }
            Ok(())
        })
    }
}

impl DockerRunner {
    fn cid(&self) -> String {
        std::fs::read_to_string(self.ctx.cid_file())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    /// Run a muted docker command, failing on non-zero exit.
    async fn docker(&self, args: &[String]) -> Result<()> {
        let status = Executor::new(&self.ctx, "docker", args)
            .host_env()
            .mute()
            .run(None)
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("docker {} failed: {status}", args.join(" ")))
        }
    }

    /// Run docker with output teed to the task log and event stream.
    async fn docker_teed(
        &self,
        args: Vec<String>,
        cancel: &mut SignalReceiver,
    ) -> Result<std::process::ExitStatus> {
        Executor::new(&self.ctx, "docker", &args)
            .host_env()
            .run(Some(cancel))
            .await
    }

    async fn run_image(&self, cancel: &mut SignalReceiver) -> Result<()> {
        if self.ctx.target.exec {
            return self.run_container(cancel).await;
        }
        if !self.config.build.is_empty() {
            self.build(cancel).await?;
        }
        self.run_container(cancel).await?;
        if !self.config.commits.is_empty() {
            self.commit(cancel).await?;
        }
        if !self.config.push.is_empty() {
            self.push(cancel).await?;
        }
        Ok(())
    }

    fn abs_in_workdir(&self, rel: &str) -> PathBuf {
        self.ctx.working_dir().join(rel)
    }

    async fn build(&self, cancel: &mut SignalReceiver) -> Result<()> {
        let mut args: Vec<String> =
            vec!["build".into(), "-t".into(), self.config.image.clone()];
        for arg in &self.config.build_args {
            args.push("--build-arg".into());
            args.push(arg.clone());
        }
        for tag in &self.config.tags {
            args.push("-t".into());
            args.push(tag.clone());
        }
        if self.config.force_rm {
            args.push("--force-rm".into());
        }
        if self.config.pull {
            args.push("--pull".into());
        }
        if self.config.cache == Some(false) {
            args.push("--no-cache".into());
        }
        self.common_opts(&mut args);

        let dockerfile = self.abs_in_workdir(&self.config.build);
        let build_from = (!self.config.build_from.is_empty())
            .then(|| self.abs_in_workdir(&self.config.build_from));

        let info = std::fs::metadata(&dockerfile)
            .with_context(|| format!("stat {}", dockerfile.display()))?;

        match (info.is_dir(), build_from) {
            (true, None) => args.push(dockerfile.to_string_lossy().into_owned()),
            (true, Some(from)) => {
                args.push("-f".into());
                args.push(dockerfile.join(DOCKERFILE).to_string_lossy().into_owned());
                args.push(from.to_string_lossy().into_owned());
            }
            (false, None) => {
                args.push("-f".into());
                args.push(dockerfile.to_string_lossy().into_owned());
                args.push(
                    dockerfile
                        .parent()
                        .unwrap_or(Path::new("."))
                        .to_string_lossy()
                        .into_owned(),
                );
            }
            (false, Some(from)) => {
                args.push("-f".into());
                args.push(dockerfile.to_string_lossy().into_owned());
                args.push(from.to_string_lossy().into_owned());
            }
        }

        let status = self.docker_teed(args, cancel).await?;
        if !status.success() {
            bail!("{}: docker build failed: {status}", self.ctx.name);
        }
        Ok(())
    }

    async fn commit(&self, cancel: &mut SignalReceiver) -> Result<()> {
        let image = self.config.commits[0].clone();
        let status = self
            .docker_teed(vec!["commit".into(), self.cid(), image.clone()], cancel)
            .await?;
        if !status.success() {
            bail!("{}: docker commit failed: {status}", self.ctx.name);
        }
        for tag in &self.config.commits[1..] {
            let status = self
                .docker_teed(vec!["tag".into(), image.clone(), tag.clone()], cancel)
                .await?;
            if !status.success() {
                bail!("{}: docker tag failed: {status}", self.ctx.name);
            }
        }
        Ok(())
    }

    async fn push(&self, cancel: &mut SignalReceiver) -> Result<()> {
        for image in &self.config.push {
            let status = self
                .docker_teed(vec!["push".into(), image.clone()], cancel)
                .await?;
            if !status.success() {
                bail!("{}: docker push failed: {status}", self.ctx.name);
            }
        }
        Ok(())
    }

    async fn run_container(&self, cancel: &mut SignalReceiver) -> Result<()> {
        self.check_project_dir()?;

        let workdir_in = format!(
            "{}/{}",
            self.config.src_volume.trim_end_matches('/'),
            self.ctx.target.working_dir()
        );
        let workdir_in = workdir_in.trim_end_matches('/').to_string();

        let mut args: Vec<String> = vec![
            "create".into(),
            "-v".into(),
            format!(
                "{}:{}",
                canonical_mount_path(&self.project_dir),
                self.config.src_volume
            ),
            "-w".into(),
            workdir_in,
            "--cidfile".into(),
            self.ctx.cid_file().to_string_lossy().into_owned(),
        ];

        let mut exec_args = self.ctx.target.args.clone();
        args.push("--entrypoint".into());
        if self.ctx.target.exec {
            if !exec_args.is_empty() {
                args.push(exec_args.remove(0));
            } else {
                let common = self.ctx.project.common_settings().unwrap_or_default();
                let shell = if common.exec_shell.is_empty() {
                    "/bin/sh".to_string()
                } else {
                    common.exec_shell
                };
                args.push(shell);
            }
        } else {
            args.push(format!(
                "{}/{WORK_FOLDER}/{}.script",
                self.config.src_volume.trim_end_matches('/'),
                self.ctx.name
            ));
        }

        let shell_ext = self.ctx.target_shell_ext();
        let console = self.ctx.target.exec || shell_ext.console;
        if console {
            args.push("-it".into());
        } else {
            args.extend(["-a", "STDOUT", "-a", "STDERR"].map(String::from));
        }

        // Non-root by default: run as the host user so files written into
        // the source volume stay owned by the invoker.
        let mut passwd: Option<ids::UserIds> = None;
        if self.config.user.is_empty() {
            let user = ids::current_user_ids().await?;
            args.push("-u".into());
            args.push(user.user());
            if self.config.groups.is_empty() {
                for grp in &user.groups {
                    if *grp != user.gid {
                        args.push("--group-add".into());
                        args.push(grp.to_string());
                    }
                }
            }
            passwd = Some(user);
        } else if self.config.user != "root" && self.config.user != "0" {
            let (uid, gid) = ids::user_ids(&self.config.user).await?;
            args.push("-u".into());
            args.push(format!("{uid}:{gid}"));
            passwd = Some(ids::UserIds {
                uid,
                gid,
                groups: Vec::new(),
            });
        }
        for grp in &self.config.groups {
            args.push("--group-add".into());
            args.push(grp.clone());
        }

        for env_file in &self.config.env_files {
            args.push("--env-file".into());
            args.push(format!(
                "{}/{}",
                self.config.src_volume.trim_end_matches('/'),
                self.ctx.target.project_path(env_file)
            ));
        }
        for env in &self.config.env {
            args.push("-e".into());
            args.push(env.clone());
        }

        if !self.config.network.is_empty() {
            args.push("--net".into());
            args.push(self.config.network.clone());
        }
        if self.config.network == "host" {
            args.push("--uts".into());
            args.push("host".into());
        } else {
            for port in &self.config.ports {
                args.push("-p".into());
                args.push(port.clone());
            }
            for host in &self.config.hosts {
                args.push("--add-host".into());
                args.push(host.clone());
            }
            for dns in &self.config.dns_servers {
                args.push("--dns".into());
                args.push(dns.clone());
            }
            if !self.config.dns_search.is_empty() {
                args.push("--dns-search".into());
                args.push(self.config.dns_search.clone());
            }
            for opt in &self.config.dns_opts {
                args.push("--dns-opt".into());
                args.push(opt.clone());
            }
        }

        for link in &self.config.link {
            args.push("--link".into());
            args.push(link.clone());
        }
        for cap in &self.config.cap_add {
            args.push("--cap-add".into());
            args.push(cap.clone());
        }
        for cap in &self.config.cap_drop {
            args.push("--cap-drop".into());
            args.push(cap.clone());
        }
        for dev in &self.config.devices {
            args.push("--device".into());
            args.push(dev.clone());
        }
        if self.config.privileged {
            args.push("--privileged".into());
        }

        for vol in &self.config.volumes {
            args.push("-v".into());
            args.push(self.host_volume(vol));
        }

        if let Some(w) = self.config.blkio_weight {
            args.push("--blkio-weight".into());
            args.push(w.to_string());
        }
        for w in &self.config.blkio_weight_devs {
            args.push("--blkio-weight-device".into());
            args.push(w.clone());
        }
        for bps in &self.config.device_read_bps {
            args.push("--device-read-bps".into());
            args.push(bps.clone());
        }
        for bps in &self.config.device_write_bps {
            args.push("--device-write-bps".into());
            args.push(bps.clone());
        }
        for iops in &self.config.device_read_iops {
            args.push("--device-read-iops".into());
            args.push(iops.clone());
        }
        for iops in &self.config.device_write_iops {
            args.push("--device-write-iops".into());
            args.push(iops.clone());
        }

        self.common_opts(&mut args);

        if !self.config.kernel_memory.is_empty() {
            args.push("--kernel-memory".into());
            args.push(self.config.kernel_memory.clone());
        }
        if let Some(s) = self.config.memory_swappiness {
            args.push("--memory-swappiness".into());
            args.push(s.to_string());
        }
        if !self.config.memory_reservation.is_empty() {
            args.push("--memory-reservation".into());
            args.push(self.config.memory_reservation.clone());
        }

        args.push(self.config.image.clone());
        args.extend(exec_args);

        if !self.ctx.target.exec {
            let script = self.ctx.write_script_file()?;
            if script.is_empty() {
                return Ok(());
            }
        }

        // Two-phase: create first so the cid-file exists before anything can
        // be signalled, then start attached.
        let status = Executor::new(&self.ctx, "docker", &args)
            .host_env()
            .mute_stdout()
            .run(Some(cancel))
            .await?;
        if !status.success() {
            bail!("{}: docker create failed: {status}", self.ctx.name);
        }

        if !self.config.no_passwd_patch {
            if let Some(user) = &passwd {
                self.patch_passwd(user).await?;
            }
        }

        let mut start_args: Vec<String> = vec!["start".into(), "-a".into()];
        if console {
            start_args.push("-i".into());
        }
        start_args.push(self.cid());

        let status = Executor::new(&self.ctx, "docker", &start_args)
            .host_env()
            .console(console)
            .run_with_signal(Some(cancel), |child, sig| self.on_signal(child, sig))
            .await?;
        if !status.success() {
            bail!("{}: exited with {status}", self.ctx.name);
        }
        Ok(())
    }

    /// Route a cancellation signal. The docker client does not forward
    /// signals to PID 1 in non-tty mode, so INT/TERM become `docker kill`;
    /// without a cid yet (image still downloading) the client process itself
    /// is signalled.
    fn on_signal(&self, child: &Child, sig: i32) {
        let cid = self.cid();
        if cid.is_empty() {
            debug!(task = %self.ctx.name, signal = sig, "no cid, relaying signal to client");
            send_signal(child, sig);
            return;
        }
        let args: Vec<String> = if sig == SIGINT || sig == SIGTERM {
            vec!["kill".into(), cid]
        } else {
            vec!["kill".into(), "-s".into(), sig.to_string(), cid]
        };
        tokio::spawn(async move {
            let _ = Command::new("docker")
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        });
    }

    async fn remove_container(&self) {
        let cid = self.cid();
        if cid.is_empty() {
            debug!(task = %self.ctx.name, "no cid, skipping container removal");
            return;
        }
        let args = ["rm", "-f", cid.as_str()].map(String::from);
        if let Err(err) = self.docker(&args).await {
            warn!(task = %self.ctx.name, error = %err, "container removal failed");
        }
    }

    /// Flags shared between build and create.
    fn common_opts(&self, args: &mut Vec<String>) {
        if let Some(shares) = self.config.cpu_shares {
            args.push("--cpu-shares".into());
            args.push(shares.to_string());
        }
        if let Some(period) = self.config.cpu_period {
            args.push("--cpu-period".into());
            args.push(period.to_string());
        }
        if let Some(quota) = self.config.cpu_quota {
            args.push("--cpu-quota".into());
            args.push(quota.to_string());
        }
        if !self.config.cpuset_cpus.is_empty() {
            args.push("--cpuset-cpus".into());
            args.push(self.config.cpuset_cpus.clone());
        }
        if !self.config.cpuset_mems.is_empty() {
            args.push("--cpuset-mems".into());
            args.push(self.config.cpuset_mems.clone());
        }
        if !self.config.memory.is_empty() {
            args.push("-m".into());
            args.push(self.config.memory.clone());
        }
        if !self.config.memory_swap.is_empty() {
            args.push("--memory-swap".into());
            args.push(self.config.memory_swap.clone());
        }
        if !self.config.shm_size.is_empty() {
            args.push("--shm-size".into());
            args.push(self.config.shm_size.clone());
        }
        for lim in &self.config.ulimit {
            args.push("--ulimit".into());
            args.push(lim.clone());
        }
        for label in &self.config.labels {
            args.push("--label".into());
            args.push(label.clone());
        }
        args.push("--label".into());
        args.push(format!(
            "hmake={}",
            self.ctx.env.get("HMAKE_VERSION").cloned().unwrap_or_default()
        ));
        args.push("--label".into());
        args.push(format!("hmake.target={}", self.ctx.name));
        if !self.ctx.project.name.is_empty() {
            args.push("--label".into());
            args.push(format!("hmake.project={}", self.ctx.project.name));
        }
        for label_file in &self.config.label_files {
            args.push("--label-file".into());
            args.push(label_file.clone());
        }
        if self.config.content_trust == Some(false) {
            args.push("--disable-content-trust".into());
        }
    }

    /// Resolve a volume spec's host side: `~/` from HOME, `-/` from the
    /// project root, non-absolute paths from the target's working dir.
    fn host_volume(&self, vol: &str) -> String {
        let project = to_slash(&self.project_dir);
        if let Some(rest) = vol.strip_prefix("~/") {
            let home = std::env::var("HOME").unwrap_or_default();
            format!("{home}/{rest}")
        } else if let Some(rest) = vol.strip_prefix("-/") {
            format!("{project}/{rest}")
        } else if !vol.starts_with('/') && !Path::new(vol).is_absolute() {
            let workdir = self.ctx.target.working_dir();
            if workdir.is_empty() {
                format!("{project}/{vol}")
            } else {
                format!("{project}/{workdir}/{vol}")
            }
        } else {
            vol.to_string()
        }
    }

    fn check_project_dir(&self) -> Result<()> {
        let dir = to_slash(&self.project_dir);
        if cfg!(target_os = "macos") && !dir.starts_with("/Users/") {
            bail!(HmakeError::ProjectPathUnsupported(dir));
        }
        if cfg!(target_os = "windows")
            && !self
                .project_dir
                .to_string_lossy()
                .to_lowercase()
                .starts_with("c:\\users\\")
        {
            bail!(HmakeError::ProjectPathUnsupported(dir));
        }
        Ok(())
    }

    /// Ensure the container's `/etc/passwd` has an entry for the uid the
    /// task runs as; musl and glibc tools misbehave without one. The file is
    /// streamed out of the created container as a tar, patched and streamed
    /// back before start.
    async fn patch_passwd(&self, user: &ids::UserIds) -> Result<()> {
        if user.uid == 0 {
            return Ok(());
        }
        let cid = self.cid();

        let out = self
            .docker_piped(None, &["cp".into(), format!("{cid}:/etc/passwd"), "-".into()])
            .await?;
        let Some((name, mode, content)) = tar_first_entry(&out) else {
            debug!(task = %self.ctx.name, "no passwd entry in tar stream, skipping patch");
            return Ok(());
        };

        let uid_str = user.uid.to_string();
        let text = String::from_utf8_lossy(&content);
        let mut lines: Vec<&str> = Vec::new();
        for line in text.lines() {
            let mut tokens = line.split(':');
            if tokens.nth(2) == Some(uid_str.as_str()) {
                // Entry already present.
                return Ok(());
            }
            lines.push(line);
        }
        let synthetic = format!(
            "user{0}:x:{0}:{1}::/tmp:/sbin/nologin",
            user.uid, user.gid
        );
        let mut patched = lines.join("\n");
        patched.push('\n');
        patched.push_str(&synthetic);
        patched.push('\n');

        let tarball = tar_single_entry(&name, mode, patched.as_bytes());
        self.docker_piped(
            Some(tarball),
            &["cp".into(), "-".into(), format!("{cid}:/etc")],
        )
        .await?;
        Ok(())
    }

    /// Run docker with raw piped stdin/stdout for tar streaming.
    async fn docker_piped(&self, input: Option<Vec<u8>>, args: &[String]) -> Result<Vec<u8>> {
        let mut cmd = Command::new("docker");
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning docker {}", args.join(" ")))?;

        if let Some(data) = input {
            let mut stdin = child.stdin.take().context("docker stdin unavailable")?;
            stdin.write_all(&data).await?;
            drop(stdin);
        }

        let out = child
            .wait_with_output()
            .await
            .with_context(|| format!("waiting for docker {}", args.join(" ")))?;
        if !out.status.success() {
            bail!(
                "docker {} failed: {}: {}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(out.stdout)
    }

    fn parse_compose(&mut self) -> Result<()> {
        let compose = self.compose.as_ref().expect("compose config");
        let mut args = Vec::new();
        if !compose.file.is_empty() {
            let full = self.ctx.project.base_dir.join(&compose.file);
            let info = std::fs::metadata(&full)
                .with_context(|| format!("stat {}", compose.file))?;
            if info.is_dir() {
                self.compose_dir = compose.file.clone();
            } else {
                let path = Path::new(&compose.file);
                self.compose_dir = path
                    .parent()
                    .map(|p| to_slash(p))
                    .unwrap_or_default();
                args.push("-f".to_string());
                args.push(
                    path.file_name()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                );
            }
        }
        if !compose.project_name.is_empty() {
            args.push("-p".to_string());
            args.push(compose.project_name.clone());
        }
        self.compose_args = args;
        Ok(())
    }

    async fn compose_exec(
        &self,
        args: &[String],
        cancel: Option<&mut SignalReceiver>,
    ) -> Result<()> {
        let mut full: Vec<String> = self.compose_args.clone();
        full.extend(args.iter().cloned());
        let dir = self.ctx.project.base_dir.join(&self.compose_dir);
        let status = Executor::new(&self.ctx, "docker-compose", &full)
            .host_env()
            .current_dir(dir)
            .run(cancel)
            .await?;
        if !status.success() {
            bail!(
                "{}: docker-compose {} failed: {status}",
                self.ctx.name,
                args.join(" ")
            );
        }
        Ok(())
    }

    async fn compose_up(
        &self,
        compose: &ComposeConfig,
        cancel: &mut SignalReceiver,
    ) -> Result<()> {
        let mut args: Vec<String> = ["up", "-d", "--no-color"].map(String::from).into();
        if compose.deps == Some(false) {
            args.push("--no-deps".into());
        }
        match &compose.recreate {
            Some(Value::Bool(false)) => args.push("--no-recreate".into()),
            Some(Value::String(s)) if s == "force" => args.push("--force-recreate".into()),
            _ => {}
        }
        match compose.build {
            Some(true) => args.push("--build".into()),
            Some(false) => args.push("--no-build".into()),
            None => {}
        }
        if compose.remove_orphans {
            args.push("--remove-orphans".into());
        }
        args.extend(compose.services.iter().cloned());
        self.compose_exec(&args, Some(cancel)).await
    }
}

/// Add or replace an env entry by name.
fn add_env(envs: &mut Vec<String>, entry: &str) {
    if entry.is_empty() {
        return;
    }
    let name = entry.split('=').next().unwrap_or(entry);
    for existing in envs.iter_mut() {
        let existing_name = existing.split('=').next().unwrap_or(existing);
        if existing_name == name {
            *existing = entry.to_string();
            return;
        }
    }
    envs.push(entry.to_string());
}

/// Propagate docker client access into the container.
fn expose_docker(config: &mut DockerConfig, ctx: &Arc<TaskContext>) {
    if let Ok(host) = std::env::var("DOCKER_HOST") {
        if !host.is_empty() {
            add_env(&mut config.env, &format!("DOCKER_HOST={host}"));
        }
    }
    if let Ok(cert) = std::env::var("DOCKER_CERT_PATH") {
        if !cert.is_empty() {
            add_env(&mut config.env, &format!("DOCKER_CERT_PATH={cert}"));
            config.volumes.push(format!("{cert}:{cert}"));
        }
    }
    if let Ok(verify) = std::env::var("DOCKER_TLS_VERIFY") {
        if !verify.is_empty() {
            add_env(&mut config.env, &format!("DOCKER_TLS_VERIFY={verify}"));
        }
    }
    if cfg!(target_os = "linux") && std::env::var("DOCKER_HOST").unwrap_or_default().is_empty() {
        let sock = ctx
            .target
            .ext_str("server-socket")
            .filter(|s| !s.is_empty())
            .unwrap_or("/var/run/docker.sock");
        config.volumes.push(format!("{sock}:{sock}"));
    }
}

/// Host path form docker accepts for a bind mount.
fn canonical_mount_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if cfg!(target_os = "windows") {
        // C:\foo -> /c/foo
        let slashed = s.replace('\\', "/");
        if let Some((drive, rest)) = slashed.split_once(':') {
            return format!("/{}{}", drive.to_lowercase(), rest);
        }
        slashed
    } else {
        s.into_owned()
    }
}

/// Deterministic text form of a config value for signatures.
fn fmt_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Sequence(seq) => {
            let items: Vec<String> = seq.iter().map(fmt_value).collect();
            format!("[{}]", items.join(","))
        }
        Value::Mapping(m) => {
            let mut items: Vec<String> = m
                .iter()
                .map(|(k, v)| format!("{}:{}", fmt_value(k), fmt_value(v)))
                .collect();
            items.sort();
            format!("{{{}}}", items.join(","))
        }
        Value::Tagged(t) => fmt_value(&t.value),
    }
}

/// Parse the first entry of a ustar stream: (name, mode, content).
fn tar_first_entry(data: &[u8]) -> Option<(String, u32, Vec<u8>)> {
    if data.len() < 512 {
        return None;
    }
    let header = &data[..512];
    if header.iter().all(|b| *b == 0) {
        return None;
    }
    let name = String::from_utf8_lossy(&header[0..100])
        .trim_end_matches('\0')
        .to_string();
    let mode = octal_field(&header[100..108]).unwrap_or(0o644) as u32;
    let size = octal_field(&header[124..136])? as usize;
    let content = data.get(512..512 + size)?.to_vec();
    Some((name, mode, content))
}

fn octal_field(field: &[u8]) -> Option<u64> {
    let text = String::from_utf8_lossy(field);
    let text = text.trim_matches(|c: char| c == '\0' || c == ' ');
    u64::from_str_radix(text, 8).ok()
}

/// Serialize a single-file ustar archive.
fn tar_single_entry(name: &str, mode: u32, content: &[u8]) -> Vec<u8> {
    let mut header = [0u8; 512];
    let name_bytes = name.as_bytes();
    let name_len = name_bytes.len().min(100);
    header[..name_len].copy_from_slice(&name_bytes[..name_len]);
    write_octal(&mut header[100..108], mode as u64, 7);
    write_octal(&mut header[108..116], 0, 7); // uid
    write_octal(&mut header[116..124], 0, 7); // gid
    write_octal(&mut header[124..136], content.len() as u64, 11);
    write_octal(&mut header[136..148], 0, 11); // mtime
    header[156] = b'0'; // regular file
    header[257..262].copy_from_slice(b"ustar");
    header[263..265].copy_from_slice(b"00");

    // Checksum is computed with its own field filled with spaces.
    header[148..156].fill(b' ');
    let sum: u64 = header.iter().map(|b| *b as u64).sum();
    write_octal(&mut header[148..155], sum, 6);
    header[155] = b' ';

    let mut out = Vec::with_capacity(512 + content.len() + 1536);
    out.extend_from_slice(&header);
    out.extend_from_slice(content);
    let pad = (512 - content.len() % 512) % 512;
    out.extend(std::iter::repeat(0u8).take(pad));
    out.extend_from_slice(&[0u8; 1024]);
    out
}

fn write_octal(field: &mut [u8], value: u64, digits: usize) {
    let text = format!("{value:0width$o}", width = digits);
    let bytes = text.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
    if n < field.len() {
        field[n] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_env_replaces_by_name() {
        let mut envs = vec!["A=1".to_string(), "B=2".to_string()];
        add_env(&mut envs, "A=3");
        add_env(&mut envs, "C=4");
        assert_eq!(envs, ["A=3", "B=2", "C=4"]);
    }

    #[test]
    fn tar_round_trip() {
        let tarball = tar_single_entry("passwd", 0o644, b"root:x:0:0::/root:/bin/sh\n");
        let (name, mode, content) = tar_first_entry(&tarball).unwrap();
        assert_eq!(name, "passwd");
        assert_eq!(mode, 0o644);
        assert_eq!(content, b"root:x:0:0::/root:/bin/sh\n");
    }

    #[test]
    fn mount_path_is_identity_on_unix() {
        if cfg!(unix) {
            assert_eq!(canonical_mount_path(Path::new("/home/u/proj")), "/home/u/proj");
        }
    }
}
