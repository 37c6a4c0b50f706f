// src/driver/ids.rs

//! Host user identity for non-root container execution.
//!
//! On Linux the current process ids are used directly. On macOS and Windows
//! a docker-machine style VM owns the mounted files, so ids are fetched by
//! SSHing into the machine and running `id`.

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;

/// uid/gid plus supplementary groups of the identity a container runs as.
#[derive(Debug, Clone, Default)]
pub struct UserIds {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl UserIds {
    /// The `-u <uid>:<gid>` form.
    pub fn user(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }
}

fn using_docker_machine() -> bool {
    cfg!(any(target_os = "macos", target_os = "windows"))
        && std::env::var("DOCKER_MACHINE_NAME").is_ok()
}

/// Identity of the current host user.
pub async fn current_user_ids() -> Result<UserIds> {
    if using_docker_machine() {
        return current_ids_from_docker_machine().await;
    }
    #[cfg(unix)]
    {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let groups = nix::unistd::getgroups()
            .context("reading supplementary groups")?
            .into_iter()
            .map(|g| g.as_raw())
            .collect();
        Ok(UserIds { uid, gid, groups })
    }
    #[cfg(not(unix))]
    {
        bail!("current user ids unavailable without a docker machine")
    }
}

/// Resolve a user reference (numeric uid or name) into uid/gid.
pub async fn user_ids(name: &str) -> Result<(u32, u32)> {
    if using_docker_machine() {
        return user_ids_from_docker_machine(name).await;
    }
    #[cfg(unix)]
    {
        use nix::unistd::User;
        let user = if let Ok(uid) = name.parse::<u32>() {
            User::from_uid(nix::unistd::Uid::from_raw(uid))
                .with_context(|| format!("looking up uid {uid}"))?
        } else {
            User::from_name(name).with_context(|| format!("looking up user {name}"))?
        };
        match user {
            Some(u) => Ok((u.uid.as_raw(), u.gid.as_raw())),
            None => bail!("unknown user: {name}"),
        }
    }
    #[cfg(not(unix))]
    {
        bail!("user lookup unavailable without a docker machine: {name}")
    }
}

async fn inspect_ids(opt: &str) -> Result<Vec<u32>> {
    let machine =
        std::env::var("DOCKER_MACHINE_NAME").map_err(|_| anyhow!("unknown DOCKER_MACHINE_NAME"))?;
    let out = Command::new("docker-machine")
        .args(["ssh", machine.as_str(), "id", opt])
        .output()
        .await
        .with_context(|| format!("running docker-machine ssh {machine} id {opt}"))?;
    if !out.status.success() {
        bail!("docker-machine ssh id {opt} failed: {}", out.status);
    }
    let ids: Vec<u32> = String::from_utf8_lossy(&out.stdout)
        .split_whitespace()
        .filter_map(|t| t.trim().parse().ok())
        .collect();
    if ids.is_empty() {
        bail!("no id found from docker-machine id {opt}");
    }
    Ok(ids)
}

async fn current_ids_from_docker_machine() -> Result<UserIds> {
    let uid = inspect_ids("-u").await?[0];
    let gid = inspect_ids("-g").await?[0];
    let groups = inspect_ids("-G").await?;
    Ok(UserIds { uid, gid, groups })
}

async fn ssh_id(machine: &str, flag: &str, name: &str) -> Result<u32> {
    let out = Command::new("docker-machine")
        .args(["ssh", machine, "id", flag, name])
        .output()
        .await
        .with_context(|| format!("running docker-machine ssh {machine} id {flag} {name}"))?;
    if !out.status.success() {
        bail!("docker-machine ssh id {flag} {name} failed: {}", out.status);
    }
    String::from_utf8_lossy(&out.stdout)
        .trim()
        .parse::<u32>()
        .map_err(|e| anyhow!("parsing id output: {e}"))
}

async fn user_ids_from_docker_machine(name: &str) -> Result<(u32, u32)> {
    let machine =
        std::env::var("DOCKER_MACHINE_NAME").map_err(|_| anyhow!("unknown DOCKER_MACHINE_NAME"))?;
    let uid = ssh_id(&machine, "-u", name).await?;
    let gid = ssh_id(&machine, "-g", name).await?;
    Ok((uid, gid))
}
