//! Container supervisor.
//!
//! Provisions and tears down the sandboxed execution environment per
//! session, independent of WebSocket concerns. Wraps the Docker or
//! Podman CLI; the runtime is auto-detected or configured explicitly.
//! Every engine call runs as a child process under a deadline with
//! `kill_on_drop`, so a timed-out operation's child is killed rather
//! than leaked (the engine daemon may still finish server-side).

mod config;
mod error;

pub use config::{
    ContainerConfig, LABEL_CREDENTIAL, LABEL_OWNER, LABEL_SESSION, SessionContainerSpec,
    validate_container_id_or_name, validate_image_name, validate_session_id,
};
pub use error::{ContainerError, ContainerResult};

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

/// Deadline for ordinary engine operations (create, inspect, rm).
const OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime.
    #[default]
    Docker,
    /// Podman runtime.
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Point-in-time state of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// Engine status string, e.g. "running", "exited", "created".
    pub status: String,
    /// Exit code; meaningful only when status is "exited".
    pub exit_code: i64,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn has_exited(&self) -> bool {
        self.status == "exited" || self.status == "dead"
    }
}

/// A session container found by label, possibly created by a prior
/// server process.
#[derive(Debug, Clone)]
pub struct DiscoveredSession {
    pub container_id: String,
    pub credential_hash: String,
}

/// Bidirectional byte stream into a container's interactive shell.
pub struct AttachedStream {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    // Kills the attach child process when the stream is dropped. The
    // container itself is never affected by detaching.
    guard: Option<tokio::process::Child>,
}

impl AttachedStream {
    /// Wrap arbitrary stream halves (used by tests with duplex pipes).
    pub fn new(
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            guard: None,
        }
    }
}

/// Container supervisor abstraction.
///
/// The lifecycle controller only sees this trait; tests substitute a
/// mock, production uses [`ContainerRuntime`].
#[async_trait]
pub trait ContainerSupervisorApi: Send + Sync {
    /// Make sure the sandbox image exists, building it if necessary.
    async fn ensure_image(&self) -> ContainerResult<()>;

    /// Create (but do not start) a session container. Returns its ID.
    async fn create_session_container(
        &self,
        spec: &SessionContainerSpec,
    ) -> ContainerResult<String>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> ContainerResult<()>;

    /// Open the container's interactive stream.
    async fn attach(&self, id: &str) -> ContainerResult<AttachedStream>;

    /// Inspect current state. `Ok(None)` when the container is gone.
    async fn inspect_state(&self, id: &str) -> ContainerResult<Option<ContainerState>>;

    /// Remove a container. Idempotent: already-removed is success.
    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> ContainerResult<()>;

    /// Locate a container labeled with `session_id` for cross-process
    /// resume discovery.
    async fn find_session_container(
        &self,
        session_id: &str,
    ) -> ContainerResult<Option<DiscoveredSession>>;

    /// Remove containers left behind by dead server processes.
    /// Returns the number removed.
    async fn cleanup_stale_containers(&self) -> ContainerResult<usize>;
}

/// Remove many containers with a concurrency cap, so shutdown cleanup
/// cannot overwhelm the engine. Returns the number removed without error.
pub async fn bulk_remove(
    supervisor: &dyn ContainerSupervisorApi,
    ids: Vec<String>,
    max_concurrent: usize,
) -> usize {
    futures::stream::iter(ids)
        .map(|id| async move {
            match supervisor.remove_container(&id, true, true).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("bulk remove of {} failed: {}", id, e);
                    false
                }
            }
        })
        .buffer_unordered(max_concurrent.max(1))
        .filter(|ok| futures::future::ready(*ok))
        .count()
        .await
}

/// Container supervisor over the Docker or Podman CLI.
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
    config: ContainerConfig,
    /// Identity recorded in `shellgate.owner`: this process's PID.
    owner: String,
    /// Production strictness: image failures are fatal instead of
    /// tolerated.
    production: bool,
}

impl ContainerRuntime {
    pub fn new(config: ContainerConfig, production: bool) -> Self {
        let runtime_type = config.runtime.unwrap_or_else(Self::detect_runtime);
        let binary = config
            .binary
            .clone()
            .unwrap_or_else(|| runtime_type.default_binary().to_string());
        Self {
            runtime_type,
            binary,
            config,
            owner: std::process::id().to_string(),
            production,
        }
    }

    /// Pick an available runtime, preferring Docker.
    fn detect_runtime() -> RuntimeType {
        if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Fall back to docker; operations will fail with a clear error.
            RuntimeType::Docker
        }
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new(name)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Run an engine command under a deadline and collect its output.
    async fn run(
        &self,
        command: &str,
        args: &[String],
        deadline: Duration,
    ) -> ContainerResult<std::process::Output> {
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ContainerError::Timeout {
                command: command.to_string(),
                seconds: deadline.as_secs(),
            }),
        }
    }

    /// Run and require success, returning trimmed stdout.
    async fn run_expecting(
        &self,
        command: &str,
        args: &[String],
        deadline: Duration,
    ) -> ContainerResult<String> {
        let output = self.run(command, args, deadline).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether the configured sandbox image exists locally.
    async fn image_exists(&self) -> ContainerResult<bool> {
        validate_image_name(&self.config.image)?;
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            self.config.image.clone(),
        ];
        let output = self.run("image inspect", &args, OP_TIMEOUT).await?;
        Ok(output.status.success())
    }

    /// Build the sandbox image from the configured context.
    async fn build_image(&self) -> ContainerResult<()> {
        let context = self.config.build_context.as_ref().ok_or_else(|| {
            ContainerError::ImageUnavailable(format!(
                "image '{}' missing and no build context configured",
                self.config.image
            ))
        })?;

        info!(
            "building image '{}' from {} (timeout {}s)",
            self.config.image, context, self.config.build_timeout_secs
        );

        let args = vec![
            "build".to_string(),
            "-t".to_string(),
            self.config.image.clone(),
            context.clone(),
        ];
        let deadline = Duration::from_secs(self.config.build_timeout_secs);
        self.run_expecting("build", &args, deadline).await?;
        info!("image '{}' built", self.config.image);
        Ok(())
    }

    /// Assemble `create` arguments for a session container.
    fn create_args(&self, spec: &SessionContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".to_string(),
            "-i".to_string(),
            "-t".to_string(),
            "--name".to_string(),
            container_name(&spec.session_id),
            // A crashed session must surface as a terminated session,
            // not silently respawn.
            "--restart".to_string(),
            "no".to_string(),
            "--network".to_string(),
            self.config.network_mode.clone(),
            "--memory".to_string(),
            format!("{}m", self.config.memory_limit_mb),
            "--pids-limit".to_string(),
            self.config.pids_limit.to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
        ];

        for cap in &self.config.cap_allow {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }

        args.push("--label".to_string());
        args.push(format!("{}={}", LABEL_SESSION, spec.session_id));
        args.push("--label".to_string());
        args.push(format!("{}={}", LABEL_OWNER, self.owner));
        args.push("--label".to_string());
        args.push(format!("{}={}", LABEL_CREDENTIAL, spec.credential_hash));

        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.config.image.clone());
        args.push(self.config.shell.clone());

        args
    }

    /// Inspect a single label on a container.
    async fn inspect_label(&self, id: &str, label: &str) -> ContainerResult<Option<String>> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            format!("{{{{index .Config.Labels \"{}\"}}}}", label),
            id.to_string(),
        ];
        let output = self.run("inspect", &args, OP_TIMEOUT).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    /// Inspect the creation time of a container.
    async fn inspect_created(&self, id: &str) -> ContainerResult<Option<DateTime<Utc>>> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Created}}".to_string(),
            id.to_string(),
        ];
        let output = self.run("inspect", &args, OP_TIMEOUT).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_created(String::from_utf8_lossy(&output.stdout).trim()))
    }

    /// List container IDs matching a `ps` label filter.
    async fn list_ids_by_label(&self, filter: &str) -> ContainerResult<Vec<String>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("label={}", filter),
            "--format".to_string(),
            "{{.ID}}".to_string(),
        ];
        let stdout = self.run_expecting("ps", &args, OP_TIMEOUT).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

#[async_trait]
impl ContainerSupervisorApi for ContainerRuntime {
    async fn ensure_image(&self) -> ContainerResult<()> {
        let exists = match self.image_exists().await {
            Ok(exists) => exists,
            Err(e) => {
                if self.production {
                    return Err(e);
                }
                warn!("container engine unreachable, continuing without image check: {}", e);
                return Ok(());
            }
        };

        if exists && !self.config.force_rebuild {
            debug!("image '{}' present", self.config.image);
            return Ok(());
        }

        match self.build_image().await {
            Ok(()) => Ok(()),
            Err(e) if self.production => Err(e),
            Err(e) => {
                // Development: keep serving; provisioning will surface a
                // clear per-session error instead.
                warn!("image build failed, continuing in dev mode: {}", e);
                Ok(())
            }
        }
    }

    async fn create_session_container(
        &self,
        spec: &SessionContainerSpec,
    ) -> ContainerResult<String> {
        spec.validate()?;
        validate_image_name(&self.config.image)?;
        let args = self.create_args(spec);
        let id = self.run_expecting("create", &args, OP_TIMEOUT).await?;
        debug!(
            "created container {} for session {}",
            &id[..id.len().min(12)],
            spec.session_id
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(id)?;
        let args = vec!["start".to_string(), id.to_string()];
        self.run_expecting("start", &args, OP_TIMEOUT).await?;
        Ok(())
    }

    async fn attach(&self, id: &str) -> ContainerResult<AttachedStream> {
        validate_container_id_or_name(id)?;
        let mut child = Command::new(&self.binary)
            .args(["attach", id])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::CommandFailed {
                command: "attach".to_string(),
                message: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ContainerError::CommandFailed {
            command: "attach".to_string(),
            message: "attach child has no stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ContainerError::CommandFailed {
            command: "attach".to_string(),
            message: "attach child has no stdout".to_string(),
        })?;

        Ok(AttachedStream {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            guard: Some(child),
        })
    }

    async fn inspect_state(&self, id: &str) -> ContainerResult<Option<ContainerState>> {
        validate_container_id_or_name(id)?;
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}|{{.State.ExitCode}}".to_string(),
            id.to_string(),
        ];
        let output = self.run("inspect", &args, OP_TIMEOUT).await?;
        if !output.status.success() {
            // Not found is not an error; callers treat it as missing.
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_state(stdout.trim()).map(Some)
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(id)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        if remove_volumes {
            args.push("-v".to_string());
        }
        args.push(id.to_string());

        let output = self.run("rm", &args, OP_TIMEOUT).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_missing_container_stderr(&stderr) {
                return Err(ContainerError::CommandFailed {
                    command: "rm".to_string(),
                    message: stderr.trim().to_string(),
                });
            }
        }

        // Some engines report success without completing the removal;
        // re-inspect to catch that.
        if self.inspect_state(id).await?.is_some() {
            return Err(ContainerError::RemovalIncomplete(id.to_string()));
        }

        Ok(())
    }

    async fn find_session_container(
        &self,
        session_id: &str,
    ) -> ContainerResult<Option<DiscoveredSession>> {
        validate_session_id(session_id)?;
        let ids = self
            .list_ids_by_label(&format!("{}={}", LABEL_SESSION, session_id))
            .await?;
        let Some(container_id) = ids.into_iter().next() else {
            return Ok(None);
        };
        let Some(credential_hash) = self.inspect_label(&container_id, LABEL_CREDENTIAL).await?
        else {
            return Ok(None);
        };
        Ok(Some(DiscoveredSession {
            container_id,
            credential_hash,
        }))
    }

    async fn cleanup_stale_containers(&self) -> ContainerResult<usize> {
        let ids = self.list_ids_by_label(LABEL_OWNER).await?;
        let stale_after = chrono::Duration::seconds(self.config.stale_after_secs as i64);
        let now = Utc::now();
        let mut removed = 0;

        for id in ids {
            let owner = match self.inspect_label(&id, LABEL_OWNER).await? {
                Some(owner) => owner,
                None => continue, // vanished between ps and inspect
            };
            if owner == self.owner {
                continue;
            }
            if owner.parse::<u32>().is_ok_and(pid_alive) {
                debug!("container {} owned by live process {}, keeping", id, owner);
                continue;
            }
            // Recent containers from a dead process are kept so a
            // restarted server can still offer cross-process resume.
            if let Some(created) = self.inspect_created(&id).await?
                && now.signed_duration_since(created) < stale_after
            {
                debug!("container {} from dead owner {} still within resume window", id, owner);
                continue;
            }
            match self.remove_container(&id, true, true).await {
                Ok(()) => {
                    info!("removed stale container {} (owner {})", id, owner);
                    removed += 1;
                }
                Err(e) => warn!("failed to remove stale container {}: {}", id, e),
            }
        }

        Ok(removed)
    }
}

/// Deterministic container name for a session.
pub fn container_name(session_id: &str) -> String {
    format!("shellgate-{}", session_id)
}

/// Classify `rm` stderr for idempotent removal.
fn is_missing_container_stderr(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("container not known")
}

fn parse_state(text: &str) -> ContainerResult<ContainerState> {
    let (status, exit_code) = text
        .split_once('|')
        .ok_or_else(|| ContainerError::ParseError(format!("unexpected inspect output: {text}")))?;
    let exit_code = exit_code
        .trim()
        .parse::<i64>()
        .map_err(|e| ContainerError::ParseError(format!("bad exit code '{exit_code}': {e}")))?;
    Ok(ContainerState {
        status: status.trim().to_string(),
        exit_code,
    })
}

fn parse_created(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    rustix::process::Pid::from_raw(pid as i32)
        .is_some_and(|p| rustix::process::test_kill_process(p).is_ok())
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}
