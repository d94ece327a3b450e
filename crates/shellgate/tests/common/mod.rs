//! Shared test fixtures: a scripted container supervisor whose attach
//! streams are in-memory duplex pipes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shellgate::auth::{AuthConfig, CredentialValidator};
use shellgate::container::{
    AttachedStream, ContainerError, ContainerResult, ContainerState, ContainerSupervisorApi,
    DiscoveredSession, SessionContainerSpec,
};
use shellgate::ratelimit::{RateLimitConfig, RateLimiter};
use shellgate::session::{LifecycleController, SessionSettings};
use tokio::io::DuplexStream;

/// The far ends of a mock attach stream: what the "shell" sees.
pub struct AttachHandle {
    /// Reads bytes the session wrote to the container's stdin.
    pub stdin_echo: DuplexStream,
    /// Writes bytes that appear as container output.
    pub stdout_feed: DuplexStream,
}

#[derive(Default)]
pub struct MockSupervisor {
    pub created: Mutex<Vec<SessionContainerSpec>>,
    pub removed: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, bool>>,
    pub discoverable: Mutex<HashMap<String, DiscoveredSession>>,
    handles: Mutex<HashMap<String, AttachHandle>>,
    pub fail_create: AtomicBool,
    pub fail_attach: AtomicBool,
}

impl MockSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the shell-side ends of the attach stream for a container.
    pub fn take_handle(&self, container_id: &str) -> AttachHandle {
        self.handles
            .lock()
            .unwrap()
            .remove(container_id)
            .expect("no attach handle for container")
    }

    /// Register a container as discoverable by label, as if a prior
    /// server process had created it.
    pub fn add_discoverable(&self, session_id: &str, container_id: &str, credential_hash: &str) {
        self.running
            .lock()
            .unwrap()
            .insert(container_id.to_string(), true);
        self.discoverable.lock().unwrap().insert(
            session_id.to_string(),
            DiscoveredSession {
                container_id: container_id.to_string(),
                credential_hash: credential_hash.to_string(),
            },
        );
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerSupervisorApi for MockSupervisor {
    async fn ensure_image(&self) -> ContainerResult<()> {
        Ok(())
    }

    async fn create_session_container(
        &self,
        spec: &SessionContainerSpec,
    ) -> ContainerResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        let id = format!("ctr-{}", spec.session_id);
        self.created.lock().unwrap().push(spec.clone());
        self.running.lock().unwrap().insert(id.clone(), false);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> ContainerResult<()> {
        self.running.lock().unwrap().insert(id.to_string(), true);
        Ok(())
    }

    async fn attach(&self, id: &str) -> ContainerResult<AttachedStream> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "attach".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        let (stdin_w, stdin_r) = tokio::io::duplex(64 * 1024);
        let (stdout_w, stdout_r) = tokio::io::duplex(64 * 1024);
        self.handles.lock().unwrap().insert(
            id.to_string(),
            AttachHandle {
                stdin_echo: stdin_r,
                stdout_feed: stdout_w,
            },
        );
        Ok(AttachedStream::new(Box::new(stdin_w), Box::new(stdout_r)))
    }

    async fn inspect_state(&self, id: &str) -> ContainerResult<Option<ContainerState>> {
        Ok(self.running.lock().unwrap().get(id).map(|running| ContainerState {
            status: if *running { "running" } else { "exited" }.to_string(),
            exit_code: 0,
        }))
    }

    async fn remove_container(
        &self,
        id: &str,
        _force: bool,
        _remove_volumes: bool,
    ) -> ContainerResult<()> {
        // Idempotent by contract: removing an already-removed container
        // is success.
        self.running.lock().unwrap().remove(id);
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn find_session_container(
        &self,
        session_id: &str,
    ) -> ContainerResult<Option<DiscoveredSession>> {
        Ok(self.discoverable.lock().unwrap().get(session_id).cloned())
    }

    async fn cleanup_stale_containers(&self) -> ContainerResult<usize> {
        Ok(0)
    }
}

/// Controller wired to a mock supervisor with limiter bypass and short
/// timeouts suitable for paused-clock tests.
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        auth_timeout_secs: 3,
        orphan_grace_secs: 5,
        idle_timeout_secs: 0,
        max_message_bytes: 1024,
        max_sessions: 8,
        ..SessionSettings::default()
    }
}

pub fn test_controller(
    settings: SessionSettings,
) -> (Arc<LifecycleController>, Arc<MockSupervisor>) {
    let supervisor = MockSupervisor::new();
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        test_mode: true,
        ..RateLimitConfig::default()
    }));
    let validator = CredentialValidator::new(&AuthConfig::default());
    let controller = LifecycleController::new(supervisor.clone(), validator, limiter, settings);
    (controller, supervisor)
}
