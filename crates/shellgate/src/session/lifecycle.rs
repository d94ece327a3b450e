use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::{CredentialValidator, constant_time_eq, credential_hash};
use crate::container::{self, ContainerSupervisorApi, SessionContainerSpec};
use crate::ratelimit::{RateLimiter, short_id};
use crate::ws::protocol::{AuthIntent, AuthRequest, Credentials, ServerFrame, close};

use super::{Outbound, ScheduledTimer, Session, SessionRegistry};

/// Tunables for the session state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Seconds an unauthenticated connection may exist before being
    /// destroyed.
    pub auth_timeout_secs: u64,
    /// Grace window during which a disconnected authenticated session
    /// is held for resume.
    pub orphan_grace_secs: u64,
    /// End sessions idle beyond this many seconds. Zero disables.
    pub idle_timeout_secs: u64,
    /// Inbound WebSocket frame size ceiling.
    pub max_message_bytes: usize,
    /// Cap on concurrently registered sessions.
    pub max_sessions: usize,
    /// Byte cap of the per-session output replay buffer.
    pub output_buffer_bytes: usize,
    /// Depth of the per-connection outbound frame queue.
    pub client_queue_depth: usize,
    /// Delay before the post-start container health inspect.
    pub start_monitor_delay_secs: u64,
    /// Overall deadline for shutdown cleanup.
    pub shutdown_grace_secs: u64,
    /// Concurrency cap for bulk container removal.
    pub cleanup_concurrency: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 30,
            orphan_grace_secs: 60,
            idle_timeout_secs: 3600,
            max_message_bytes: 64 * 1024,
            max_sessions: 100,
            output_buffer_bytes: 256 * 1024,
            client_queue_depth: 256,
            start_monitor_delay_secs: 2,
            shutdown_grace_secs: 10,
            cleanup_concurrency: 8,
        }
    }
}

/// Security-relevant event counters surfaced under `/stats`.
#[derive(Debug, Default)]
pub struct Alerts {
    /// Resume attempts presenting credentials that do not match the
    /// target session (hijack attempts).
    pub credential_mismatches: AtomicU64,
    /// Connections and resumes rejected by a limiter or the session cap.
    pub rate_limit_rejections: AtomicU64,
    /// Sessions terminated for exceeding the message size ceiling.
    pub oversized_messages: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertsSnapshot {
    pub credential_mismatches: u64,
    pub rate_limit_rejections: u64,
    pub oversized_messages: u64,
}

impl Alerts {
    pub fn snapshot(&self) -> AlertsSnapshot {
        AlertsSnapshot {
            credential_mismatches: self.credential_mismatches.load(Ordering::Relaxed),
            rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
            oversized_messages: self.oversized_messages.load(Ordering::Relaxed),
        }
    }
}

/// The session state machine: connect, authenticate, rate-check,
/// resume or create, attach, run, disconnect, orphan-hold.
///
/// Per-session errors never escape this type; every failure path
/// converts into a termination sequence (best-effort status frame,
/// close code, registry purge).
pub struct LifecycleController {
    pub registry: SessionRegistry,
    pub supervisor: Arc<dyn ContainerSupervisorApi>,
    pub validator: CredentialValidator,
    pub limiter: Arc<RateLimiter>,
    pub settings: SessionSettings,
    pub alerts: Alerts,
    shutting_down: AtomicBool,
}

impl LifecycleController {
    pub fn new(
        supervisor: Arc<dyn ContainerSupervisorApi>,
        validator: CredentialValidator,
        limiter: Arc<RateLimiter>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            supervisor,
            validator,
            limiter,
            settings,
            alerts: Alerts::default(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Register a placeholder session for a freshly accepted
    /// connection and arm its authentication timeout.
    ///
    /// Returns `None` when the connection was rejected; the status
    /// frame and close are already queued on `client_tx`.
    pub async fn begin_connection(
        self: &Arc<Self>,
        client_tx: &mpsc::Sender<Outbound>,
    ) -> Option<Arc<Session>> {
        if self.is_shutting_down() {
            close_with(client_tx, close::TRY_AGAIN_LATER, "server is shutting down").await;
            return None;
        }
        if self.registry.len() >= self.settings.max_sessions {
            self.alerts.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
            warn!("session limit ({}) reached, rejecting connection", self.settings.max_sessions);
            close_with(client_tx, close::SESSION_LIMIT, "session limit reached").await;
            return None;
        }

        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone(), self.settings.output_buffer_bytes));
        {
            let mut inner = session.inner.lock().await;
            inner.client_tx = Some(client_tx.clone());
            let ctl = self.clone();
            inner.auth_timer = Some(ScheduledTimer::schedule(
                Duration::from_secs(self.settings.auth_timeout_secs),
                async move {
                    debug!("authentication timeout for session {}", short_id(&id));
                    ctl.terminate_session(&id, Some((close::INVALID_FORMAT, "authentication timeout")))
                        .await;
                },
            ));
        }
        self.registry.insert(session.clone());
        Some(session)
    }

    /// Process the one-shot auth message.
    ///
    /// On success returns the live session (the promoted placeholder,
    /// or the resumed one) and the connection epoch under which this
    /// socket holds it. On failure the placeholder is purged and the
    /// close is queued; the connection is finished.
    pub async fn authenticate(
        self: &Arc<Self>,
        placeholder: Arc<Session>,
        raw: &[u8],
        client_tx: &mpsc::Sender<Outbound>,
    ) -> Option<(Arc<Session>, u64)> {
        if raw.len() > self.settings.max_message_bytes {
            self.alerts.oversized_messages.fetch_add(1, Ordering::Relaxed);
            warn!(
                "auth payload of {} bytes exceeds ceiling on session {}",
                raw.len(),
                short_id(&placeholder.id)
            );
            self.reject(&placeholder, client_tx, close::MESSAGE_TOO_LARGE, "message too large")
                .await;
            return None;
        }

        let request: AuthRequest = match serde_json::from_slice(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("malformed auth payload on session {}: {}", short_id(&placeholder.id), e);
                self.reject(&placeholder, client_tx, close::INVALID_FORMAT, "invalid message format")
                    .await;
                return None;
            }
        };

        match AuthIntent::from(request) {
            AuthIntent::Resume { session_id, credentials, env } => {
                self.handle_resume(placeholder, session_id, credentials, env, client_tx)
                    .await
            }
            AuthIntent::Fresh { credentials, env } => {
                self.handle_fresh(placeholder, credentials, env, client_tx).await
            }
        }
    }

    async fn handle_resume(
        self: &Arc<Self>,
        placeholder: Arc<Session>,
        session_id: String,
        credentials: Credentials,
        env: std::collections::HashMap<String, String>,
        client_tx: &mpsc::Sender<Outbound>,
    ) -> Option<(Arc<Session>, u64)> {
        // Resume attempts target a specific prior session, so they are
        // gated before any lookup happens.
        if !self.limiter.admit_resume(&session_id) {
            self.alerts.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
            self.reject(&placeholder, client_tx, close::RESUME_RATE_LIMITED, "resume rate limited")
                .await;
            return None;
        }
        if credentials.is_empty() {
            self.reject(&placeholder, client_tx, close::POLICY_VIOLATION, "missing credentials")
                .await;
            return None;
        }
        let presented = credential_hash(&credentials);

        if let Some(existing) = self.registry.get(&session_id) {
            let mut inner = existing.inner.lock().await;
            if inner.authenticated && !inner.closed {
                let matches = inner
                    .credential_hash
                    .as_deref()
                    .is_some_and(|stored| constant_time_eq(stored, &presented));
                if !matches {
                    drop(inner);
                    warn!(
                        "credential mismatch on resume attempt for session {}",
                        short_id(&session_id)
                    );
                    self.alerts.credential_mismatches.fetch_add(1, Ordering::Relaxed);
                    self.reject(
                        &placeholder,
                        client_tx,
                        close::INVALID_CREDENTIALS,
                        "credentials do not match session",
                    )
                    .await;
                    return None;
                }

                // Takeover. Everything below happens under the session
                // lock so the output pump cannot interleave a live
                // chunk ahead of the replay.
                if let Some(timer) = inner.orphan_timer.take() {
                    timer.cancel();
                }
                if let Some(old_tx) = inner.client_tx.take() {
                    let _ = old_tx.try_send(Outbound::Close {
                        code: close::NORMAL,
                        reason: "session resumed on another connection".to_string(),
                    });
                }
                inner.conn_epoch += 1;
                let epoch = inner.conn_epoch;
                inner.touch();

                queue_control(client_tx, &ServerFrame::hello(session_id.as_str()));
                // Replay is awaited, not fire-and-forget: the buffer
                // may hold more chunks than the client queue and none
                // of them may be dropped. The session lock stays held,
                // so the pump cannot interleave a live byte. If the
                // client vanishes mid-replay, the undelivered
                // remainder goes back into the buffer for the next
                // resume.
                let mut replay = inner.output.drain().into_iter();
                while let Some(chunk) = replay.next() {
                    if let Err(failed) = client_tx.send(Outbound::Binary(chunk)).await {
                        debug!("client gone during replay for session {}", short_id(&session_id));
                        if let Outbound::Binary(chunk) = failed.0 {
                            inner.output.push(chunk);
                        }
                        for rest in replay {
                            inner.output.push(rest);
                        }
                        break;
                    }
                }
                inner.client_tx = Some(client_tx.clone());
                drop(inner);

                self.purge_placeholder(&placeholder).await;
                info!("session {} resumed in-process", short_id(&session_id));
                return Some((existing, epoch));
            }
            drop(inner);
        }

        // Not in this process's registry: look for a labeled container
        // left by a prior server instance.
        match self.supervisor.find_session_container(&session_id).await {
            Ok(Some(found)) => {
                if !constant_time_eq(&found.credential_hash, &presented) {
                    warn!(
                        "credential mismatch on cross-process resume for session {}",
                        short_id(&session_id)
                    );
                    self.alerts.credential_mismatches.fetch_add(1, Ordering::Relaxed);
                    self.reject(
                        &placeholder,
                        client_tx,
                        close::INVALID_CREDENTIALS,
                        "credentials do not match session",
                    )
                    .await;
                    return None;
                }
                self.rehydrate(placeholder, session_id, presented, found.container_id, client_tx)
                    .await
            }
            Ok(None) => {
                debug!(
                    "resume target {} not found, falling through to fresh session",
                    short_id(&session_id)
                );
                self.handle_fresh(placeholder, credentials, env, client_tx).await
            }
            Err(e) => {
                warn!("cross-process resume discovery failed: {}", e);
                self.handle_fresh(placeholder, credentials, env, client_tx).await
            }
        }
    }

    /// Rebuild a session object around a container created by a prior
    /// server process.
    async fn rehydrate(
        self: &Arc<Self>,
        placeholder: Arc<Session>,
        session_id: String,
        credential_hash: String,
        container_id: String,
        client_tx: &mpsc::Sender<Outbound>,
    ) -> Option<(Arc<Session>, u64)> {
        match self.supervisor.inspect_state(&container_id).await {
            Ok(Some(state)) if state.is_running() => {}
            Ok(Some(_)) => {
                if let Err(e) = self.supervisor.start_container(&container_id).await {
                    error!("failed to restart container for resumed session {}: {}", short_id(&session_id), e);
                    if let Err(e) = self.supervisor.remove_container(&container_id, true, true).await {
                        warn!("failed to remove unrestartable container {}: {}", container_id, e);
                    }
                    self.reject(
                        &placeholder,
                        client_tx,
                        close::INTERNAL_ERROR,
                        "failed to restore session environment",
                    )
                    .await;
                    return None;
                }
            }
            Ok(None) | Err(_) => {
                self.reject(
                    &placeholder,
                    client_tx,
                    close::INTERNAL_ERROR,
                    "failed to restore session environment",
                )
                .await;
                return None;
            }
        }

        self.purge_placeholder(&placeholder).await;

        let session = Arc::new(Session::new(
            session_id.clone(),
            self.settings.output_buffer_bytes,
        ));
        {
            let mut inner = session.inner.lock().await;
            inner.authenticated = true;
            inner.credential_hash = Some(credential_hash);
            inner.container_id = Some(container_id);
            inner.conn_epoch = 1;
            inner.client_tx = Some(client_tx.clone());
        }
        self.registry.insert(session.clone());

        if let Err(e) = self.attach_session(&session).await {
            error!("attach failed for resumed session {}: {}", short_id(&session_id), e);
            self.terminate_session(
                &session_id,
                Some((close::INTERNAL_ERROR, "failed to restore session environment")),
            )
            .await;
            return None;
        }

        queue_control(client_tx, &ServerFrame::hello(session_id.as_str()));
        info!("session {} resumed across processes", short_id(&session_id));
        Some((session, 1))
    }

    async fn handle_fresh(
        self: &Arc<Self>,
        placeholder: Arc<Session>,
        credentials: Credentials,
        env: std::collections::HashMap<String, String>,
        client_tx: &mpsc::Sender<Outbound>,
    ) -> Option<(Arc<Session>, u64)> {
        if credentials.is_empty() {
            self.reject(&placeholder, client_tx, close::POLICY_VIOLATION, "missing credentials")
                .await;
            return None;
        }
        if let Err(e) = self.validator.validate(&credentials) {
            debug!("authentication failed for session {}: {}", short_id(&placeholder.id), e);
            self.reject(&placeholder, client_tx, close::INVALID_CREDENTIALS, "invalid credentials")
                .await;
            return None;
        }
        let hash = credential_hash(&credentials);

        let epoch = {
            let mut inner = placeholder.inner.lock().await;
            if inner.closed {
                // Auth timer fired while we were validating.
                return None;
            }
            // Cancel-on-success: the auth timeout must never outlive a
            // successful authentication.
            if let Some(timer) = inner.auth_timer.take() {
                timer.cancel();
            }
            inner.authenticated = true;
            inner.credential_hash = Some(hash.clone());
            inner.conn_epoch += 1;
            inner.client_tx = Some(client_tx.clone());
            inner.touch();
            inner.conn_epoch
        };

        let spec = SessionContainerSpec {
            session_id: placeholder.id.clone(),
            credential_hash: hash,
            env,
        };
        let container_id = match self.supervisor.create_session_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                // Engine detail stays in the log; the client gets a
                // generic failure.
                error!("container create failed for session {}: {}", short_id(&placeholder.id), e);
                self.fail_provisioning(&placeholder, client_tx).await;
                return None;
            }
        };
        placeholder.inner.lock().await.container_id = Some(container_id.clone());

        if let Err(e) = self.supervisor.start_container(&container_id).await {
            error!("container start failed for session {}: {}", short_id(&placeholder.id), e);
            self.fail_provisioning(&placeholder, client_tx).await;
            return None;
        }
        self.spawn_start_monitor(placeholder.id.clone(), container_id);

        if let Err(e) = self.attach_session(&placeholder).await {
            error!("attach failed for session {}: {}", short_id(&placeholder.id), e);
            self.terminate_session(
                &placeholder.id,
                Some((close::INTERNAL_ERROR, "failed to create session environment")),
            )
            .await;
            return None;
        }

        queue_control(client_tx, &ServerFrame::hello(placeholder.id.as_str()));
        info!("session {} established", short_id(&placeholder.id));
        Some((placeholder, epoch))
    }

    /// Inspect the container shortly after start; a shell that exited
    /// immediately surfaces as a terminated session with the exit code
    /// logged as the diagnosis.
    fn spawn_start_monitor(self: &Arc<Self>, session_id: String, container_id: String) {
        let ctl = self.clone();
        let delay = Duration::from_secs(self.settings.start_monitor_delay_secs);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match ctl.supervisor.inspect_state(&container_id).await {
                Ok(Some(state)) if state.has_exited() => {
                    error!(
                        "container for session {} exited immediately (code {})",
                        short_id(&session_id),
                        state.exit_code
                    );
                    ctl.terminate_session(
                        &session_id,
                        Some((close::INTERNAL_ERROR, "session environment exited")),
                    )
                    .await;
                }
                Ok(_) => {}
                Err(e) => warn!("post-start inspect failed for session {}: {}", short_id(&session_id), e),
            }
        });
    }

    /// Route a steady-state inbound frame to the container's stdin.
    /// `epoch` is the connection epoch under which the calling socket
    /// holds the session; a stale epoch means a resume already took
    /// the session over, and the superseded socket's input must never
    /// reach the shell. Returns false when the connection loop should
    /// stop.
    pub async fn handle_frame(&self, session: &Arc<Session>, epoch: u64, data: Bytes) -> bool {
        let oversized = data.len() > self.settings.max_message_bytes;
        let stdin_tx = {
            let mut inner = session.inner.lock().await;
            if inner.closed || inner.conn_epoch != epoch {
                debug!(
                    "dropping frame from superseded connection to session {}",
                    short_id(&session.id)
                );
                return false;
            }
            if oversized {
                None
            } else {
                inner.touch();
                inner.stdin_tx.clone()
            }
        };

        if oversized {
            self.alerts.oversized_messages.fetch_add(1, Ordering::Relaxed);
            warn!(
                "terminating session {}: frame of {} bytes exceeds ceiling",
                short_id(&session.id),
                data.len()
            );
            self.terminate_session(&session.id, Some((close::MESSAGE_TOO_LARGE, "message too large")))
                .await;
            return false;
        }
        match stdin_tx {
            Some(tx) => {
                if tx.send(data).await.is_err() {
                    self.terminate_session(
                        &session.id,
                        Some((close::INTERNAL_ERROR, "session stream closed")),
                    )
                    .await;
                    return false;
                }
                true
            }
            None => {
                debug!("dropping frame for unattached session {}", short_id(&session.id));
                true
            }
        }
    }

    /// Socket lost before the auth message arrived: nothing worth
    /// preserving.
    pub async fn handle_preauth_disconnect(&self, placeholder: Arc<Session>) {
        self.purge_placeholder(&placeholder).await;
    }

    /// Socket lost after establishment: hold the session and its
    /// container for the orphan grace window instead of destroying
    /// state. `epoch` is the connection epoch under which the calling
    /// socket held the session; a stale epoch means a resume already
    /// superseded this socket and the disconnect is a no-op.
    pub async fn handle_disconnect(self: &Arc<Self>, session: Arc<Session>, epoch: u64) {
        let mut inner = session.inner.lock().await;
        if inner.closed || inner.conn_epoch != epoch {
            return;
        }
        if !inner.authenticated {
            drop(inner);
            self.purge_placeholder(&session).await;
            return;
        }
        inner.client_tx = None;
        let grace = self.settings.orphan_grace_secs;
        info!(
            "session {} disconnected, holding for resume ({}s)",
            short_id(&session.id),
            grace
        );
        let ctl = self.clone();
        let session_id = session.id.clone();
        inner.orphan_timer = Some(ScheduledTimer::schedule(
            Duration::from_secs(grace),
            async move {
                info!("orphan grace elapsed for session {}", short_id(&session_id));
                ctl.terminate_session(&session_id, None).await;
            },
        ));
    }

    /// Full teardown: registry purge, timers cancelled, client closed,
    /// container removed. Idempotent.
    pub async fn terminate_session(&self, id: &str, close: Option<(u16, &str)>) {
        let Some(session) = self.registry.remove(id) else {
            return;
        };
        let (client_tx, container_id) = {
            let mut inner = session.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.cancel_timers();
            inner.stdin_tx = None;
            (inner.client_tx.take(), inner.container_id.take())
        };

        if let Some(tx) = client_tx
            && let Some((code, reason)) = close
        {
            queue_control(&tx, &ServerFrame::error(reason));
            let _ = tx
                .send(Outbound::Close {
                    code,
                    reason: reason.to_string(),
                })
                .await;
        }

        if let Some(container_id) = container_id
            && let Err(e) = self.supervisor.remove_container(&container_id, true, true).await
        {
            warn!("failed to remove container for session {}: {}", short_id(id), e);
        }
        debug!("session {} terminated", short_id(id));
    }

    /// Generic provisioning failure: the engine error was already
    /// logged; the client only learns that environment creation failed.
    async fn fail_provisioning(&self, session: &Arc<Session>, client_tx: &mpsc::Sender<Outbound>) {
        queue_control(client_tx, &ServerFrame::error("failed to create session environment"));
        let _ = client_tx
            .send(Outbound::Close {
                code: close::INTERNAL_ERROR,
                reason: "failed to create session environment".to_string(),
            })
            .await;
        self.terminate_session(&session.id, None).await;
    }

    async fn reject(
        &self,
        placeholder: &Arc<Session>,
        client_tx: &mpsc::Sender<Outbound>,
        code: u16,
        reason: &str,
    ) {
        self.purge_placeholder(placeholder).await;
        close_with(client_tx, code, reason).await;
    }

    async fn purge_placeholder(&self, placeholder: &Arc<Session>) {
        self.registry.remove(&placeholder.id);
        let mut inner = placeholder.inner.lock().await;
        inner.closed = true;
        inner.cancel_timers();
        inner.client_tx = None;
    }

    /// Periodically end sessions idle beyond the configured maximum.
    pub fn spawn_idle_reaper(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let idle = self.settings.idle_timeout_secs;
        if idle == 0 {
            return None;
        }
        let ctl = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(idle.min(60)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = Duration::from_secs(idle);
                for session in ctl.registry.values() {
                    let expired = {
                        let inner = session.inner.lock().await;
                        inner.authenticated && !inner.closed && inner.last_activity.elapsed() >= cutoff
                    };
                    if expired {
                        info!("session {} idle beyond {}s, ending", short_id(&session.id), idle);
                        ctl.terminate_session(&session.id, Some((close::NORMAL, "idle timeout")))
                            .await;
                    }
                }
            }
        }))
    }

    /// Stop admitting connections, close every live socket, and remove
    /// all containers with bounded concurrency. The caller enforces the
    /// overall grace deadline.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let sessions = self.registry.values();
        info!("shutting down, terminating {} session(s)", sessions.len());

        let mut container_ids = Vec::new();
        for session in sessions {
            self.registry.remove(&session.id);
            let mut inner = session.inner.lock().await;
            if inner.closed {
                continue;
            }
            inner.closed = true;
            inner.cancel_timers();
            inner.stdin_tx = None;
            if let Some(tx) = inner.client_tx.take() {
                queue_control(&tx, &ServerFrame::error("server is shutting down"));
                let _ = tx.try_send(Outbound::Close {
                    code: close::TRY_AGAIN_LATER,
                    reason: "server shutting down".to_string(),
                });
            }
            if let Some(container_id) = inner.container_id.take() {
                container_ids.push(container_id);
            }
        }

        if !container_ids.is_empty() {
            let removed = container::bulk_remove(
                self.supervisor.as_ref(),
                container_ids,
                self.settings.cleanup_concurrency,
            )
            .await;
            info!("removed {} container(s) during shutdown", removed);
        }
    }
}

/// Best-effort notify: queue a control frame, swallowing failure with
/// a debug log. The socket may already be gone; that is not an error.
pub(crate) fn queue_control(tx: &mpsc::Sender<Outbound>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            if tx.try_send(Outbound::Text(json)).is_err() {
                debug!("client queue unavailable, dropping control frame");
            }
        }
        Err(e) => debug!("failed to serialize control frame: {}", e),
    }
}

async fn close_with(tx: &mpsc::Sender<Outbound>, code: u16, reason: &str) {
    queue_control(tx, &ServerFrame::error(reason));
    let _ = tx
        .send(Outbound::Close {
            code,
            reason: reason.to_string(),
        })
        .await;
}
