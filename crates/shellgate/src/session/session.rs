use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use super::{Outbound, OutputBuffer, ScheduledTimer};

/// One logical terminal interaction.
///
/// All mutable state lives behind a single async mutex, so at most one
/// mutating operation per session runs at a time by construction. Call
/// sites never hold the lock across a container-engine call or a
/// socket send.
pub struct Session {
    pub id: String,
    pub created: DateTime<Utc>,
    pub inner: Mutex<SessionInner>,
}

pub struct SessionInner {
    pub authenticated: bool,
    /// Digest of the credential material; the sole gate authorizing
    /// resume of this session ID.
    pub credential_hash: Option<String>,
    pub container_id: Option<String>,
    /// Guards against concurrent attach operations.
    pub is_attaching: bool,
    /// Queue feeding the current connection's socket writer, if one is
    /// attached. Replaced wholesale on resume takeover.
    pub client_tx: Option<mpsc::Sender<Outbound>>,
    /// Queue feeding the container's stdin writer task, once attached.
    pub stdin_tx: Option<mpsc::Sender<Bytes>>,
    /// Output produced while no client was attached, replayed on resume.
    pub output: OutputBuffer,
    pub last_activity: Instant,
    pub auth_timer: Option<ScheduledTimer>,
    pub orphan_timer: Option<ScheduledTimer>,
    /// Bumped every time a new socket takes over this session. A
    /// superseded connection's disconnect handler compares its own
    /// epoch before scheduling an orphan-hold, so it can never orphan a
    /// session that was just resumed on a newer socket.
    pub conn_epoch: u64,
    /// Set once teardown has started; later teardown calls are no-ops.
    pub closed: bool,
}

impl Session {
    pub fn new(id: String, output_buffer_bytes: usize) -> Self {
        Self {
            id,
            created: Utc::now(),
            inner: Mutex::new(SessionInner {
                authenticated: false,
                credential_hash: None,
                container_id: None,
                is_attaching: false,
                client_tx: None,
                stdin_tx: None,
                output: OutputBuffer::new(output_buffer_bytes),
                last_activity: Instant::now(),
                auth_timer: None,
                orphan_timer: None,
                conn_epoch: 0,
                closed: false,
            }),
        }
    }
}

impl SessionInner {
    /// Cancel both scheduled timers, reporting nothing; used on every
    /// teardown path.
    pub fn cancel_timers(&mut self) {
        if let Some(t) = self.auth_timer.take() {
            t.cancel();
        }
        if let Some(t) = self.orphan_timer.take() {
            t.cancel();
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
