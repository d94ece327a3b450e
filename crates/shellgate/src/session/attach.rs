//! Stream attachment: binds a session to its container's interactive
//! stream via a single pump task that owns both stream halves.
//!
//! The pump owns the attach guard, so the engine-side attach child is
//! killed exactly when the pump exits. Detaching never affects the
//! container itself.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::container::ContainerError;
use crate::ratelimit::short_id;
use crate::ws::protocol::close;

use super::{LifecycleController, Outbound, Session};

const READ_CHUNK: usize = 8192;
const STDIN_QUEUE_DEPTH: usize = 64;

impl LifecycleController {
    /// Open the container's interactive stream and start the I/O pump.
    ///
    /// `is_attaching` guards against concurrent attaches. Output chunks
    /// are forwarded to the current client under the session lock, or
    /// captured in the replay buffer while no client is attached. When
    /// the stream ends (shell exit, engine death) the pump tears the
    /// session down.
    pub(crate) async fn attach_session(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> Result<(), ContainerError> {
        let container_id = {
            let mut inner = session.inner.lock().await;
            if inner.is_attaching {
                return Err(ContainerError::InvalidInput(
                    "attach already in progress".to_string(),
                ));
            }
            let Some(container_id) = inner.container_id.clone() else {
                return Err(ContainerError::ContainerNotFound(session.id.clone()));
            };
            inner.is_attaching = true;
            container_id
        };

        let stream = match self.supervisor.attach(&container_id).await {
            Ok(stream) => stream,
            Err(e) => {
                session.inner.lock().await.is_attaching = false;
                return Err(e);
            }
        };

        let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(STDIN_QUEUE_DEPTH);

        {
            let mut inner = session.inner.lock().await;
            inner.is_attaching = false;
            if inner.closed {
                // Torn down while we were attaching; dropping stdin_tx
                // makes the pump exit immediately.
                return Err(ContainerError::InvalidInput("session already closed".to_string()));
            }
            inner.stdin_tx = Some(stdin_tx);
        }

        self.spawn_pump(session.clone(), stream, stdin_rx);
        Ok(())
    }

    fn spawn_pump(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut stream: crate::container::AttachedStream,
        mut stdin_rx: mpsc::Receiver<Bytes>,
    ) {
        let ctl = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                tokio::select! {
                    chunk = stdin_rx.recv() => {
                        match chunk {
                            Some(bytes) => {
                                if stream.stdin.write_all(&bytes).await.is_err() {
                                    break;
                                }
                                let _ = stream.stdin.flush().await;
                            }
                            // Sender dropped: the session is tearing down.
                            None => return,
                        }
                    }
                    read = stream.stdout.read(&mut buf) => {
                        match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let chunk = Bytes::copy_from_slice(&buf[..n]);
                                deliver_output(&session, chunk).await;
                            }
                        }
                    }
                }
            }

            info!("stream ended for session {}", short_id(&session.id));
            ctl.terminate_session(&session.id, Some((close::INTERNAL_ERROR, "session stream ended")))
                .await;
        });
    }
}

/// Forward one output chunk to the attached client, or capture it for
/// replay while disconnected. Runs under the session lock so replay
/// ordering on resume is structural, not timing-dependent.
async fn deliver_output(session: &Arc<Session>, chunk: Bytes) {
    let mut inner = session.inner.lock().await;
    let Some(tx) = inner.client_tx.clone() else {
        inner.output.push(chunk);
        return;
    };
    match tx.try_send(Outbound::Binary(chunk)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Named policy: a client that cannot keep up loses frames
            // rather than stalling the container stream.
            debug!("client queue full, dropping output for session {}", short_id(&session.id));
        }
        Err(mpsc::error::TrySendError::Closed(frame)) => {
            // Writer already gone; keep the bytes for a resume.
            if let Outbound::Binary(chunk) = frame {
                inner.client_tx = None;
                inner.output.push(chunk);
            }
        }
    }
}
