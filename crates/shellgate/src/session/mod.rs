//! Session state and lifecycle.
//!
//! A session is one logical terminal interaction, identified by a
//! session ID and possibly spanning several physical WebSocket
//! connections over its lifetime (via resume). The registry is the
//! single-process source of truth; container labels are a secondary
//! source consulted for cross-process resume.

mod attach;
mod buffer;
mod lifecycle;
mod registry;
mod session;
mod timer;

pub use buffer::OutputBuffer;
pub use lifecycle::{Alerts, AlertsSnapshot, LifecycleController, SessionSettings};
pub use registry::SessionRegistry;
pub use session::{Session, SessionInner};
pub use timer::{ScheduledTimer, TimerState};

use bytes::Bytes;

/// Frames bound for a connection's socket writer task.
///
/// The lifecycle controller and output pump never touch the socket
/// directly; they queue frames here and the writer task owns the sink.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// JSON control frame, already serialized.
    Text(String),
    /// Raw terminal output.
    Binary(Bytes),
    /// Close the socket with a code and reason, then stop the writer.
    Close { code: u16, reason: String },
}
