//! Shellgate: a terminal-session broker.
//!
//! Clients open a WebSocket, authenticate, and are handed an isolated
//! container running an interactive shell, with their I/O streamed
//! bidirectionally over the socket. Sessions survive disconnects (and
//! server restarts) through a resume protocol keyed by session ID and
//! credential hash.

pub mod api;
pub mod auth;
pub mod container;
pub mod ratelimit;
pub mod session;
pub mod ws;
