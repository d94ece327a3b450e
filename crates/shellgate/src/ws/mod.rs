//! WebSocket surface: wire protocol types and the connection handler.

pub mod handler;
pub mod protocol;
