//! HTTP surface: router construction, sidecar endpoints, shared state.

pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
