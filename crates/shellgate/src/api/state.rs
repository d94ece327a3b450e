use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::session::LifecycleController;

/// Shared state handed to every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<LifecycleController>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self {
            controller,
            started_at: Utc::now(),
        }
    }
}
