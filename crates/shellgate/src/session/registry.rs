use std::sync::Arc;

use dashmap::DashMap;

use super::Session;

/// Authoritative in-memory map from session ID to session state.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all live sessions, for monitoring and shutdown.
    pub fn values(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let registry = SessionRegistry::new();
        let session = Arc::new(Session::new("s1".to_string(), 1024));
        registry.insert(session.clone());

        assert!(registry.contains("s1"));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("s1").unwrap(), &session));

        assert!(registry.remove("s1").is_some());
        assert!(registry.get("s1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn insert_replaces_same_id() {
        let registry = SessionRegistry::new();
        registry.insert(Arc::new(Session::new("s1".to_string(), 1024)));
        let replacement = Arc::new(Session::new("s1".to_string(), 1024));
        registry.insert(replacement.clone());

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("s1").unwrap(), &replacement));
    }
}
