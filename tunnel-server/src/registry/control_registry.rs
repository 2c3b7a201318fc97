use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::ControlSession;

/// Maps client identifiers to their live control session. `add` returns
/// whatever session it replaced so the caller can tell it to shut down;
/// `del` only removes an entry if it still points at the caller (a session
/// cleared by replacement must not delete its successor).
pub struct ControlRegistry {
    sessions: RwLock<HashMap<String, Arc<ControlSession>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        ControlRegistry {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ControlSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn add(&self, id: String, session: Arc<ControlSession>) -> Option<Arc<ControlSession>> {
        self.sessions.write().insert(id, session)
    }

    pub fn del(&self, id: &str, expect: &Arc<ControlSession>) {
        let mut map = self.sessions.write();
        if let Some(existing) = map.get(id) {
            if Arc::ptr_eq(existing, expect) {
                map.remove(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::new()
    }
}
