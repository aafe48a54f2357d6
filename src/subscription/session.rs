//! Process-wide subscription session bookkeeping: the connection cap and
//! the live session table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub connection_id: Uuid,
    pub identity_key: String,
    pub created_at: DateTime<Utc>,
}

/// Tracks live connection count against `ws_max_connections` and the table
/// of open sessions. A real deployment only needs the count for the cap
/// check; the full table is kept too since `/health` and future admin
/// endpoints may want to enumerate live sessions.
pub struct SessionTable {
    max_connections: usize,
    count: AtomicUsize,
    sessions: Mutex<HashMap<Uuid, SessionInfo>>,
}

pub struct SessionGuard<'a> {
    table: &'a SessionTable,
    pub connection_id: Uuid,
}

impl SessionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            count: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new session if under the cap. Returns `None` (caller
    /// should close with code 1008) when the process-wide cap is exceeded.
    pub fn register(&self, identity_key: String) -> Option<SessionGuard<'_>> {
        loop {
            let current = self.count.load(Ordering::SeqCst);
            if current >= self.max_connections {
                return None;
            }
            if self
                .count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let connection_id = Uuid::new_v4();
                self.sessions.lock().unwrap().insert(
                    connection_id,
                    SessionInfo {
                        connection_id,
                        identity_key,
                        created_at: Utc::now(),
                    },
                );
                metrics::gauge!(crate::metrics_registry::ACTIVE_SESSIONS)
                    .set((current + 1) as f64);
                return Some(SessionGuard {
                    table: self,
                    connection_id,
                });
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let remaining = self.table.count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.table.sessions.lock().unwrap().remove(&self.connection_id);
        metrics::gauge!(crate::metrics_registry::ACTIVE_SESSIONS).set(remaining as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_up_to_the_cap() {
        let table = SessionTable::new(2);
        let a = table.register("k".to_string());
        let b = table.register("k".to_string());
        let c = table.register("k".to_string());
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn dropping_a_guard_frees_a_slot() {
        let table = SessionTable::new(1);
        {
            let _guard = table.register("k".to_string()).unwrap();
            assert_eq!(table.live_count(), 1);
        }
        assert_eq!(table.live_count(), 0);
        assert!(table.register("k".to_string()).is_some());
    }
}
