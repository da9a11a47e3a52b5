//! Destructive-action confirmations
//!
//! Kill, restart and similar operations require a second tap within a
//! bounded window. Pending confirmations are keyed by
//! (user, action, target session) and live only in memory; a periodic
//! sweeper drops expired entries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    user_id: i64,
    action: String,
    session_id: String,
}

#[derive(Debug, Clone)]
struct Pending {
    created_at: Instant,
    ttl: Duration,
}

impl Pending {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// In-memory map of pending destructive-action confirmations.
pub struct ConfirmationManager {
    pending: Mutex<HashMap<Key, Pending>>,
    ttl: Duration,
}

impl ConfirmationManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn key(user_id: i64, action: &str, session_id: &str) -> Key {
        Key {
            user_id,
            action: action.to_string(),
            session_id: session_id.to_string(),
        }
    }

    /// Register a pending confirmation, replacing any existing entry with
    /// the same key.
    pub fn request(&self, user_id: i64, action: &str, session_id: &str) {
        let mut pending = self.pending.lock().unwrap();
        pending.insert(
            Self::key(user_id, action, session_id),
            Pending {
                created_at: Instant::now(),
                ttl: self.ttl,
            },
        );
    }

    /// Consume a pending confirmation. Returns true only when an entry
    /// exists and is within its TTL; the entry is removed either way.
    pub fn confirm(&self, user_id: i64, action: &str, session_id: &str) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match pending.remove(&Self::key(user_id, action, session_id)) {
            Some(entry) => !entry.is_expired(),
            None => false,
        }
    }

    /// Drop a pending confirmation without executing the action.
    pub fn cancel(&self, user_id: i64, action: &str, session_id: &str) -> bool {
        let mut pending = self.pending.lock().unwrap();
        pending.remove(&Self::key(user_id, action, session_id)).is_some()
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|_, entry| !entry.is_expired());
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(count = dropped, "Expired confirmations cleaned up");
        }
        dropped
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_within_ttl() {
        let mgr = ConfirmationManager::new(Duration::from_secs(30));
        mgr.request(7, "kill", "s1");
        assert!(mgr.confirm(7, "kill", "s1"));
    }

    #[test]
    fn test_confirm_is_one_shot() {
        let mgr = ConfirmationManager::new(Duration::from_secs(30));
        mgr.request(7, "kill", "s1");
        assert!(mgr.confirm(7, "kill", "s1"));
        // Second confirm for the same key fails.
        assert!(!mgr.confirm(7, "kill", "s1"));
    }

    #[test]
    fn test_expired_confirmation_rejected() {
        let mgr = ConfirmationManager::new(Duration::from_millis(0));
        mgr.request(7, "kill", "s1");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!mgr.confirm(7, "kill", "s1"));
    }

    #[test]
    fn test_key_components_all_matter() {
        let mgr = ConfirmationManager::new(Duration::from_secs(30));
        mgr.request(7, "kill", "s1");
        assert!(!mgr.confirm(8, "kill", "s1"));
        assert!(!mgr.confirm(7, "restart", "s1"));
        assert!(!mgr.confirm(7, "kill", "s2"));
        assert!(mgr.confirm(7, "kill", "s1"));
    }

    #[test]
    fn test_request_replaces_existing() {
        let mgr = ConfirmationManager::new(Duration::from_secs(30));
        mgr.request(7, "kill", "s1");
        mgr.request(7, "kill", "s1");
        assert_eq!(mgr.pending_count(), 1);
    }

    #[test]
    fn test_cancel() {
        let mgr = ConfirmationManager::new(Duration::from_secs(30));
        mgr.request(7, "kill", "s1");
        assert!(mgr.cancel(7, "kill", "s1"));
        assert!(!mgr.cancel(7, "kill", "s1"));
        assert!(!mgr.confirm(7, "kill", "s1"));
    }

    #[test]
    fn test_cleanup_expired() {
        let mgr = ConfirmationManager::new(Duration::from_millis(0));
        mgr.request(7, "kill", "s1");
        mgr.request(7, "restart", "s2");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.cleanup_expired(), 2);
        assert_eq!(mgr.pending_count(), 0);
    }
}
