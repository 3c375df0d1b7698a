use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::db;
use crate::error::Result;
use crate::types::{Session, SessionKey};

/// How often the background writer snapshots dirty sessions.
const FLUSH_INTERVAL_SECS: u64 = 5;
/// Sessions idle longer than this are evicted from memory (their rows stay
/// on disk). In-flight sessions are never evicted.
const EVICT_AFTER_SECS: i64 = 30 * 60;

/// Thread-safe owner of all live sessions.
///
/// The in-memory map sits behind one mutex; individual sessions behind
/// their own, so a long turn holding its session does not block intake for
/// other conversations. Persistence is write-behind: mutations flip the
/// session's dirty bit and a background task flushes snapshots into SQLite
/// on a coarse interval — callers never block on the database.
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionKey, Arc<Mutex<Session>>>>,
    /// Session keys currently referenced by an in-flight turn; protected
    /// from eviction. Maintained by the gateway.
    in_flight: Mutex<HashSet<SessionKey>>,
    conn: Option<Mutex<Connection>>,
}

impl SessionStore {
    /// In-memory only store (tests, `courier run`).
    pub fn ephemeral() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            conn: None,
        })
    }

    /// Store backed by a SQLite file. Creates parent directories and the
    /// schema as needed, then spawns the flush loop.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        db::init_db(&conn)?;

        let store = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            conn: Some(Mutex::new(conn)),
        });

        let weak = Arc::downgrade(&store);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(FLUSH_INTERVAL_SECS));
            loop {
                tick.tick().await;
                let Some(store) = weak.upgrade() else { break };
                store.flush_dirty();
                store.evict_idle();
            }
        });

        Ok(store)
    }

    /// Return the session for this key, creating it on first contact.
    pub fn get_or_create(
        &self,
        channel: &str,
        chat_id: &str,
        user_id: &str,
    ) -> Arc<Mutex<Session>> {
        let key = SessionKey::new(channel, chat_id, user_id);
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(session = %key, "creating session");
                Arc::new(Mutex::new(Session::new(key.clone())))
            })
            .clone()
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Mutex<Session>>> {
        self.sessions.lock().unwrap().get(key).cloned()
    }

    /// Keys of all live sessions.
    pub fn list(&self) -> Vec<SessionKey> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// Mark a session as referenced by an in-flight turn (eviction-exempt).
    pub fn pin_in_flight(&self, key: &SessionKey) {
        self.in_flight.lock().unwrap().insert(key.clone());
    }

    pub fn unpin_in_flight(&self, key: &SessionKey) {
        self.in_flight.lock().unwrap().remove(key);
    }

    /// Snapshot every dirty session into SQLite and clear its dirty bit.
    pub fn flush_dirty(&self) {
        let Some(conn) = &self.conn else { return };

        let snapshots: Vec<Session> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .filter_map(|slot| {
                    let mut session = slot.lock().unwrap();
                    if session.dirty {
                        session.dirty = false;
                        Some(session.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };

        if snapshots.is_empty() {
            return;
        }

        let conn = conn.lock().unwrap();
        for session in &snapshots {
            if let Err(e) = db::flush_session(&conn, session) {
                warn!(session = %session.key, err = %e, "session flush failed");
            }
        }
        debug!(count = snapshots.len(), "flushed dirty sessions");
    }

    /// Drop sessions idle past the eviction window. Dirty or in-flight
    /// sessions are kept.
    fn evict_idle(&self) {
        let in_flight = self.in_flight.lock().unwrap().clone();
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|key, slot| {
            if in_flight.contains(key) {
                return true;
            }
            let session = slot.lock().unwrap();
            session.dirty
                || (now - session.last_active_at).num_seconds() < EVICT_AFTER_SECS
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn get_or_create_returns_same_session() {
        let store = SessionStore::ephemeral();
        let a = store.get_or_create("telegram", "c1", "u1");
        let b = store.get_or_create("telegram", "c1", "u1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_sessions() {
        let store = SessionStore::ephemeral();
        let a = store.get_or_create("telegram", "c1", "u1");
        let b = store.get_or_create("telegram", "c1", "u2");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn flush_persists_and_clears_dirty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path().join("sessions.db")).expect("open");

        let slot = store.get_or_create("telegram", "c1", "u1");
        slot.lock().unwrap().add_message(Role::User, "hello");
        store.flush_dirty();

        assert!(!slot.lock().unwrap().dirty);

        // second flush is a no-op — nothing dirty
        store.flush_dirty();
    }
}
