//! Process-wide name registry and connection registry (§3, §4.3, §5).
//!
//! Grounded on `examples/original_source/server/src/server.c`'s
//! `g_active_names`/`g_active_fds`/`g_active_tokens` arrays and
//! `active_name_*` functions, reshaped from fixed-size parallel arrays
//! guarded by one mutex into a `HashMap` guarded by one `std::sync::Mutex`
//! — same single-lock discipline, idiomatic container.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;

use crate::conn::ConnId;
use crate::error::RegistryError;

struct NameEntry {
    conn_id: ConnId,
    token: u64,
    back_requested: bool,
}

/// Reserved player names, each bound to the socket identity of its current
/// session and a generational token (§4.3). The `(token, remove_if_token)`
/// pair makes session cleanup idempotent under reconnects: a late cleanup
/// by a superseded session can never evict the session that replaced it.
pub struct NameRegistry {
    entries: Mutex<HashMap<String, NameEntry>>,
    capacity: usize,
    next_token: AtomicU64,
}

impl NameRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), capacity, next_token: AtomicU64::new(1) }
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    pub fn add(&self, name: &str) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(name) {
            return Ok(());
        }
        if entries.len() >= self.capacity {
            return Err(RegistryError::Capacity);
        }
        entries.insert(
            name.to_string(),
            NameEntry { conn_id: ConnId::placeholder(), token: 0, back_requested: false },
        );
        Ok(())
    }

    /// Bind `name` to `conn_id`, allocating the next generational token.
    /// Returns `None` if `name` was never reserved with [`Self::add`].
    pub fn bind(&self, name: &str, conn_id: ConnId) -> Option<u64> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(name)?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        entry.conn_id = conn_id;
        entry.token = token;
        entry.back_requested = false;
        Some(token)
    }

    /// Remove `name` only if its stored token still equals `token` — an
    /// older session's delayed cleanup is a no-op once superseded.
    pub fn remove_if_token(&self, name: &str, token: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(name).map(|e| e.token) == Some(token) {
            entries.remove(name);
            true
        } else {
            false
        }
    }

    /// Mark a pending "return to lobby" request for `name`, guarded by the
    /// caller's connection identity (pass `None` to skip the fd check).
    pub fn mark_back(&self, name: &str, conn_id: Option<ConnId>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(name) {
            Some(e) if conn_id.is_none_or(|id| id == e.conn_id) => {
                e.back_requested = true;
                true
            }
            _ => false,
        }
    }

    /// Atomically test-and-clear the back-request flag for `name`.
    pub fn take_back(&self, name: &str, conn_id: Option<ConnId>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(name) {
            Some(e) if e.back_requested && conn_id.is_none_or(|id| id == e.conn_id) => {
                e.back_requested = false;
                true
            }
            _ => false,
        }
    }
}

/// Live client sockets, tracked only so the acceptor can broadcast a
/// shutdown notification to every connection (§5). Delivery itself is a
/// `watch` channel: every registered connection holds a receiver and
/// selects on it, which is the idiomatic tokio analogue of the original's
/// "snapshot the fd list, send to each" broadcast loop.
pub struct ConnectionRegistry {
    live: Mutex<HashSet<ConnId>>,
    shutdown_tx: watch::Sender<Option<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _rx) = watch::channel(None);
        Self { live: Mutex::new(HashSet::new()), shutdown_tx }
    }

    pub fn register(&self, id: ConnId) {
        self.live.lock().unwrap().insert(id);
    }

    pub fn unregister(&self, id: ConnId) {
        self.live.lock().unwrap().remove(&id);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.shutdown_tx.subscribe()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn broadcast_shutdown(&self, reason: &str) {
        let _ = self.shutdown_tx.send(Some(reason.to_string()));
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// `NameEntry` is created with a placeholder id before the first `bind`
// call; `add` and `bind` are always called back-to-back by the same
// session, so the placeholder is never observed by another task.
impl ConnId {
    fn placeholder() -> ConnId {
        ConnId::from_raw(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(n: u64) -> ConnId {
        ConnId::from_raw(n)
    }

    #[test]
    fn at_most_one_entry_per_name() {
        let reg = NameRegistry::new(8);
        reg.add("alice").unwrap();
        assert!(reg.has("alice"));
        // Re-adding the same name while still reserved is a harmless no-op,
        // not a duplicate entry or capacity error.
        reg.add("alice").unwrap();
    }

    #[test]
    fn capacity_is_enforced() {
        let reg = NameRegistry::new(1);
        reg.add("alice").unwrap();
        assert_eq!(reg.add("bob"), Err(RegistryError::Capacity));
    }

    #[test]
    fn reconnect_token_protects_against_stale_cleanup() {
        let reg = NameRegistry::new(8);
        reg.add("alice").unwrap();
        let old_token = reg.bind("alice", conn(1)).unwrap();

        // Alice reconnects: a fresh bind issues a new token.
        let new_token = reg.bind("alice", conn(2)).unwrap();
        assert_ne!(old_token, new_token);

        // The old session's belated cleanup must not evict the new one.
        assert!(!reg.remove_if_token("alice", old_token));
        assert!(reg.has("alice"));

        assert!(reg.remove_if_token("alice", new_token));
        assert!(!reg.has("alice"));
    }

    #[test]
    fn mark_and_take_back_round_trip() {
        let reg = NameRegistry::new(8);
        reg.add("alice").unwrap();
        reg.bind("alice", conn(1)).unwrap();
        assert!(!reg.take_back("alice", None));
        assert!(reg.mark_back("alice", Some(conn(1))));
        assert!(reg.take_back("alice", Some(conn(1))));
        // Once taken, a second take is false until marked again.
        assert!(!reg.take_back("alice", Some(conn(1))));
    }
}
