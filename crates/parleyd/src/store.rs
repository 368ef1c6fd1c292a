//! Ephemeral result store.
//!
//! Correlation id -> best available answer, for poll-based recovery when a
//! client loses its stream. Entries are TTL-bounded with a single periodic
//! sweep (no per-entry timers). For any issued correlation id, a lookup
//! during the TTL window returns either a pending placeholder or a terminal
//! answer - never silently absent while the work is still active.

use parley_common::config::StoreConfig;
use parley_common::types::NormalizedAnswer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Entry {
    answer: NormalizedAnswer,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct EphemeralStore {
    config: StoreConfig,
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl EphemeralStore {
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Register a correlation id the moment its session starts, so late
    /// pollers see "pending" rather than an empty slot.
    pub fn insert_pending(&self, id: Uuid) {
        let entry = Entry {
            answer: NormalizedAnswer::pending_placeholder(0),
            expires_at: Instant::now() + self.config.result_ttl(),
        };
        self.entries
            .lock()
            .expect("store lock poisoned")
            .insert(id, entry);
    }

    /// Overwrite the placeholder with the terminal answer. The TTL restarts:
    /// the result stays pollable for a full window after completion.
    pub fn complete(&self, id: Uuid, answer: NormalizedAnswer) {
        let entry = Entry {
            answer,
            expires_at: Instant::now() + self.config.result_ttl(),
        };
        self.entries
            .lock()
            .expect("store lock poisoned")
            .insert(id, entry);
    }

    /// Fetch the best available answer. Expired entries report as absent.
    pub fn lookup(&self, id: Uuid) -> Option<NormalizedAnswer> {
        let entries = self.entries.lock().expect("store lock poisoned");
        let entry = entries.get(&id)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.answer.clone())
    }

    /// Drop expired entries. Runs from the sweeper task.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let swept = before - entries.len();
        if swept > 0 {
            debug!("Swept {} expired ephemeral results", swept);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background sweep loop.
    pub fn spawn_sweeper(store: Arc<Self>) -> JoinHandle<()> {
        let interval = store.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store(ttl_secs: u64) -> Arc<EphemeralStore> {
        EphemeralStore::new(StoreConfig {
            result_ttl_secs: ttl_secs,
            sweep_interval_secs: 1,
        })
    }

    fn answer(text: &str) -> NormalizedAnswer {
        NormalizedAnswer {
            concise: text.to_string(),
            full: None,
            elapsed_ms: 10,
            pending: false,
        }
    }

    #[test]
    fn pending_then_terminal_lifecycle() {
        let store = store(300);
        let id = Uuid::new_v4();

        store.insert_pending(id);
        let looked_up = store.lookup(id).unwrap();
        assert!(looked_up.pending);

        store.complete(id, answer("Done."));
        let looked_up = store.lookup(id).unwrap();
        assert!(!looked_up.pending);
        assert_eq!(looked_up.concise, "Done.");
    }

    #[test]
    fn unknown_id_is_absent() {
        let store = store(300);
        assert!(store.lookup(Uuid::new_v4()).is_none());
    }

    #[test]
    fn expired_entries_are_absent_and_swept() {
        let store = store(0);
        let id = Uuid::new_v4();
        store.insert_pending(id);
        std::thread::sleep(Duration::from_millis(10));

        assert!(store.lookup(id).is_none());
        assert_eq!(store.len(), 1);
        store.sweep();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn sweeper_task_collects_garbage() {
        let store = EphemeralStore::new(StoreConfig {
            result_ttl_secs: 0,
            sweep_interval_secs: 1,
        });
        store.insert_pending(Uuid::new_v4());

        let handle = EphemeralStore::spawn_sweeper(Arc::clone(&store));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(store.is_empty());
        handle.abort();
    }
}
