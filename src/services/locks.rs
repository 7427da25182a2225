use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Per-key async mutexes. Alert and incident mutations serialize on the
/// entity id so escalation, acknowledge, close and snooze never
/// interleave for the same row.
pub struct KeyedLocks {
    locks: LockMap,
}

/// Held lock for one key; releasing it drops the map entry when no other
/// task is waiting on the same key.
pub struct KeyedGuard {
    key: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self.locks.lock().unwrap();
        if let Some(entry) = locks.get(&self.key) {
            // Waiters each hold a clone while parked in lock_owned().
            if Arc::strong_count(entry) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the lock for `key`, waiting if another task holds it.
    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = lock.lock_owned().await;

        KeyedGuard {
            key: key.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("alert-1").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let g1 = locks.acquire("a").await;
        // Must not deadlock while "a" is held.
        let g2 = locks.acquire("b").await;
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn entries_are_cleaned_up_after_release() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.acquire("gone").await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
    }
}
