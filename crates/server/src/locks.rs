//! Named advisory locks on top of a store lock session.

use crate::error::{SyncError, SyncResult};
use crate::metrics;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tgsync_core::hash_key;
use tgsync_store::{LockRepo, LockSession};

/// Interval between attempts in [`LockManager::acquire`].
pub const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
enum Slot {
    /// A try-lock for this id is in progress.
    Pending,
    Held(String),
}

/// Tracks the locks one process holds through a single lock session.
///
/// PostgreSQL advisory locks are re-entrant within a session, so two tasks
/// sharing the session would both "win" the same lock. The manager reserves
/// the lock id before asking the database, which makes a second attempt on
/// the same key (or on a key whose id collides) lose in-process as well.
pub struct LockManager {
    session: Box<dyn LockSession>,
    slots: Mutex<HashMap<i64, Slot>>,
}

impl LockManager {
    pub fn new(session: Box<dyn LockSession>) -> Self {
        Self {
            session,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Open a fresh lock session on `store` and bind a manager to it.
    pub async fn open<S: LockRepo + ?Sized>(store: &S) -> SyncResult<Self> {
        let session = store.lock_session().await?;
        Ok(Self::new(session))
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to take the lock for `key` without waiting.
    ///
    /// Returns `Ok(false)` when another session holds it or when this manager
    /// already holds or is acquiring it. Errors only when the database call
    /// fails.
    pub async fn try_acquire(&self, key: &str) -> SyncResult<bool> {
        let lock_id = hash_key(key);
        {
            let mut slots = self.slots();
            if slots.contains_key(&lock_id) {
                tracing::debug!(key = %key, lock_id, "Lock already held by this process");
                return Ok(false);
            }
            slots.insert(lock_id, Slot::Pending);
        }

        match self.session.try_lock(lock_id).await {
            Ok(true) => {
                self.slots().insert(lock_id, Slot::Held(key.to_string()));
                metrics::LOCKS_HELD.inc();
                tracing::debug!(key = %key, lock_id, "Acquired lock");
                Ok(true)
            }
            Ok(false) => {
                self.slots().remove(&lock_id);
                tracing::debug!(key = %key, lock_id, "Lock held elsewhere");
                Ok(false)
            }
            Err(e) => {
                self.slots().remove(&lock_id);
                Err(e.into())
            }
        }
    }

    /// Take the lock for `key`, polling until `timeout` elapses.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> SyncResult<()> {
        let started = Instant::now();
        loop {
            if self.try_acquire(key).await? {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(SyncError::LockTimeout {
                    key: key.to_string(),
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL.min(timeout - elapsed)).await;
        }
    }

    /// Release the lock for `key`. Does nothing when it is not held here.
    pub async fn release(&self, key: &str) -> SyncResult<()> {
        let lock_id = hash_key(key);
        match self.slots().get(&lock_id) {
            Some(Slot::Held(held_key)) if held_key == key => {}
            _ => return Ok(()),
        }

        let result = self.session.unlock(lock_id).await;
        self.slots().remove(&lock_id);
        metrics::LOCKS_HELD.dec();

        match result? {
            true => tracing::debug!(key = %key, lock_id, "Released lock"),
            false => tracing::warn!(
                key = %key,
                lock_id,
                backend = self.session.backend_name(),
                "Lock was not held by this session at release"
            ),
        }
        Ok(())
    }

    /// Release every lock this manager holds. Failures are logged and the
    /// remaining locks are still attempted. Returns the number released.
    pub async fn release_all(&self) -> usize {
        let keys = self.held_locks();
        let mut released = 0;
        for key in keys {
            match self.release(&key).await {
                Ok(()) => released += 1,
                Err(e) => tracing::error!(key = %key, error = %e, "Failed to release lock"),
            }
        }
        if released > 0 {
            tracing::info!(released, "Released outstanding locks");
        }
        released
    }

    /// Keys of all locks currently held.
    pub fn held_locks(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Held(key) => Some(key.clone()),
                Slot::Pending => None,
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn is_held(&self, key: &str) -> bool {
        matches!(self.slots().get(&hash_key(key)), Some(Slot::Held(k)) if k == key)
    }
}
