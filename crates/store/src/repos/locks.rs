//! Advisory lock sessions.
//!
//! A [`LockSession`] is one database session that holds locks. Advisory
//! locks are session-scoped, so acquire and release must go through the same
//! session: callers obtain one session per unit of work and route every
//! lock call for that work through it.

use crate::error::StoreResult;
use async_trait::async_trait;

/// Non-blocking lock primitive bound to a single database session.
#[async_trait]
pub trait LockSession: Send + Sync {
    /// Try to take the lock. Returns `false` immediately when another
    /// session holds it.
    async fn try_lock(&self, lock_id: i64) -> StoreResult<bool>;

    /// Release the lock. Returns `false` when this session did not hold it.
    async fn unlock(&self, lock_id: i64) -> StoreResult<bool>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Repository handing out lock sessions.
#[async_trait]
pub trait LockRepo: Send + Sync {
    /// Open a new lock session.
    async fn lock_session(&self) -> StoreResult<Box<dyn LockSession>>;
}
