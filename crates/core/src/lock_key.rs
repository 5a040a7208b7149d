//! Lock keys and their integer ids.
//!
//! Advisory locks are keyed by integers, so string keys are folded with
//! 64-bit FNV-1a. The hash is unseeded: every process derives the same id for
//! the same key, which is what makes the lock shared across instances.

use crate::channel::ChannelId;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Lock key guarding synchronization of one channel.
pub fn channel_lock_key(channel_id: ChannelId) -> String {
    format!("sync:channel:{channel_id}")
}

/// Map a string key to a signed 64-bit lock id (PostgreSQL `bigint` width).
pub fn hash_key(key: &str) -> i64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}
