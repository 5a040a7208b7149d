//! Repository traits for gateway persistence.

pub mod channels;
pub mod locks;
pub mod messages;

pub use channels::ChannelRepo;
pub use locks::{LockRepo, LockSession};
pub use messages::{INSERT_BATCH_ROWS, MessageRepo};
