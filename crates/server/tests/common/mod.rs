//! Common test utilities and fixtures.

pub mod client;
pub mod store;

#[allow(unused_imports)]
pub use client::*;
#[allow(unused_imports)]
pub use store::*;
