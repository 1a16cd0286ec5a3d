//! Account allocation policy.

pub mod pool;

pub use pool::{AccountPool, Allocation};
