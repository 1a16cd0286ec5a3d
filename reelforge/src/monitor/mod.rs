//! Background recovery for jobs that stopped making progress.

pub mod stale;

pub use stale::{STALE_REASON, StaleJobMonitor, SweepReport};
