//! reelforge: job orchestration core for multi-stage video generation.
//!
//! Jobs move through generate, poll and download stages on three bounded
//! queues, leasing provider accounts from a shared pool. A stale job monitor
//! recovers work that stopped making progress.

pub mod accounts;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod store;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};
