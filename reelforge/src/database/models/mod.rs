//! Row models mapping SQLite rows to domain records.

pub mod account;
pub mod job;

pub use account::AccountRow;
pub use job::JobRow;
