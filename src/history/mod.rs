//! Bounded sample/alert history with derived statistics

pub mod log;
pub mod stats;
pub mod store;

pub use log::BoundedLog;
pub use stats::{compute_stats, StatsCache, SubjectStats};
pub use store::{AlertFilter, HistoryStore, Page, PageResult, QueryError};
