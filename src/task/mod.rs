//! Threads for executing work: a fixed [worker_pool::WorkerPool], and a
//!  [ticker::ScheduledTicker] that fires delayed and periodic callbacks.

pub mod ticker;
pub mod worker_pool;
