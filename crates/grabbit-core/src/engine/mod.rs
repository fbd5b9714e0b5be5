//! Download engine
//!
//! - `worker`: streams one task to a `.part` file, publishing progress
//! - `pool`: bounded concurrency over an intake queue

mod pool;
mod worker;

pub use pool::*;
pub use worker::*;
