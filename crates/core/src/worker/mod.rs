//! Fixed-size pool of workers that pull admitted jobs and drive them
//! through a render attempt.

mod execute;
mod pool;
mod types;

pub use pool::WorkerPool;
pub use types::{PoolStatus, WorkerContext};
