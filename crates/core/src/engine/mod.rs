//! The public face of the render engine: wires the job store, scheduler,
//! worker pool, batch orchestrator, estimator and recovery strategist.

mod service;
mod types;

pub use service::RenderEngine;
pub use types::{EngineStatus, RecoveryReport};
