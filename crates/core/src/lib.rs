pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod job;
pub mod metrics;
pub mod persistence;
pub mod recovery;
pub mod renderer;
pub mod resources;
pub mod scheduler;
pub mod testing;
pub mod worker;

pub use batch::{BatchSpec, BatchState, BatchView, FailPolicy};
pub use config::{load_config, load_config_from_str, validate_config, Config, ConfigError};
pub use engine::{EngineStatus, RecoveryReport, RenderEngine};
pub use error::SchedulerError;
pub use estimator::{Estimate, ShapeSignature};
pub use job::{Job, JobFilter, JobSpec, JobState, JobView, Priority, RenderKind};
pub use persistence::{
    create_persistence_system, Persistence, PersistenceError, PersistenceHandle,
    SqlitePersistence,
};
pub use renderer::{ProcessRenderer, RenderError, Renderer};
pub use resources::{ResourceMonitor, ResourceStatus};
pub use scheduler::CancelOutcome;
