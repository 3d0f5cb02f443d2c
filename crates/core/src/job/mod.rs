//! Job records, their lifecycle state machine and the owning store.

mod cancel;
mod params;
mod store;
mod types;

pub use cancel::CancelFlag;
pub use params::{OutputFormat, RenderKind, RenderParameters, PARAMETERS_SCHEMA_VERSION};
pub use store::{JobEvent, JobFilter, JobStore};
pub use types::{Job, JobSpec, JobState, JobView, Priority};
