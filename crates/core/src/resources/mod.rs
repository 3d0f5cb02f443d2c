//! Host resource pressure and the admission limits it imposes.

mod monitor;
mod types;

pub use monitor::ResourceMonitor;
pub use types::{ResourceSnapshot, ResourceStatus};
