//! Confidence-scored remaining-time estimates from historical samples and live progress.

mod model;
mod samples;
mod shape;

pub use model::{Estimate, EstimateSource, Estimator, EstimatorStatistics, KindStatistics};
pub use samples::{HistoricalSample, SampleRing};
pub use shape::ShapeSignature;
