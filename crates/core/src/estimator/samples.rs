use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::shape::ShapeSignature;

/// One observed render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSample {
    pub shape: ShapeSignature,
    pub observed_secs: f64,
    pub succeeded: bool,
    pub recorded_at: DateTime<Utc>,
}

impl HistoricalSample {
    pub fn new(shape: ShapeSignature, observed_secs: f64, succeeded: bool) -> Self {
        Self {
            shape,
            observed_secs,
            succeeded,
            recorded_at: Utc::now(),
        }
    }
}

/// Fixed-capacity buffer; pushing into a full ring evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: VecDeque<HistoricalSample>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: HistoricalSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoricalSample> {
        self.samples.iter()
    }

    pub fn successful(&self) -> impl Iterator<Item = &HistoricalSample> {
        self.samples.iter().filter(|s| s.succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{RenderKind, RenderParameters};

    #[test]
    fn test_ring_evicts_oldest() {
        let shape = ShapeSignature::of(
            RenderKind::Matrix,
            &RenderParameters::defaults(RenderKind::Matrix),
        );
        let mut ring = SampleRing::new(200);
        for i in 0..250 {
            ring.push(HistoricalSample::new(shape, i as f64, i % 2 == 0));
        }
        assert_eq!(ring.len(), 200);
        assert_eq!(ring.iter().next().map(|s| s.observed_secs), Some(50.0));
        assert_eq!(ring.successful().count(), 100);
    }
}
