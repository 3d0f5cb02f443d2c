use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::samples::{HistoricalSample, SampleRing};
use super::shape::ShapeSignature;
use crate::config::EstimatorConfig;
use crate::job::{Job, JobState, OutputFormat, RenderKind, RenderParameters};

/// Fallback estimates are padded by this factor.
const FALLBACK_SAFETY_FACTOR: f64 = 1.2;
/// Sample count at which the sample term of the confidence saturates.
const CONFIDENT_SAMPLE_COUNT: f64 = 20.0;
/// Lowest weight an old sample or an inconsistent history can carry.
const MIN_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    Fallback,
    Historical,
    Live,
}

/// Time estimate with a confidence in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub seconds: f64,
    pub confidence: f64,
    /// Successful samples behind the estimate.
    pub sample_count: usize,
    pub source: EstimateSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindStatistics {
    pub samples: usize,
    pub mean_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimatorStatistics {
    pub shapes: usize,
    pub total_samples: usize,
    pub successful_samples: usize,
    pub success_rate: f64,
    /// Over successful samples only.
    pub per_kind: BTreeMap<RenderKind, KindStatistics>,
}

struct LiveProgress {
    started: Instant,
    progress: f32,
}

pub struct Estimator {
    config: EstimatorConfig,
    history: RwLock<HashMap<ShapeSignature, SampleRing>>,
    live: RwLock<HashMap<String, LiveProgress>>,
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            history: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
        }
    }

    fn floor(&self) -> f64 {
        self.config.fallback_confidence
    }

    // =========================================================================
    // History
    // =========================================================================

    pub fn record(&self, sample: HistoricalSample) {
        let capacity = self.config.samples_per_shape;
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sample.shape)
            .or_insert_with(|| SampleRing::new(capacity))
            .push(sample);
    }

    pub fn sample_count(&self, shape: &ShapeSignature) -> usize {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(shape)
            .map(SampleRing::len)
            .unwrap_or(0)
    }

    /// Expected total duration for a shape. Fallback values use the bucket's upper bounds.
    pub fn estimate(&self, shape: &ShapeSignature) -> Estimate {
        let fallback = fallback_secs(
            shape.kind,
            shape.output_format,
            shape.duration_bucket,
            shape.payload_bucket as usize,
        );
        self.estimate_with_fallback(shape, fallback)
    }

    /// Expected total duration for concrete parameters.
    pub fn estimate_for(&self, kind: RenderKind, params: &RenderParameters) -> Estimate {
        let shape = ShapeSignature::of(kind, params);
        let fallback = fallback_secs(
            kind,
            params.output_format,
            params.duration_secs,
            params.payload_len(),
        );
        self.estimate_with_fallback(&shape, fallback)
    }

    fn estimate_with_fallback(&self, shape: &ShapeSignature, fallback: f64) -> Estimate {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let observations: Vec<(f64, f64)> = history
            .get(shape)
            .map(|ring| {
                ring.successful()
                    .map(|s| (s.observed_secs, self.recency_weight(s.recorded_at, now)))
                    .collect()
            })
            .unwrap_or_default();
        drop(history);

        if observations.len() < self.config.min_samples.max(1) {
            return Estimate {
                seconds: fallback,
                confidence: self.floor(),
                sample_count: observations.len(),
                source: EstimateSource::Fallback,
            };
        }

        let total_weight: f64 = observations.iter().map(|(_, w)| w).sum();
        let mean = observations.iter().map(|(x, w)| x * w).sum::<f64>() / total_weight;
        let variance = observations
            .iter()
            .map(|(x, w)| w * (x - mean).powi(2))
            .sum::<f64>()
            / total_weight;
        let cv = if mean > 0.0 {
            variance.sqrt() / mean
        } else {
            0.0
        };

        Estimate {
            seconds: mean,
            confidence: self.historical_confidence(observations.len(), cv),
            sample_count: observations.len(),
            source: EstimateSource::Historical,
        }
    }

    /// `floor + (1 - floor) * min(1, n / 20) * max(0.1, 1 - cv)`.
    pub fn historical_confidence(&self, samples: usize, cv: f64) -> f64 {
        let floor = self.floor();
        let sample_factor = (samples as f64 / CONFIDENT_SAMPLE_COUNT).min(1.0);
        let consistency = (1.0 - cv).max(MIN_WEIGHT);
        (floor + (1.0 - floor) * sample_factor * consistency).clamp(0.0, 1.0)
    }

    fn recency_weight(&self, recorded_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let retention_secs = f64::from(self.config.retention_days.max(1)) * 86_400.0;
        let age_secs = (now - recorded_at).num_seconds().max(0) as f64;
        (1.0 - age_secs / retention_secs).max(MIN_WEIGHT)
    }

    // =========================================================================
    // Live progress
    // =========================================================================

    pub fn track_start(&self, job_id: &str) {
        self.live.write().unwrap_or_else(PoisonError::into_inner).insert(
            job_id.to_string(),
            LiveProgress {
                started: Instant::now(),
                progress: 0.0,
            },
        );
    }

    pub fn observe_progress(&self, job_id: &str, percent: f32) {
        if let Some(live) = self
            .live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(job_id)
        {
            live.progress = live.progress.max(percent.clamp(0.0, 100.0));
        }
    }

    /// Stop tracking and return how long the attempt ran.
    pub fn track_end(&self, job_id: &str) -> Option<Duration> {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id)
            .map(|live| live.started.elapsed())
    }

    /// Remaining time for a job. `None` once it is terminal.
    pub fn remaining(&self, job: &Job) -> Option<Estimate> {
        if job.state.is_terminal() {
            return None;
        }
        let total = self.estimate_for(job.kind, &job.parameters);

        if job.state == JobState::Queued {
            return Some(total);
        }
        if let Some(next_attempt_at) = job.next_attempt_at {
            let wait = (next_attempt_at - Utc::now()).num_milliseconds().max(0) as f64 / 1000.0;
            return Some(Estimate {
                seconds: total.seconds + wait,
                ..total
            });
        }

        let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
        let (progress, elapsed) = match live.get(&job.id) {
            Some(l) => (
                l.progress.max(job.progress),
                l.started.elapsed().as_secs_f64(),
            ),
            None => {
                let elapsed = job
                    .started_at
                    .map(|t| (Utc::now() - t).num_milliseconds().max(0) as f64 / 1000.0)
                    .unwrap_or(0.0);
                (job.progress, elapsed)
            }
        };
        Some(blend(&total, progress, elapsed))
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn statistics(&self) -> EstimatorStatistics {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        let mut total_samples = 0;
        let mut successful_samples = 0;
        let mut per_kind: BTreeMap<RenderKind, KindStatistics> = BTreeMap::new();

        for ring in history.values() {
            total_samples += ring.len();
            for sample in ring.successful() {
                successful_samples += 1;
                let stats = per_kind.entry(sample.shape.kind).or_insert(KindStatistics {
                    samples: 0,
                    mean_secs: 0.0,
                    min_secs: f64::INFINITY,
                    max_secs: 0.0,
                });
                stats.samples += 1;
                // Running mean.
                stats.mean_secs += (sample.observed_secs - stats.mean_secs) / stats.samples as f64;
                stats.min_secs = stats.min_secs.min(sample.observed_secs);
                stats.max_secs = stats.max_secs.max(sample.observed_secs);
            }
        }

        EstimatorStatistics {
            shapes: history.len(),
            total_samples,
            successful_samples,
            success_rate: if total_samples == 0 {
                0.0
            } else {
                successful_samples as f64 / total_samples as f64
            },
            per_kind,
        }
    }
}

/// Weighted blend of a historical total with live progress.
///
/// With `f = progress / 100` and `e` seconds elapsed, the live extrapolation
/// `e * (1 - f) / f` is weighted by `f` and the historical remainder
/// `total * (1 - f)` by `1 - f`. Confidence rises linearly from the
/// historical value to 1 as the job approaches completion.
pub fn blend(historical: &Estimate, progress: f32, elapsed_secs: f64) -> Estimate {
    let f = f64::from(progress.clamp(0.0, 100.0)) / 100.0;
    let historical_remaining = historical.seconds * (1.0 - f);
    let seconds = if f > 0.0 && elapsed_secs > 0.0 {
        let live_remaining = elapsed_secs * (1.0 - f) / f;
        f * live_remaining + (1.0 - f) * historical_remaining
    } else {
        historical_remaining
    };

    Estimate {
        seconds: seconds.max(0.0),
        confidence: (historical.confidence + (1.0 - historical.confidence) * f).clamp(0.0, 1.0),
        sample_count: historical.sample_count,
        source: if f > 0.0 {
            EstimateSource::Live
        } else {
            historical.source
        },
    }
}

/// Formula estimate used before enough history exists.
pub fn fallback_secs(
    kind: RenderKind,
    format: OutputFormat,
    duration_secs: u32,
    payload_len: usize,
) -> f64 {
    let duration = f64::from(duration_secs);
    let gif = format == OutputFormat::Gif;
    let base = match kind {
        RenderKind::Typing => {
            let complexity = 1.0 + (payload_len as f64 / 10_000.0) * 0.5;
            duration * if gif { 2.0 } else { 1.5 } * complexity
        }
        RenderKind::Matrix => duration * if gif { 1.8 } else { 1.2 },
    };
    base * FALLBACK_SAFETY_FACTOR
}
