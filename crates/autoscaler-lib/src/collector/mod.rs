//! Metric collection workers
//!
//! A [`CollectorWorker`] owns the sample buffer of one metric. It is filled
//! by a [`CollectionLoop`] polling a [`MetricSource`] and read by every
//! predictor attached to the metric.

mod r#loop;
mod prometheus;


pub use prometheus::PrometheusSource;
pub use r#loop::{CollectionConfig, CollectionLoop};

use crate::error::SourceError;
use crate::models::{Metric, Sample};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use async_trait::async_trait;

/// Default retention, 24 hours of samples at a 10 second interval
pub const DEFAULT_MAX_SAMPLES: usize = 8640;

/// Backend able to evaluate a metric query at a point in time
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Evaluate `expression` at `at`, returning zero or more samples
    async fn query(&self, expression: &str, at: DateTime<Utc>) -> Result<Vec<Sample>, SourceError>;
}

#[derive(Debug, Default)]
struct SampleBuffer {
    samples: VecDeque<Sample>,
    /// Number of trailing samples not yet handed out by `send`
    unsent: usize,
}

/// Buffers the samples of a single metric
pub struct CollectorWorker {
    metric: Metric,
    source: Arc<dyn MetricSource>,
    /// Retention cap, 0 keeps everything
    max_samples: usize,
    buffer: Mutex<SampleBuffer>,
}

impl std::fmt::Debug for CollectorWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorWorker")
            .field("metric", &self.metric.name)
            .field("query", &self.metric.query)
            .field("max_samples", &self.max_samples)
            .field("data_cap", &self.data_cap())
            .finish()
    }
}

impl CollectorWorker {
    pub fn new(metric: Metric, source: Arc<dyn MetricSource>, max_samples: usize) -> Self {
        Self {
            metric,
            source,
            max_samples,
            buffer: Mutex::new(SampleBuffer::default()),
        }
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Key of the metric this worker collects
    pub fn key(&self) -> String {
        self.metric.no_model_key()
    }

    fn lock(&self) -> MutexGuard<'_, SampleBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Query the source once and append whatever it returned
    ///
    /// Returns the number of samples appended.
    pub async fn collect(&self) -> Result<usize, SourceError> {
        let samples = self.source.query(&self.metric.query, Utc::now()).await?;
        Ok(self.append(samples))
    }

    /// Append samples to the buffer, evicting the oldest beyond the cap
    pub fn append(&self, samples: Vec<Sample>) -> usize {
        let added = samples.len();
        let mut buffer = self.lock();
        buffer.samples.extend(samples);
        buffer.unsent += added;

        if self.max_samples > 0 {
            while buffer.samples.len() > self.max_samples {
                buffer.samples.pop_front();
            }
        }
        buffer.unsent = buffer.unsent.min(buffer.samples.len());
        added
    }

    /// Hand out every sample not handed out before
    ///
    /// Unlike a draining send, the samples stay in the buffer: `data_cap` does
    /// not drop and `window` still sees them, because predictors read their
    /// history from the same buffer. Only the sent marker moves, so each
    /// sample is returned by `send` at most once. Retention is bounded by
    /// `max_samples` alone.
    pub fn send(&self) -> Vec<Sample> {
        let mut buffer = self.lock();
        let start = buffer.samples.len() - buffer.unsent;
        buffer.unsent = 0;
        buffer.samples.iter().skip(start).copied().collect()
    }

    /// Number of retained samples
    pub fn data_cap(&self) -> usize {
        self.lock().samples.len()
    }

    /// Copy of the last `n` retained samples, oldest first
    pub fn window(&self, n: usize) -> Option<Vec<Sample>> {
        let buffer = self.lock();
        let len = buffer.samples.len();
        if n > len {
            return None;
        }
        Some(buffer.samples.iter().skip(len - n).copied().collect())
    }

    pub fn latest(&self) -> Option<Sample> {
        self.lock().samples.back().copied()
    }
}
