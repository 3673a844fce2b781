//! Collection loop
//!
//! Drives one [`CollectorWorker`] on a fixed period until it is removed
//! from its workload, its stop signal fires or the process shuts down.

use super::{CollectorWorker, DEFAULT_MAX_SAMPLES};
use crate::health::{components, HealthRegistry};
use crate::observability::ScalerMetrics;
use crate::store::WorkloadState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for a collection loop
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Polling interval (default: 10 seconds)
    pub interval: Duration,
    /// Upper bound on a single source query (default: 5 seconds)
    pub query_timeout: Duration,
    /// Samples retained per metric, 0 for unbounded
    pub max_samples: usize,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            query_timeout: Duration::from_secs(5),
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

/// Periodically collects samples for one metric
pub struct CollectionLoop {
    worker: Arc<CollectorWorker>,
    /// Workload the worker is registered in
    state: Arc<WorkloadState>,
    config: CollectionConfig,
    metrics: ScalerMetrics,
    health: Option<HealthRegistry>,
}

impl CollectionLoop {
    pub fn new(
        worker: Arc<CollectorWorker>,
        state: Arc<WorkloadState>,
        config: CollectionConfig,
    ) -> Self {
        Self {
            worker,
            state,
            config,
            metrics: ScalerMetrics::new(),
            health: None,
        }
    }

    /// Report collection health as a `collector:<metric>` component
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until removed, stopped or shut down
    pub async fn run(
        self,
        mut stop: broadcast::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let key = self.worker.key();
        info!(
            metric = %key,
            interval_secs = self.config.interval.as_secs(),
            "Starting collection loop"
        );

        let component = components::scoped(components::COLLECTOR, &key);
        if let Some(health) = &self.health {
            health.register(&component).await;
        }

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_registered(&key) {
                        info!(metric = %key, "Collector removed from workload, stopping");
                        break;
                    }
                    self.collect_once(&key, &component).await;
                }
                _ = stop.recv() => {
                    info!(metric = %key, "Collector stopped");
                    break;
                }
                _ = shutdown.recv() => {
                    info!(metric = %key, "Shutting down collection loop");
                    break;
                }
            }
        }

        // A replacement worker under the same key owns the component now.
        if let Some(health) = &self.health {
            if !self.state.workers.contains_key(&key) {
                health.unregister(&component).await;
            }
        }
    }

    /// True while the workload still maps the key to this very worker
    fn is_registered(&self, key: &str) -> bool {
        self.state
            .workers
            .load(key)
            .map(|w| Arc::ptr_eq(&w, &self.worker))
            .unwrap_or(false)
    }

    async fn collect_once(&self, key: &str, component: &str) {
        let start = Instant::now();
        let failure = match timeout(self.config.query_timeout, self.worker.collect()).await {
            Ok(Ok(added)) => {
                debug!(
                    metric = %key,
                    added,
                    buffered = self.worker.data_cap(),
                    "Collected samples"
                );
                None
            }
            Ok(Err(e)) => {
                self.metrics.inc_collection_errors();
                warn!(metric = %key, error = %e, "Failed to collect samples");
                Some(e.to_string())
            }
            Err(_) => {
                self.metrics.inc_collection_errors();
                warn!(
                    metric = %key,
                    timeout_ms = self.config.query_timeout.as_millis() as u64,
                    "Metric query timed out"
                );
                Some("metric query timed out".to_string())
            }
        };
        self.metrics
            .observe_collection_latency(start.elapsed().as_secs_f64());

        if let Some(health) = &self.health {
            match failure {
                None => health.set_healthy(component).await,
                Some(message) => health.set_degraded(component, message).await,
            }
        }
    }
}
