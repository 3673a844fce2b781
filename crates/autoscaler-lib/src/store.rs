//! Shared runtime state
//!
//! Every piece of state shared between collectors, predictors and the
//! scheduler lives in a [`ConcurrentMap`]. The maps of one workload are
//! bundled in a [`WorkloadState`], and workloads are looked up through an
//! explicit [`WorkloadRegistry`] owned by the composition root.

use crate::collector::{CollectionConfig, CollectionLoop, CollectorWorker, MetricSource};
use crate::error::PredictError;
use crate::health::HealthRegistry;
use crate::models::{split_with_model_key, Metric, ModelSpec, WorkloadRef};
use crate::predictor::Predictor;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// String-keyed map safe for concurrent readers and writers
///
/// Critical sections are short and never span an `.await`.
#[derive(Debug)]
pub struct ConcurrentMap<V> {
    data: RwLock<HashMap<String, V>>,
}

impl<V> Default for ConcurrentMap<V> {
    fn default() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone> ConcurrentMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, V>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, V>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the value stored under `key`
    pub fn load(&self, key: &str) -> Option<V> {
        self.read().get(key).cloned()
    }

    /// Insert or replace a value, returning the previous one
    pub fn store(&self, key: impl Into<String>, value: V) -> Option<V> {
        self.write().insert(key.into(), value)
    }

    pub fn delete(&self, key: &str) -> Option<V> {
        self.write().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Visit every entry under one exclusive critical section
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &V),
    {
        let guard = self.write();
        for (key, value) in guard.iter() {
            visit(key, value);
        }
    }

    /// Consistent copy of all entries
    pub fn snapshot(&self) -> Vec<(String, V)> {
        let mut entries = Vec::new();
        self.range(|key, value| entries.push((key.to_string(), value.clone())));
        entries
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Per-workload bundle of shared maps
#[derive(Debug, Default)]
pub struct WorkloadState {
    /// NoModelKey -> stop signal of the collector loop
    pub collector_stops: ConcurrentMap<broadcast::Sender<()>>,
    /// NoModelKey -> metric definition
    pub metrics: ConcurrentMap<Arc<Metric>>,
    /// WithModelKey -> model definition
    pub models: ConcurrentMap<Arc<ModelSpec>>,
    /// WithModelKey -> predictor instance
    pub predictors: ConcurrentMap<Arc<Predictor>>,
    /// NoModelKey -> collector worker
    pub workers: ConcurrentMap<Arc<CollectorWorker>>,
    /// WithModelKey -> last time a training round was dispatched
    pub train_history: ConcurrentMap<Instant>,
}

impl WorkloadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the model and metric a predictor key depends on
    pub fn resolve(&self, with_model_key: &str) -> Result<(Arc<ModelSpec>, Arc<Metric>), PredictError> {
        let model = self.models.load(with_model_key).ok_or_else(|| {
            PredictError::ConfigurationSync(format!("no model registered for '{}'", with_model_key))
        })?;
        let (no_model_key, _) = split_with_model_key(with_model_key).ok_or_else(|| {
            PredictError::ConfigurationSync(format!("malformed predictor key '{}'", with_model_key))
        })?;
        let metric = self.metrics.load(no_model_key).ok_or_else(|| {
            PredictError::ConfigurationSync(format!("no metric registered for '{}'", no_model_key))
        })?;
        Ok((model, metric))
    }

    /// Register a metric, start its collector and build one predictor per model
    ///
    /// Returns the predictor keys that were installed. An already installed
    /// metric with the same key is replaced.
    pub fn install_metric(
        self: &Arc<Self>,
        metric: Metric,
        models: &[ModelSpec],
        source: Arc<dyn MetricSource>,
        config: &CollectionConfig,
        health: &HealthRegistry,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Vec<String>, PredictError> {
        let no_model_key = metric.no_model_key();
        if self.metrics.contains_key(&no_model_key) {
            self.remove_metric(&no_model_key);
        }

        let worker = Arc::new(CollectorWorker::new(
            metric.clone(),
            source,
            config.max_samples,
        ));

        // Build every predictor before touching shared state so a bad model
        // leaves nothing half-installed.
        let mut predictors = Vec::with_capacity(models.len());
        for spec in models {
            let key = metric.with_model_key(spec.tag());
            let predictor = Predictor::from_spec(key.clone(), spec, worker.clone())?;
            predictors.push((key, spec.clone(), predictor));
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        self.metrics.store(no_model_key.clone(), Arc::new(metric));
        self.workers.store(no_model_key.clone(), worker.clone());
        self.collector_stops.store(no_model_key.clone(), stop_tx);

        let mut keys = Vec::with_capacity(predictors.len());
        for (key, spec, predictor) in predictors {
            self.models.store(key.clone(), Arc::new(spec));
            self.predictors.store(key.clone(), Arc::new(predictor));
            keys.push(key);
        }

        let collection =
            CollectionLoop::new(worker, self.clone(), config.clone()).with_health(health.clone());
        tokio::spawn(collection.run(stop_rx, shutdown.subscribe()));

        info!(
            metric = %no_model_key,
            predictors = keys.len(),
            "Installed metric"
        );
        Ok(keys)
    }

    /// Stop a metric's collector and drop everything keyed by it
    pub fn remove_metric(&self, no_model_key: &str) {
        if let Some(stop) = self.collector_stops.delete(no_model_key) {
            // No receiver left means the loop already exited.
            let _ = stop.send(());
        }
        self.workers.delete(no_model_key);
        self.metrics.delete(no_model_key);

        for key in self.predictors.keys() {
            if split_with_model_key(&key).map(|(nmk, _)| nmk) == Some(no_model_key) {
                self.predictors.delete(&key);
                self.models.delete(&key);
                self.train_history.delete(&key);
                debug!(predictor = %key, "Removed predictor");
            }
        }

        info!(metric = %no_model_key, "Removed metric");
    }
}

/// Registry of workload states keyed by workload identity
#[derive(Debug, Default)]
pub struct WorkloadRegistry {
    workloads: DashMap<WorkloadRef, Arc<WorkloadState>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the state of a workload, creating it on first access
    pub fn get_or_create(&self, workload: &WorkloadRef) -> Arc<WorkloadState> {
        self.workloads
            .entry(workload.clone())
            .or_insert_with(|| Arc::new(WorkloadState::new()))
            .clone()
    }

    pub fn get(&self, workload: &WorkloadRef) -> Option<Arc<WorkloadState>> {
        self.workloads.get(workload).map(|r| r.clone())
    }

    pub fn remove(&self, workload: &WorkloadRef) -> Option<Arc<WorkloadState>> {
        self.workloads.remove(workload).map(|(_, v)| v)
    }

    pub fn snapshot(&self) -> Vec<(WorkloadRef, Arc<WorkloadState>)> {
        self.workloads
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }
}
