//! Evaluation loop
//!
//! One scheduler runs per workload. Every tick it fans out one prediction per
//! registered predictor, dispatches due training rounds, folds the resulting
//! replica sequences into a single target and hands it to the [`Scaler`].

use crate::error::PredictError;
use crate::health::{components, HealthRegistry};
use crate::models::{split_with_model_key, ScaleDownConf, WorkloadRef};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::predictor::Predictor;
use crate::scaler::{ScaleAction, Scaler};
use crate::store::WorkloadState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default evaluation interval
pub const DEFAULT_EVALUATE_INTERVAL: Duration = Duration::from_secs(30);

/// Default bound on a single prediction
pub const DEFAULT_PREDICT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub predict_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_EVALUATE_INTERVAL,
            predict_timeout: DEFAULT_PREDICT_TIMEOUT,
        }
    }
}

/// What one tick produced
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Predictors that yielded a replica sequence
    pub results: usize,
    pub target: Option<i32>,
    pub action: Option<ScaleAction>,
}

pub struct Scheduler {
    state: Arc<WorkloadState>,
    scaler: Arc<Scaler>,
    config: SchedulerConfig,
    health: HealthRegistry,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
}

impl Scheduler {
    pub fn new(
        state: Arc<WorkloadState>,
        scaler: Arc<Scaler>,
        config: SchedulerConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            state,
            scaler,
            config,
            health,
            metrics: ScalerMetrics::new(),
            logger,
        }
    }

    pub fn workload(&self) -> &WorkloadRef {
        self.scaler.workload()
    }

    /// Evaluate on every tick until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            workload = %self.workload(),
            interval_secs = self.config.interval.as_secs(),
            "Starting scheduler"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        report = self.tick() => {
                            debug!(
                                workload = %self.workload(),
                                results = report.results,
                                target = ?report.target,
                                "Tick complete"
                            );
                        }
                        _ = shutdown.recv() => {
                            info!(workload = %self.workload(), "Shutting down scheduler mid-tick");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(workload = %self.workload(), "Shutting down scheduler");
                    break;
                }
            }
        }
    }

    /// Run one evaluation round
    pub async fn tick(&self) -> TickReport {
        let predictors = self.state.predictors.snapshot();
        let registered = predictors.len();
        let ready = predictors.iter().filter(|(_, p)| p.is_ready()).count();
        self.metrics
            .set_predictors_ready(&self.workload().to_string(), ready as i64);

        let (tx, mut rx) = mpsc::channel(registered.max(1));
        let mut tasks = JoinSet::new();

        for (key, predictor) in predictors {
            let (model, metric) = match self.state.resolve(&key) {
                Ok(found) => found,
                Err(e) => {
                    error!(predictor = %key, error = %e, "Skipping predictor");
                    continue;
                }
            };

            let tx = tx.clone();
            let scaler = self.scaler.clone();
            let metrics = self.metrics.clone();
            let predict_timeout = self.config.predict_timeout;
            let task_predictor = predictor.clone();
            let task_key = key.clone();
            tasks.spawn(async move {
                let start = Instant::now();
                let forecast = tokio::time::timeout(predict_timeout, task_predictor.predict())
                    .await
                    .unwrap_or(Err(PredictError::Timeout));
                metrics.observe_prediction_latency(start.elapsed().as_secs_f64());

                let forecast = match forecast {
                    Ok(forecast) => forecast,
                    Err(e) => {
                        log_predict_error(&metrics, &task_key, "predict", &e);
                        return;
                    }
                };
                match scaler.model_replica(&forecast, metric.target).await {
                    Ok(replicas) => {
                        let _ = tx.send((task_key, replicas)).await;
                    }
                    Err(e) => {
                        error!(predictor = %task_key, error = %e, "Failed to convert forecast to replicas");
                    }
                }
            });

            if model.need_train && self.train_due(&key, model.update_interval) {
                self.train(&key, &predictor).await;
            }
        }

        drop(tx);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(workload = %self.workload(), error = %e, "Prediction task failed");
            }
        }
        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        let scheduler_component = components::scoped(components::SCHEDULER, self.workload());
        if results.is_empty() {
            self.log_collector_depths();
            if registered > 0 {
                self.health
                    .set_degraded(&scheduler_component, "no predictor produced a forecast")
                    .await;
            }
            return TickReport {
                results: 0,
                target: None,
                action: None,
            };
        }

        self.health.set_healthy(&scheduler_component).await;

        let count = results.len();
        let (target, scale_down) = match self.aggregate(results) {
            Some(decision) => decision,
            None => {
                return TickReport {
                    results: count,
                    target: None,
                    action: None,
                }
            }
        };

        let workload = self.workload().to_string();
        let scaler_component = components::scoped(components::SCALER, &workload);
        let action = match self.scaler.apply_target(target, scale_down).await {
            Ok(action) => {
                self.metrics.inc_scale_actions(&workload, action.label());
                self.logger.log_scale_decision(&workload, target, &action);
                self.health.set_healthy(&scaler_component).await;
                Some(action)
            }
            Err(e) => {
                error!(workload = %workload, target, error = %e, "Failed to apply scale decision");
                self.health
                    .set_degraded(&scaler_component, e.to_string())
                    .await;
                None
            }
        };

        TickReport {
            results: count,
            target: Some(target),
            action,
        }
    }

    fn train_due(&self, key: &str, update_interval: Duration) -> bool {
        match self.state.train_history.load(key) {
            None => true,
            Some(last) => last.elapsed() >= update_interval,
        }
    }

    async fn train(&self, key: &str, predictor: &Arc<Predictor>) {
        match predictor.train().await {
            Ok(handle) => {
                self.state
                    .train_history
                    .store(key, std::time::Instant::now());
                if let Some(handle) = handle {
                    let logger = self.logger.clone();
                    let metrics = self.metrics.clone();
                    let key = key.to_string();
                    tokio::spawn(async move {
                        let outcome = handle.wait().await;
                        metrics.inc_training_rounds(outcome.label());
                        logger.log_training_outcome(&key, &outcome);
                    });
                }
            }
            Err(e) => log_predict_error(&self.metrics, key, "train", &e),
        }
    }

    /// Fold per-predictor sequences into one target replica count
    fn aggregate(&self, results: Vec<(String, Vec<i32>)>) -> Option<(i32, ScaleDownConf)> {
        let mut by_metric: BTreeMap<String, Vec<Vec<i32>>> = BTreeMap::new();
        for (key, replicas) in results {
            match split_with_model_key(&key) {
                Some((no_model_key, _)) => by_metric
                    .entry(no_model_key.to_string())
                    .or_default()
                    .push(replicas),
                None => error!(predictor = %key, "Malformed predictor key"),
            }
        }

        let mut weighted = Vec::with_capacity(by_metric.len());
        let mut weight_sum: i64 = 0;
        let mut scale_down = ScaleDownConf::default();

        for (no_model_key, sequences) in by_metric {
            let metric = match self.state.metrics.load(&no_model_key) {
                Some(metric) => metric,
                None => {
                    let e = PredictError::ConfigurationSync(format!(
                        "metric '{}' disappeared during the tick",
                        no_model_key
                    ));
                    error!(error = %e, "Dropping results");
                    continue;
                }
            };

            let sequence = self.scaler.metric_replica(&sequences);
            debug!(metric = %no_model_key, replicas = ?sequence, "Metric replica sequence");
            weighted.push((metric.weight, sequence));
            weight_sum += i64::from(metric.weight);
            scale_down.threshold = scale_down.threshold.max(metric.scale_down.threshold);
            scale_down.duration = scale_down.duration.max(metric.scale_down.duration);
        }

        if weight_sum <= 0 {
            warn!(workload = %self.workload(), "Metric weights sum to zero, skipping scaling");
            return None;
        }

        let summed = self.scaler.obj_replica(&weighted);
        let peak = self.scaler.scale_replica(&summed)?;
        let target = (peak + weight_sum - 1).div_euclid(weight_sum);
        Some((target.clamp(0, i64::from(i32::MAX)) as i32, scale_down))
    }

    fn log_collector_depths(&self) {
        info!(workload = %self.workload(), "No predictions this tick, skipping scaling");
        self.state.workers.range(|key, worker| {
            let depth = worker.data_cap();
            self.metrics.set_buffered_samples(key, depth as i64);
            info!(metric = %key, buffered = depth, "Collector depth");
        });
    }
}

fn log_predict_error(metrics: &ScalerMetrics, key: &str, op: &str, e: &PredictError) {
    if e.is_transient() {
        metrics.inc_prediction_errors("transient");
        info!(predictor = %key, op, reason = %e, "Predictor not ready");
    } else {
        metrics.inc_prediction_errors("failure");
        error!(predictor = %key, op, error = %e, "Predictor failed");
    }
}
