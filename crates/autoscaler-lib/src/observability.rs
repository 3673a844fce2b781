//! Observability infrastructure for the autoscaler
//!
//! Provides:
//! - Prometheus metrics (collection and prediction latency, error counters,
//!   training rounds, target replicas, scale actions)
//! - Event-tagged structured logging with tracing

use crate::predictor::TrainingOutcome;
use crate::scaler::ScaleAction;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

static GLOBAL_METRICS: OnceLock<ScalerMetricsInner> = OnceLock::new();

struct ScalerMetricsInner {
    collection_latency_seconds: Histogram,
    prediction_latency_seconds: Histogram,
    collection_errors: IntCounter,
    prediction_errors: IntCounterVec,
    training_rounds: IntCounterVec,
    target_replicas: IntGaugeVec,
    scale_actions: IntCounterVec,
    predictors_ready: IntGaugeVec,
    buffered_samples: IntGaugeVec,
}

impl ScalerMetricsInner {
    fn new() -> Self {
        Self {
            collection_latency_seconds: register_histogram!(
                "autoscaler_collection_latency_seconds",
                "Time spent querying the metric source",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            prediction_latency_seconds: register_histogram!(
                "autoscaler_prediction_latency_seconds",
                "Time spent producing one forecast",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            collection_errors: register_int_counter!(
                "autoscaler_collection_errors_total",
                "Failed or timed out metric queries"
            )
            .expect("Failed to register collection_errors"),

            prediction_errors: register_int_counter_vec!(
                "autoscaler_prediction_errors_total",
                "Predictions that produced no forecast",
                &["kind"]
            )
            .expect("Failed to register prediction_errors"),

            training_rounds: register_int_counter_vec!(
                "autoscaler_training_rounds_total",
                "Completed remote training rounds by outcome",
                &["outcome"]
            )
            .expect("Failed to register training_rounds"),

            target_replicas: register_int_gauge_vec!(
                "autoscaler_target_replicas",
                "Last computed target replica count",
                &["workload"]
            )
            .expect("Failed to register target_replicas"),

            scale_actions: register_int_counter_vec!(
                "autoscaler_scale_actions_total",
                "Scale decisions by action",
                &["workload", "action"]
            )
            .expect("Failed to register scale_actions"),

            predictors_ready: register_int_gauge_vec!(
                "autoscaler_predictors_ready",
                "Predictors able to serve forecasts",
                &["workload"]
            )
            .expect("Failed to register predictors_ready"),

            buffered_samples: register_int_gauge_vec!(
                "autoscaler_buffered_samples",
                "Samples retained per metric collector",
                &["metric"]
            )
            .expect("Failed to register buffered_samples"),
        }
    }
}

/// Lightweight handle to the process-wide Prometheus metrics
#[derive(Clone)]
pub struct ScalerMetrics {
    _private: (),
}

impl Default for ScalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScalerMetricsInner {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new)
    }

    pub fn observe_collection_latency(&self, duration_secs: f64) {
        self.inner().collection_latency_seconds.observe(duration_secs);
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
    }

    pub fn inc_collection_errors(&self) {
        self.inner().collection_errors.inc();
    }

    /// `kind` is either `transient` or `failure`
    pub fn inc_prediction_errors(&self, kind: &str) {
        self.inner().prediction_errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_training_rounds(&self, outcome: &str) {
        self.inner().training_rounds.with_label_values(&[outcome]).inc();
    }

    pub fn set_target_replicas(&self, workload: &str, replicas: i32) {
        self.inner()
            .target_replicas
            .with_label_values(&[workload])
            .set(i64::from(replicas));
    }

    pub fn inc_scale_actions(&self, workload: &str, action: &str) {
        self.inner()
            .scale_actions
            .with_label_values(&[workload, action])
            .inc();
    }

    pub fn set_predictors_ready(&self, workload: &str, ready: i64) {
        self.inner()
            .predictors_ready
            .with_label_values(&[workload])
            .set(ready);
    }

    pub fn set_buffered_samples(&self, metric: &str, samples: i64) {
        self.inner()
            .buffered_samples
            .with_label_values(&[metric])
            .set(samples);
    }
}

/// Structured logger for controller lifecycle and scaling events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, workloads: usize) {
        info!(
            event = "controller_started",
            instance = %self.instance,
            version = %version,
            workloads,
            "Forecast autoscaler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Forecast autoscaler shutting down"
        );
    }

    pub fn log_workload_started(&self, workload: &str, metrics: usize, predictors: usize) {
        info!(
            event = "workload_started",
            instance = %self.instance,
            workload = %workload,
            metrics,
            predictors,
            "Started managing workload"
        );
    }

    /// Log the outcome of one evaluation tick
    pub fn log_scale_decision(&self, workload: &str, target: i32, action: &ScaleAction) {
        match action {
            ScaleAction::ScaledUp { from, to } | ScaleAction::ScaledDown { from, to } => {
                info!(
                    event = "scale_applied",
                    instance = %self.instance,
                    workload = %workload,
                    target,
                    from = *from,
                    to = *to,
                    action = action.label(),
                    "Applied scale decision"
                );
            }
            ScaleAction::Refused { limit, .. } => {
                warn!(
                    event = "scale_refused",
                    instance = %self.instance,
                    workload = %workload,
                    target,
                    limit = *limit,
                    "Scale decision outside replica bounds"
                );
            }
            _ => {
                info!(
                    event = "scale_evaluated",
                    instance = %self.instance,
                    workload = %workload,
                    target,
                    action = action.label(),
                    "Evaluated scale decision"
                );
            }
        }
    }

    pub fn log_training_outcome(&self, predictor: &str, outcome: &TrainingOutcome) {
        match outcome {
            TrainingOutcome::Trained { loss } => {
                info!(
                    event = "model_trained",
                    instance = %self.instance,
                    predictor = %predictor,
                    loss = *loss,
                    "Remote model trained"
                );
            }
            TrainingOutcome::Rejected => {
                warn!(
                    event = "model_training_rejected",
                    instance = %self.instance,
                    predictor = %predictor,
                    "Remote model reported it is untrained"
                );
            }
            TrainingOutcome::Failed(reason) => {
                warn!(
                    event = "model_training_failed",
                    instance = %self.instance,
                    predictor = %predictor,
                    reason = %reason,
                    "Remote model training failed"
                );
            }
        }
    }
}
