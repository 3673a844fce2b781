//! Controller configuration
//!
//! Loaded from an optional file (YAML, TOML or JSON, picked by extension)
//! layered under `AUTOSCALER_*` environment variables.

use anyhow::{Context, Result};
use autoscaler_lib::collector::CollectionConfig;
use autoscaler_lib::scaler::{BaseStrategy, ModelStrategy, ScalerConfig};
use autoscaler_lib::{Metric, ModelSpec, ScaleDownConf, SchedulerConfig, WorkloadRef};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Name reported in structured logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Port of the health/metrics server
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub workloads: Vec<WorkloadConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(default = "default_min_replicas")]
    pub min_replicas: i32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,

    /// Base URL of the Prometheus HTTP API
    pub metric_source_url: String,

    #[serde(default = "default_collect_interval")]
    pub collect_interval_secs: u64,
    #[serde(default = "default_evaluate_interval")]
    pub evaluate_interval_secs: u64,
    #[serde(default = "default_predict_timeout")]
    pub predict_timeout_secs: u64,

    /// Samples retained per metric, 0 keeps everything
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    #[serde(default)]
    pub base_strategy: BaseStrategy,
    #[serde(default)]
    pub model_strategy: ModelStrategy,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    pub query: String,
    pub target: f64,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default)]
    pub scale_down: ScaleDownConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScaleDownConfig {
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type")]
    pub model_type: String,
    #[serde(default)]
    pub need_train: bool,
    #[serde(default)]
    pub update_interval_secs: u64,
    /// Model specific settings, values are parsed by the model
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "forecast-autoscaler".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_kind() -> String {
    "Deployment".to_string()
}

fn default_min_replicas() -> i32 {
    1
}

fn default_max_replicas() -> i32 {
    10
}

fn default_collect_interval() -> u64 {
    10
}

fn default_evaluate_interval() -> u64 {
    30
}

fn default_predict_timeout() -> u64 {
    30
}

fn default_max_samples() -> usize {
    autoscaler_lib::collector::DEFAULT_MAX_SAMPLES
}

fn default_weight() -> i32 {
    100
}

impl ControllerConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("AUTOSCALER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("invalid configuration")?;
        for workload in &config.workloads {
            workload
                .validate()
                .with_context(|| format!("invalid workload {}", workload.workload_ref()))?;
        }
        Ok(config)
    }
}

impl WorkloadConfig {
    /// Reject settings the loops cannot run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.collect_interval_secs > 0, "collect_interval_secs must be positive");
        anyhow::ensure!(self.evaluate_interval_secs > 0, "evaluate_interval_secs must be positive");
        anyhow::ensure!(self.predict_timeout_secs > 0, "predict_timeout_secs must be positive");
        anyhow::ensure!(
            0 <= self.min_replicas && self.min_replicas <= self.max_replicas,
            "replica bounds {}..={} are invalid",
            self.min_replicas,
            self.max_replicas
        );
        Ok(())
    }

    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
        }
    }

    pub fn scaler_config(&self) -> ScalerConfig {
        ScalerConfig {
            min_replicas: self.min_replicas,
            max_replicas: self.max_replicas,
            base_strategy: self.base_strategy,
            model_strategy: self.model_strategy,
            ..ScalerConfig::default()
        }
    }

    pub fn collection_config(&self) -> CollectionConfig {
        CollectionConfig {
            interval: Duration::from_secs(self.collect_interval_secs),
            max_samples: self.max_samples,
            ..CollectionConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.evaluate_interval_secs),
            predict_timeout: Duration::from_secs(self.predict_timeout_secs),
        }
    }
}

impl MetricConfig {
    pub fn metric(&self) -> Metric {
        Metric {
            name: self.name.clone(),
            unit: self.unit.clone(),
            query: self.query.clone(),
            target: self.target,
            weight: self.weight,
            scale_down: ScaleDownConf {
                threshold: self.scale_down.threshold,
                duration: Duration::from_secs(self.scale_down.duration_secs),
            },
        }
    }

    /// Parse every model attached to this metric
    pub fn model_specs(&self) -> Result<Vec<ModelSpec>> {
        self.models
            .iter()
            .map(|m| {
                ModelSpec::from_attributes(
                    &m.model_type,
                    m.need_train,
                    Duration::from_secs(m.update_interval_secs),
                    &m.attributes,
                )
                .with_context(|| format!("metric '{}', model '{}'", self.name, m.model_type))
            })
            .collect()
    }
}
