//! Core data models for the autoscaler

use crate::error::PredictError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Delimiter used when composing metric and predictor keys
pub const KEY_DELIMITER: char = '$';

/// Default epochs sent with a remote training request
pub const DEFAULT_EPOCHS: usize = 100;

/// Default number of recurrent layers for the remote model
pub const DEFAULT_N_LAYERS: usize = 2;

/// Default address the remote model reports training completion to
pub const DEFAULT_RESP_RECV_ADDRESS: &str = "/tmp/rra.socket";

/// A single observed metric value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Scale-down stabilization settings carried by a metric
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScaleDownConf {
    /// Minimum relative drop (0.0-1.0) before a scale-down is issued
    pub threshold: f64,
    /// How long the target must stay below the current count
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

/// A monitored metric of a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub unit: String,
    pub query: String,
    /// Value one replica is expected to sustain
    pub target: f64,
    /// Share of this metric in the final decision, 0-100
    pub weight: i32,
    #[serde(default)]
    pub scale_down: ScaleDownConf,
}

impl Metric {
    /// Key identifying the metric/collector pair
    pub fn no_model_key(&self) -> String {
        format!(
            "{}{d}{}{d}{}",
            self.name,
            self.unit,
            self.query,
            d = KEY_DELIMITER
        )
    }

    /// Key identifying one predictor attached to this metric
    pub fn with_model_key(&self, kind_tag: &str) -> String {
        format!("{}{}{}", self.no_model_key(), KEY_DELIMITER, kind_tag)
    }
}

/// Split a predictor key into its metric key and model tag
pub fn split_with_model_key(with_model_key: &str) -> Option<(&str, &str)> {
    with_model_key.rsplit_once(KEY_DELIMITER)
}

/// Parameters of the in-process Holt-Winters model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoltWintersParams {
    pub season_length: usize,
    pub look_back: usize,
    pub look_forward: usize,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

/// Parameters of the out-of-process trained model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteParams {
    /// Address of the model-serving process
    pub address: String,
    /// Address the model reports training completion to
    pub resp_recv_address: String,
    pub look_back: usize,
    pub look_forward: usize,
    pub batch_size: usize,
    pub train_size: usize,
    pub epochs: usize,
    pub n_layers: usize,
}

/// Closed set of supported prediction models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelKind {
    HoltWinters(HoltWintersParams),
    Remote(RemoteParams),
}

impl ModelKind {
    pub const HOLT_WINTERS: &'static str = "holt_winters";
    pub const REMOTE: &'static str = "remote";

    /// Tag used in predictor keys
    pub fn tag(&self) -> &'static str {
        match self {
            ModelKind::HoltWinters(_) => Self::HOLT_WINTERS,
            ModelKind::Remote(_) => Self::REMOTE,
        }
    }

    /// Forecast horizon produced by the model
    pub fn look_forward(&self) -> usize {
        match self {
            ModelKind::HoltWinters(p) => p.look_forward,
            ModelKind::Remote(p) => p.look_forward,
        }
    }
}

/// A prediction model attached to a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub kind: ModelKind,
    pub need_train: bool,
    /// Retrain interval when `need_train` is set
    #[serde(with = "duration_secs")]
    pub update_interval: Duration,
}

impl ModelSpec {
    /// Build a model from the string attribute bag of the declarative config
    pub fn from_attributes(
        kind_tag: &str,
        need_train: bool,
        update_interval: Duration,
        attrs: &HashMap<String, String>,
    ) -> Result<Self, PredictError> {
        let kind = match kind_tag {
            ModelKind::HOLT_WINTERS => ModelKind::HoltWinters(HoltWintersParams {
                season_length: required(attrs, "slen")?,
                look_back: required(attrs, "look_back")?,
                look_forward: required(attrs, "look_forward")?,
                alpha: required(attrs, "alpha")?,
                beta: required(attrs, "beta")?,
                gamma: required(attrs, "gamma")?,
            }),
            ModelKind::REMOTE => {
                let train_size: usize = required(attrs, "train_size")?;
                let batch_size: usize = optional(attrs, "batch_size")?.unwrap_or(0);
                ModelKind::Remote(RemoteParams {
                    address: attrs
                        .get("address")
                        .cloned()
                        .ok_or_else(|| missing("address"))?,
                    resp_recv_address: attrs
                        .get("resp_recv_address")
                        .cloned()
                        .unwrap_or_else(|| DEFAULT_RESP_RECV_ADDRESS.to_string()),
                    look_back: required(attrs, "look_back")?,
                    look_forward: required(attrs, "look_forward")?,
                    batch_size: if batch_size == 0 {
                        (train_size / 10).max(1)
                    } else {
                        batch_size
                    },
                    train_size,
                    epochs: optional(attrs, "epochs")?.unwrap_or(DEFAULT_EPOCHS),
                    n_layers: optional(attrs, "n_layers")?.unwrap_or(DEFAULT_N_LAYERS),
                })
            }
            other => {
                return Err(PredictError::InvalidModel(format!(
                    "unknown model type '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            kind,
            need_train,
            update_interval,
        })
    }

    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }
}

fn missing(key: &str) -> PredictError {
    PredictError::InvalidModel(format!("missing attribute '{}'", key))
}

fn optional<T: std::str::FromStr>(
    attrs: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, PredictError> {
    match attrs.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            PredictError::InvalidModel(format!("attribute '{}' has invalid value '{}'", key, raw))
        }),
    }
}

fn required<T: std::str::FromStr>(
    attrs: &HashMap<String, String>,
    key: &str,
) -> Result<T, PredictError> {
    optional(attrs, key)?.ok_or_else(|| missing(key))
}

/// Reference to the orchestrated workload being scaled
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
    /// Workload kind, e.g. Deployment or StatefulSet
    pub kind: String,
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Output of a single prediction round
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    /// Predicted values, one per future step
    pub values: Vec<f64>,
    /// Last observed value at prediction time
    pub baseline: f64,
    /// Model loss reported by remote models
    pub loss: Option<f64>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_metric() -> Metric {
        Metric {
            name: "cpu".to_string(),
            unit: "%".to_string(),
            query: "avg(rate(cpu[5m]))".to_string(),
            target: 50.0,
            weight: 100,
            scale_down: ScaleDownConf::default(),
        }
    }

    #[test]
    fn test_metric_keys() {
        let metric = cpu_metric();
        assert_eq!(metric.no_model_key(), "cpu$%$avg(rate(cpu[5m]))");
        assert_eq!(
            metric.with_model_key(ModelKind::REMOTE),
            "cpu$%$avg(rate(cpu[5m]))$remote"
        );
    }

    #[test]
    fn test_split_with_model_key() {
        let metric = cpu_metric();
        let wmk = metric.with_model_key(ModelKind::HOLT_WINTERS);
        let (nmk, tag) = split_with_model_key(&wmk).unwrap();
        assert_eq!(nmk, metric.no_model_key());
        assert_eq!(tag, "holt_winters");
    }

    #[test]
    fn test_holt_winters_from_attributes() {
        let attrs: HashMap<String, String> = [
            ("slen", "4"),
            ("look_back", "8"),
            ("look_forward", "4"),
            ("alpha", "0.5"),
            ("beta", "0.5"),
            ("gamma", "0.5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let spec =
            ModelSpec::from_attributes("holt_winters", false, Duration::ZERO, &attrs).unwrap();
        assert_eq!(spec.tag(), ModelKind::HOLT_WINTERS);
        assert_eq!(spec.kind.look_forward(), 4);
    }

    #[test]
    fn test_remote_from_attributes_applies_defaults() {
        let attrs: HashMap<String, String> = [
            ("address", "/tmp/model.sock"),
            ("look_back", "100"),
            ("look_forward", "60"),
            ("train_size", "1000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let spec =
            ModelSpec::from_attributes("remote", true, Duration::from_secs(3600), &attrs).unwrap();
        match spec.kind {
            ModelKind::Remote(p) => {
                assert_eq!(p.batch_size, 100);
                assert_eq!(p.epochs, DEFAULT_EPOCHS);
                assert_eq!(p.n_layers, DEFAULT_N_LAYERS);
                assert_eq!(p.resp_recv_address, DEFAULT_RESP_RECV_ADDRESS);
            }
            other => panic!("unexpected model kind {:?}", other),
        }
    }

    #[test]
    fn test_from_attributes_rejects_bad_input() {
        let attrs: HashMap<String, String> =
            [("look_back".to_string(), "many".to_string())].into_iter().collect();

        assert!(matches!(
            ModelSpec::from_attributes("holt_winters", false, Duration::ZERO, &attrs),
            Err(PredictError::InvalidModel(_))
        ));
        assert!(matches!(
            ModelSpec::from_attributes("lstm", false, Duration::ZERO, &attrs),
            Err(PredictError::InvalidModel(_))
        ));
    }
}
