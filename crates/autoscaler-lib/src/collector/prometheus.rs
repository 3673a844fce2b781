//! Prometheus HTTP API metric source

use super::{async_trait, MetricSource};
use crate::error::SourceError;
use crate::models::Sample;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Evaluates instant queries against `{base_url}/api/v1/query`
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

/// `[unix_seconds, "value"]`
type RawPoint = (f64, String);

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<VectorSeries>),
    Scalar(RawPoint),
    Matrix(Vec<MatrixSeries>),
    String(RawPoint),
}

#[derive(Debug, Deserialize)]
struct VectorSeries {
    value: RawPoint,
}

#[derive(Debug, Deserialize)]
struct MatrixSeries {
    values: Vec<RawPoint>,
}

impl PrometheusSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SourceError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn to_samples(data: QueryData) -> Vec<Sample> {
        let points: Vec<RawPoint> = match data {
            QueryData::Vector(series) => series.into_iter().map(|s| s.value).collect(),
            QueryData::Scalar(point) => vec![point],
            QueryData::Matrix(series) => series.into_iter().flat_map(|s| s.values).collect(),
            QueryData::String(_) => Vec::new(),
        };

        points.into_iter().filter_map(parse_point).collect()
    }
}

fn parse_point((ts, raw): RawPoint) -> Option<Sample> {
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let timestamp = Utc.timestamp_millis_opt((ts * 1000.0) as i64).single()?;
    Some(Sample::new(value, timestamp))
}

#[async_trait]
impl MetricSource for PrometheusSource {
    async fn query(&self, expression: &str, at: DateTime<Utc>) -> Result<Vec<Sample>, SourceError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let time = format!("{:.3}", at.timestamp_millis() as f64 / 1000.0);

        let response = self
            .client
            .get(&url)
            .query(&[("query", expression), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        let status = response.status();
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Response(format!("HTTP {}: {}", status, e)))?;

        if body.status != "success" {
            return Err(SourceError::Response(
                body.error.unwrap_or_else(|| format!("query failed with HTTP {}", status)),
            ));
        }

        let samples = body.data.map(Self::to_samples).unwrap_or_default();
        debug!(query = %expression, samples = samples.len(), "Evaluated query");
        Ok(samples)
    }
}
