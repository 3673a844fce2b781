//! HTTP API for health checks, Prometheus metrics and workload status

use autoscaler_lib::{
    health::{ComponentStatus, HealthRegistry},
    WorkloadRegistry,
};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub workloads: Arc<WorkloadRegistry>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, workloads: Arc<WorkloadRegistry>) -> Self {
        Self {
            health_registry,
            workloads,
        }
    }
}

#[derive(Debug, Serialize)]
struct CollectorStatus {
    metric: String,
    buffered: usize,
}

#[derive(Debug, Serialize)]
struct PredictorStatus {
    predictor: String,
    model: &'static str,
    ready: bool,
}

#[derive(Debug, Serialize)]
struct WorkloadStatus {
    workload: String,
    kind: String,
    collectors: Vec<CollectorStatus>,
    predictors: Vec<PredictorStatus>,
}

/// 200 while operational (healthy or degraded), 503 when unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Collector depth and predictor readiness per managed workload
async fn workloads(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut statuses: Vec<WorkloadStatus> = state
        .workloads
        .snapshot()
        .into_iter()
        .map(|(workload, ws)| {
            let mut collectors: Vec<CollectorStatus> = ws
                .workers
                .snapshot()
                .into_iter()
                .map(|(metric, worker)| CollectorStatus {
                    metric,
                    buffered: worker.data_cap(),
                })
                .collect();
            collectors.sort_by(|a, b| a.metric.cmp(&b.metric));

            let mut predictors: Vec<PredictorStatus> = ws
                .predictors
                .snapshot()
                .into_iter()
                .map(|(key, predictor)| PredictorStatus {
                    model: predictor.tag(),
                    ready: predictor.is_ready(),
                    predictor: key,
                })
                .collect();
            predictors.sort_by(|a, b| a.predictor.cmp(&b.predictor));

            WorkloadStatus {
                workload: workload.to_string(),
                kind: workload.kind.clone(),
                collectors,
                predictors,
            }
        })
        .collect();
    statuses.sort_by(|a, b| a.workload.cmp(&b.workload));

    Json(statuses)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/workloads", get(workloads))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
