//! Forecast Autoscaler - predictive replica controller
//!
//! Collects workload metrics from Prometheus, forecasts them with the
//! configured models and resizes the workload ahead of demand.

use anyhow::{Context, Result};
use autoscaler_lib::{
    collector::PrometheusSource,
    health::HealthRegistry,
    observability::StructuredLogger,
    scaler::{KubeScaleClient, ScaleClient, Scaler},
    Scheduler, WorkloadRegistry,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AUTOSCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "forecast-autoscaler", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "AUTOSCALER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    info!("Starting forecast-autoscaler");

    let config = config::ControllerConfig::load(cli.config.as_deref())?;
    info!(
        instance = %config.instance_name,
        workloads = config.workloads.len(),
        "Autoscaler configured"
    );

    // Collectors, schedulers and scalers register per workload and metric
    let health_registry = HealthRegistry::new();

    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(AUTOSCALER_VERSION, config.workloads.len());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let registry = Arc::new(WorkloadRegistry::new());

    let scale_client: Arc<dyn ScaleClient> = Arc::new(
        KubeScaleClient::try_default()
            .await
            .context("failed to create kubernetes client")?,
    );

    for workload in &config.workloads {
        start_workload(
            workload,
            &registry,
            scale_client.clone(),
            &health_registry,
            &logger,
            &shutdown_tx,
        )
        .await
        .with_context(|| format!("failed to start workload {}", workload.workload_ref()))?;
    }

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), registry.clone()));

    // Mark the controller ready once every workload is running
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => {}
            }
            logger.log_shutdown("API server stopped");
        }
    }

    health_registry.set_ready(false).await;
    // Collection loops and schedulers all hold a receiver
    let _ = shutdown_tx.send(());
    info!("Shutting down");

    Ok(())
}

/// Install the metrics of one workload and spawn its scheduler
async fn start_workload(
    workload: &config::WorkloadConfig,
    registry: &WorkloadRegistry,
    scale_client: Arc<dyn ScaleClient>,
    health_registry: &HealthRegistry,
    logger: &StructuredLogger,
    shutdown: &broadcast::Sender<()>,
) -> Result<()> {
    let workload_ref = workload.workload_ref();
    let state = registry.get_or_create(&workload_ref);
    health_registry.register_workload(&workload_ref).await;

    let source = Arc::new(PrometheusSource::new(&workload.metric_source_url)?);
    let collection = workload.collection_config();

    let mut predictors = 0;
    for metric in &workload.metrics {
        let specs = metric.model_specs()?;
        let keys = state.install_metric(
            metric.metric(),
            &specs,
            source.clone(),
            &collection,
            health_registry,
            shutdown,
        )?;
        predictors += keys.len();
    }

    let scaler = Arc::new(Scaler::new(
        scale_client,
        workload_ref.clone(),
        workload.scaler_config(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        state,
        scaler,
        workload.scheduler_config(),
        health_registry.clone(),
        logger.clone(),
    ));
    tokio::spawn(scheduler.run(shutdown.subscribe()));

    logger.log_workload_started(
        &workload_ref.to_string(),
        workload.metrics.len(),
        predictors,
    );
    Ok(())
}
