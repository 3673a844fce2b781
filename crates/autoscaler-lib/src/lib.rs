//! Forecast-driven workload autoscaling
//!
//! This crate provides the core functionality for:
//! - Metric collection into per-metric sample buffers
//! - Holt-Winters and remote-model forecasting
//! - Per-workload evaluation loops
//! - Replica aggregation strategies and guarded scale commands
//! - Health checks and observability

pub mod collector;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod scaler;
pub mod scheduler;
pub mod store;

pub use error::{PredictError, ScaleError, SourceError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ScalerMetrics, StructuredLogger};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
pub use store::{ConcurrentMap, WorkloadRegistry, WorkloadState};
