//! Health tracking for the controller
//!
//! Components report their state here. Workload-bound components are
//! registered once per managed workload under a scoped name, so one failing
//! workload shows up individually in `/healthz`.

use crate::models::WorkloadRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational, but the last round did not fully succeed
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status among the components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max_by_key(|s| match s {
                ComponentStatus::Healthy => 0,
                ComponentStatus::Degraded => 1,
                ComponentStatus::Unhealthy => 2,
            })
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    use std::fmt::Display;

    pub const COLLECTOR: &str = "collector";
    pub const SCHEDULER: &str = "scheduler";
    pub const SCALER: &str = "scaler";

    /// Name of a component bound to one workload, e.g. `scheduler:default/web`
    pub fn scoped(component: &str, workload: &impl Display) -> String {
        format!("{}:{}", component, workload)
    }
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Register the scheduler and scaler of a workload
    pub async fn register_workload(&self, workload: &WorkloadRef) {
        self.register(&components::scoped(components::SCHEDULER, workload))
            .await;
        self.register(&components::scoped(components::SCALER, workload))
            .await;
    }

    pub async fn unregister(&self, name: &str) {
        self.components.write().await.remove(name);
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components.write().await.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once initialized and while no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("Controller not yet initialized".to_string()),
            };
        }

        let unhealthy: Vec<String> = self
            .components
            .read()
            .await
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.clone())
            .collect();

        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy components: {}", unhealthy.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web() -> WorkloadRef {
        WorkloadRef {
            namespace: "default".to_string(),
            name: "web".to_string(),
            kind: "Deployment".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_register_workload_scopes_components() {
        let registry = HealthRegistry::new();
        registry.register_workload(&web()).await;

        let health = registry.health().await;
        assert!(health.components.contains_key("scheduler:default/web"));
        assert!(health.components.contains_key("scaler:default/web"));
    }

    #[tokio::test]
    async fn test_worst_status_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::COLLECTOR).await;
        registry.register_workload(&web()).await;

        let scaler = components::scoped(components::SCALER, &web());
        registry.set_degraded(&scaler, "patch failed").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::COLLECTOR, "no source").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        registry.unregister(components::COLLECTOR).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_readiness() {
        let registry = HealthRegistry::new();
        registry.register(components::COLLECTOR).await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::COLLECTOR, "Failed").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Unhealthy components: collector")
        );
    }
}
