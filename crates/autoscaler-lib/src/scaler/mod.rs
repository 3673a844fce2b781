//! Scaling decisions and scale commands
//!
//! The [`Scaler`] turns forecasts into replica counts using the configured
//! strategies and issues guarded scale commands through a [`ScaleClient`].

mod kubernetes;
pub mod strategy;

pub use kubernetes::KubeScaleClient;
pub use strategy::{BaseStrategy, ModelStrategy, ObjStrategy};

use crate::error::{ScaleError, SourceError};
use crate::models::{Forecast, ScaleDownConf, WorkloadRef};
use crate::observability::ScalerMetrics;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Orchestrator surface needed to read and change a replica count
#[async_trait]
pub trait ScaleClient: Send + Sync {
    async fn get_replica_count(&self, workload: &WorkloadRef) -> Result<i32, SourceError>;

    async fn set_replica_count(&self, workload: &WorkloadRef, replicas: i32)
        -> Result<(), SourceError>;
}

/// What a scale attempt ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScaleAction {
    ScaledUp { from: i32, to: i32 },
    ScaledDown { from: i32, to: i32 },
    /// Target lies outside the replica bounds, nothing was changed
    Refused { target: i32, limit: i32 },
    /// Scale-down held back by stabilization
    Deferred { target: i32, current: i32 },
    Unchanged { replicas: i32 },
}

impl ScaleAction {
    pub fn label(&self) -> &'static str {
        match self {
            ScaleAction::ScaledUp { .. } => "scaled_up",
            ScaleAction::ScaledDown { .. } => "scaled_down",
            ScaleAction::Refused { .. } => "refused",
            ScaleAction::Deferred { .. } => "deferred",
            ScaleAction::Unchanged { .. } => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalerConfig {
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub base_strategy: BaseStrategy,
    pub model_strategy: ModelStrategy,
    pub obj_strategy: ObjStrategy,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 10,
            base_strategy: BaseStrategy::default(),
            model_strategy: ModelStrategy::default(),
            obj_strategy: ObjStrategy::default(),
        }
    }
}

/// Per-workload scaling engine
pub struct Scaler {
    client: Arc<dyn ScaleClient>,
    workload: WorkloadRef,
    config: ScalerConfig,
    /// Since when the target has stayed below the current count
    below_since: Mutex<Option<Instant>>,
    metrics: ScalerMetrics,
}

impl Scaler {
    pub fn new(client: Arc<dyn ScaleClient>, workload: WorkloadRef, config: ScalerConfig) -> Self {
        Self {
            client,
            workload,
            config,
            below_since: Mutex::new(None),
            metrics: ScalerMetrics::new(),
        }
    }

    pub fn workload(&self) -> &WorkloadRef {
        &self.workload
    }

    pub fn config(&self) -> &ScalerConfig {
        &self.config
    }

    pub async fn current_replicas(&self) -> Result<i32, ScaleError> {
        Ok(self.client.get_replica_count(&self.workload).await?)
    }

    /// Replica sequence for one model's forecast
    pub async fn model_replica(&self, forecast: &Forecast, target: f64) -> Result<Vec<i32>, ScaleError> {
        let current = match self.config.base_strategy {
            BaseStrategy::Steady => self.current_replicas().await?,
            BaseStrategy::UnderThreshold => 0,
        };
        Ok(self
            .config
            .base_strategy
            .apply(&forecast.values, forecast.baseline, current, target))
    }

    /// Fold the sequences of all models on one metric
    pub fn metric_replica(&self, sequences: &[Vec<i32>]) -> Vec<i32> {
        self.config.model_strategy.apply(sequences)
    }

    /// Weighted element-wise sum over metrics
    pub fn obj_replica(&self, weighted: &[(i32, Vec<i32>)]) -> Vec<i64> {
        strategy::weighted_sum(weighted)
    }

    /// Reduce the summed sequence to one number
    pub fn scale_replica(&self, summed: &[i64]) -> Option<i64> {
        self.config.obj_strategy.apply(summed)
    }

    /// Scale up to `n` replicas
    pub async fn up_to(&self, n: i32) -> Result<ScaleAction, ScaleError> {
        let current = self.current_replicas().await?;
        self.scale_up(current, n).await
    }

    /// Scale down to `n` replicas
    pub async fn down_to(&self, n: i32) -> Result<ScaleAction, ScaleError> {
        let current = self.current_replicas().await?;
        self.scale_down(current, n).await
    }

    async fn scale_up(&self, current: i32, n: i32) -> Result<ScaleAction, ScaleError> {
        if n <= current {
            return Err(ScaleError::NotAbove { target: n, current });
        }
        if n > self.config.max_replicas {
            warn!(
                workload = %self.workload,
                target = n,
                max_replicas = self.config.max_replicas,
                "Refusing to scale above the maximum"
            );
            return Ok(ScaleAction::Refused {
                target: n,
                limit: self.config.max_replicas,
            });
        }

        self.client.set_replica_count(&self.workload, n).await?;
        info!(workload = %self.workload, from = current, to = n, "Scaled up");
        Ok(ScaleAction::ScaledUp { from: current, to: n })
    }

    async fn scale_down(&self, current: i32, n: i32) -> Result<ScaleAction, ScaleError> {
        if n >= current {
            return Err(ScaleError::NotBelow { target: n, current });
        }
        if n < self.config.min_replicas {
            warn!(
                workload = %self.workload,
                target = n,
                min_replicas = self.config.min_replicas,
                "Refusing to scale below the minimum"
            );
            return Ok(ScaleAction::Refused {
                target: n,
                limit: self.config.min_replicas,
            });
        }

        self.client.set_replica_count(&self.workload, n).await?;
        info!(workload = %self.workload, from = current, to = n, "Scaled down");
        Ok(ScaleAction::ScaledDown { from: current, to: n })
    }

    /// Move the workload towards `target`
    ///
    /// Scale-ups happen at once. Scale-downs are clamped to the minimum and
    /// only issued once the drop is at least `scale_down.threshold` of the
    /// current count and the target has stayed below the current count for
    /// `scale_down.duration`.
    pub async fn apply_target(
        &self,
        target: i32,
        scale_down: ScaleDownConf,
    ) -> Result<ScaleAction, ScaleError> {
        let current = self.current_replicas().await?;
        self.metrics
            .set_target_replicas(&self.workload.to_string(), target);

        if target > current {
            self.reset_stabilization();
            return self.scale_up(current, target).await;
        }

        let target = target.max(self.config.min_replicas);
        if target >= current {
            self.reset_stabilization();
            return Ok(ScaleAction::Unchanged { replicas: current });
        }

        let relative_drop = f64::from(current - target) / f64::from(current);
        if relative_drop < scale_down.threshold {
            debug!(
                workload = %self.workload,
                current,
                target,
                relative_drop,
                threshold = scale_down.threshold,
                "Scale-down below threshold"
            );
            self.reset_stabilization();
            return Ok(ScaleAction::Unchanged { replicas: current });
        }

        let since = {
            let mut below = self.below_since.lock().unwrap_or_else(PoisonError::into_inner);
            *below.get_or_insert_with(Instant::now)
        };
        if since.elapsed() < scale_down.duration {
            debug!(
                workload = %self.workload,
                current,
                target,
                waited_secs = since.elapsed().as_secs(),
                "Scale-down deferred"
            );
            return Ok(ScaleAction::Deferred { target, current });
        }

        self.reset_stabilization();
        self.scale_down(current, target).await
    }

    fn reset_stabilization(&self) {
        *self.below_since.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory orchestrator
    pub(crate) struct MockClient {
        replicas: AtomicI32,
        sets: AtomicUsize,
    }

    impl MockClient {
        pub(crate) fn new(replicas: i32) -> Self {
            Self {
                replicas: AtomicI32::new(replicas),
                sets: AtomicUsize::new(0),
            }
        }

        pub(crate) fn replicas(&self) -> i32 {
            self.replicas.load(Ordering::SeqCst)
        }

        pub(crate) fn set_calls(&self) -> usize {
            self.sets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScaleClient for MockClient {
        async fn get_replica_count(&self, _workload: &WorkloadRef) -> Result<i32, SourceError> {
            Ok(self.replicas())
        }

        async fn set_replica_count(
            &self,
            _workload: &WorkloadRef,
            replicas: i32,
        ) -> Result<(), SourceError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.replicas.store(replicas, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn workload() -> WorkloadRef {
        WorkloadRef {
            namespace: "default".to_string(),
            name: "web".to_string(),
            kind: "Deployment".to_string(),
        }
    }

    fn scaler(client: Arc<MockClient>, min: i32, max: i32) -> Scaler {
        Scaler::new(
            client,
            workload(),
            ScalerConfig {
                min_replicas: min,
                max_replicas: max,
                ..ScalerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_up_to_rejects_non_increase() {
        let client = Arc::new(MockClient::new(5));
        let scaler = scaler(client.clone(), 1, 10);

        assert!(matches!(
            scaler.up_to(3).await,
            Err(ScaleError::NotAbove { target: 3, current: 5 })
        ));
        assert!(matches!(scaler.up_to(5).await, Err(ScaleError::NotAbove { .. })));
        assert_eq!(client.set_calls(), 0);
    }

    #[tokio::test]
    async fn test_up_to_respects_maximum() {
        let client = Arc::new(MockClient::new(5));
        let scaler = scaler(client.clone(), 1, 10);

        assert_eq!(
            scaler.up_to(11).await.unwrap(),
            ScaleAction::Refused { target: 11, limit: 10 }
        );
        assert_eq!(client.set_calls(), 0);

        assert_eq!(
            scaler.up_to(10).await.unwrap(),
            ScaleAction::ScaledUp { from: 5, to: 10 }
        );
        assert_eq!(client.replicas(), 10);
    }

    #[tokio::test]
    async fn test_down_to_guards() {
        let client = Arc::new(MockClient::new(5));
        let scaler = scaler(client.clone(), 2, 10);

        assert!(matches!(scaler.down_to(5).await, Err(ScaleError::NotBelow { .. })));
        assert_eq!(
            scaler.down_to(1).await.unwrap(),
            ScaleAction::Refused { target: 1, limit: 2 }
        );
        assert_eq!(client.set_calls(), 0);

        assert_eq!(
            scaler.down_to(2).await.unwrap(),
            ScaleAction::ScaledDown { from: 5, to: 2 }
        );
        assert_eq!(client.replicas(), 2);
    }

    #[tokio::test]
    async fn test_model_replica_uses_current_count() {
        let client = Arc::new(MockClient::new(2));
        let scaler = scaler(client, 1, 10);
        let forecast = Forecast {
            values: vec![20.0, -5.0, 15.0],
            baseline: 10.0,
            loss: None,
        };
        assert_eq!(scaler.model_replica(&forecast, 1.0).await.unwrap(), vec![4, 0, 3]);
    }

    #[tokio::test]
    async fn test_apply_target_scales_up_immediately() {
        let client = Arc::new(MockClient::new(2));
        let scaler = scaler(client.clone(), 1, 10);

        let action = scaler
            .apply_target(6, ScaleDownConf::default())
            .await
            .unwrap();
        assert_eq!(action, ScaleAction::ScaledUp { from: 2, to: 6 });
        assert_eq!(client.replicas(), 6);
    }

    #[tokio::test]
    async fn test_apply_target_unchanged_and_clamped() {
        let client = Arc::new(MockClient::new(3));
        let scaler = scaler(client.clone(), 3, 10);

        assert_eq!(
            scaler.apply_target(3, ScaleDownConf::default()).await.unwrap(),
            ScaleAction::Unchanged { replicas: 3 }
        );
        // Clamped to the minimum, which equals the current count
        assert_eq!(
            scaler.apply_target(0, ScaleDownConf::default()).await.unwrap(),
            ScaleAction::Unchanged { replicas: 3 }
        );
        assert_eq!(client.set_calls(), 0);
    }

    #[tokio::test]
    async fn test_apply_target_scale_down_threshold() {
        let client = Arc::new(MockClient::new(10));
        let scaler = scaler(client.clone(), 1, 20);
        let conf = ScaleDownConf {
            threshold: 0.3,
            duration: Duration::ZERO,
        };

        assert_eq!(
            scaler.apply_target(8, conf).await.unwrap(),
            ScaleAction::Unchanged { replicas: 10 }
        );
        assert_eq!(
            scaler.apply_target(6, conf).await.unwrap(),
            ScaleAction::ScaledDown { from: 10, to: 6 }
        );
    }

    #[tokio::test]
    async fn test_apply_target_scale_down_waits_for_duration() {
        let client = Arc::new(MockClient::new(10));
        let scaler = scaler(client.clone(), 1, 20);
        let conf = ScaleDownConf {
            threshold: 0.0,
            duration: Duration::from_millis(50),
        };

        assert_eq!(
            scaler.apply_target(4, conf).await.unwrap(),
            ScaleAction::Deferred { target: 4, current: 10 }
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            scaler.apply_target(4, conf).await.unwrap(),
            ScaleAction::ScaledDown { from: 10, to: 4 }
        );
    }

    #[tokio::test]
    async fn test_apply_target_rise_resets_stabilization() {
        let client = Arc::new(MockClient::new(10));
        let scaler = scaler(client.clone(), 1, 20);
        let conf = ScaleDownConf {
            threshold: 0.0,
            duration: Duration::from_millis(50),
        };

        scaler.apply_target(4, conf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        scaler.apply_target(10, conf).await.unwrap();

        assert_eq!(
            scaler.apply_target(4, conf).await.unwrap(),
            ScaleAction::Deferred { target: 4, current: 10 }
        );
    }
}
