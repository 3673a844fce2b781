//! Out-of-process trained model
//!
//! Predictions are synchronous request/response exchanges. Training is
//! asynchronous: the request is dispatched, a completion listener is bound
//! beforehand, and the model reports back on that listener once it has
//! finished. The readiness flag only changes when that report arrives.

use super::transport::{
    self, CompletionListener, Endpoint, PredictRequest, PredictResponse, TrainRequest,
    TrainResponse,
};
use crate::collector::CollectorWorker;
use crate::error::PredictError;
use crate::models::{Forecast, RemoteParams};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Default bound on a prediction exchange or training dispatch
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on waiting for a training completion report
pub const DEFAULT_TRAINING_TIMEOUT: Duration = Duration::from_secs(600);

/// Lifecycle of the remote model as seen from this side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Untrained,
    Training,
    Ready,
}

/// How a training round ended
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    /// Model reported success and serves predictions
    Trained { loss: f64 },
    /// Model reported it is not trained
    Rejected,
    /// Error report, transport failure or timeout
    Failed(String),
}

impl TrainingOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TrainingOutcome::Trained { .. } => "trained",
            TrainingOutcome::Rejected => "rejected",
            TrainingOutcome::Failed(_) => "failed",
        }
    }
}

/// Handle to an in-flight training round
#[derive(Debug)]
pub struct TrainingHandle {
    rx: oneshot::Receiver<TrainingOutcome>,
}

impl TrainingHandle {
    /// Wait until the completion report has been applied
    pub async fn wait(self) -> TrainingOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| TrainingOutcome::Failed("completion task dropped".to_string()))
    }
}

/// Readiness flag plus lifecycle state, shared with the completion task
#[derive(Debug)]
struct Readiness {
    ready: AtomicBool,
    state: Mutex<ModelState>,
}

impl Readiness {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            state: Mutex::new(ModelState::Untrained),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn state(&self) -> ModelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_training(&self) -> Result<(), PredictError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ModelState::Training {
            return Err(PredictError::TrainingInProgress);
        }
        *state = ModelState::Training;
        Ok(())
    }

    /// Leave the flag alone and return to the state before training
    fn abort(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = if self.is_ready() {
            ModelState::Ready
        } else {
            ModelState::Untrained
        };
    }

    /// Model lost its training behind our back
    fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.ready.store(false, Ordering::SeqCst);
        if *state == ModelState::Ready {
            *state = ModelState::Untrained;
        }
    }

    /// Apply a completion report, ending the training round
    fn finish(&self, ready: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.ready.store(ready, Ordering::SeqCst);
        *state = if ready {
            ModelState::Ready
        } else {
            ModelState::Untrained
        };
    }
}

/// Predictor backed by a model-serving process
#[derive(Debug)]
pub struct RemotePredictor {
    key: String,
    params: RemoteParams,
    worker: Arc<CollectorWorker>,
    endpoint: Endpoint,
    /// Address the model reports training completion to, unique per predictor
    completion_address: String,
    completion: Endpoint,
    readiness: Arc<Readiness>,
    request_timeout: Duration,
    training_timeout: Duration,
}

impl RemotePredictor {
    pub fn new(
        key: String,
        params: RemoteParams,
        worker: Arc<CollectorWorker>,
    ) -> Result<Self, PredictError> {
        if params.look_forward == 0 || params.look_back == 0 {
            return Err(PredictError::InvalidModel(
                "look_back and look_forward must be positive".to_string(),
            ));
        }
        if params.train_size < params.look_back {
            return Err(PredictError::InvalidModel(format!(
                "train_size {} is smaller than look_back {}",
                params.train_size, params.look_back
            )));
        }

        let completion_address = derive_completion_address(&params.resp_recv_address, &key);
        Ok(Self {
            endpoint: Endpoint::parse(&params.address),
            completion: Endpoint::parse(&completion_address),
            completion_address,
            key,
            params,
            worker,
            readiness: Arc::new(Readiness::new()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            training_timeout: DEFAULT_TRAINING_TIMEOUT,
        })
    }

    pub fn with_timeouts(mut self, request: Duration, training: Duration) -> Self {
        self.request_timeout = request;
        self.training_timeout = training;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    pub fn state(&self) -> ModelState {
        self.readiness.state()
    }

    pub fn completion_address(&self) -> &str {
        &self.completion_address
    }

    /// Ask the model for `look_forward` points
    pub async fn predict(&self) -> Result<Forecast, PredictError> {
        if !self.readiness.is_ready() {
            return Err(PredictError::ModelNotReady);
        }

        let need = self.params.look_forward.max(self.params.look_back);
        let have = self.worker.data_cap();
        if have < need {
            return Err(PredictError::InsufficientData { have, need });
        }
        let history: Vec<f64> = self
            .worker
            .window(self.params.look_back)
            .ok_or(PredictError::InsufficientData { have, need })?
            .iter()
            .map(|s| s.value)
            .collect();
        let baseline = history.last().copied().unwrap_or_default();

        let request = PredictRequest {
            key: self.key.clone(),
            predict_history: history,
            look_back: self.params.look_back,
            look_forward: self.params.look_forward,
        };
        let response: PredictResponse =
            timeout(self.request_timeout, transport::request(&self.endpoint, &request))
                .await
                .map_err(|_| PredictError::Timeout)??;

        if !response.error.is_empty() {
            return Err(PredictError::Transport(response.error));
        }
        if !response.trained {
            warn!(predictor = %self.key, "Model reports it is not trained");
            self.readiness.invalidate();
            return Err(PredictError::ModelNotReady);
        }

        Ok(Forecast {
            values: response.prediction,
            baseline,
            loss: response.loss,
        })
    }

    /// Dispatch a training round over the last `train_size` samples
    ///
    /// Returns once the request is on its way. The returned handle resolves
    /// when the model's completion report has been applied.
    pub async fn train(&self) -> Result<TrainingHandle, PredictError> {
        let need = self.params.train_size;
        let have = self.worker.data_cap();
        if have < need {
            return Err(PredictError::InsufficientData { have, need });
        }
        let history: Vec<f64> = self
            .worker
            .window(need)
            .ok_or(PredictError::InsufficientData { have, need })?
            .iter()
            .map(|s| s.value)
            .collect();

        self.readiness.begin_training()?;

        let listener = match self.dispatch(history).await {
            Ok(listener) => listener,
            Err(e) => {
                self.readiness.abort();
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        let readiness = self.readiness.clone();
        let key = self.key.clone();
        let wait = self.training_timeout;
        tokio::spawn(async move {
            let outcome = await_completion(listener, &readiness, &key, wait).await;
            let _ = tx.send(outcome);
        });

        Ok(TrainingHandle { rx })
    }

    async fn dispatch(&self, history: Vec<f64>) -> Result<CompletionListener, PredictError> {
        // Bind first so a fast model cannot report before anyone listens.
        let listener = CompletionListener::bind(&self.completion).await?;

        let request = TrainRequest {
            key: self.key.clone(),
            train_history: history,
            resp_recv_address: self.completion_address.clone(),
            look_back: self.params.look_back,
            look_forward: self.params.look_forward,
            batch_size: self.params.batch_size,
            epochs: self.params.epochs,
            n_layers: self.params.n_layers,
        };
        timeout(self.request_timeout, transport::send(&self.endpoint, &request))
            .await
            .map_err(|_| PredictError::Timeout)??;

        info!(
            predictor = %self.key,
            train_size = request.train_history.len(),
            "Dispatched training request"
        );
        Ok(listener)
    }
}

/// Per-predictor completion address derived from the configured one
///
/// Unix socket paths get a suffix hashed from the predictor key so that
/// predictors sharing the default address never listen on the same path.
/// TCP addresses are used as configured.
fn derive_completion_address(configured: &str, key: &str) -> String {
    match Endpoint::parse(configured) {
        Endpoint::Tcp(_) => configured.to_string(),
        Endpoint::Unix(path) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            format!("{}.{:016x}", path.display(), hasher.finish())
        }
    }
}

async fn await_completion(
    listener: CompletionListener,
    readiness: &Readiness,
    key: &str,
    wait: Duration,
) -> TrainingOutcome {
    match timeout(wait, listener.accept_one::<TrainResponse>()).await {
        Ok(Ok(report)) if report.key.as_deref().is_some_and(|k| k != key) => {
            let other = report.key.unwrap_or_default();
            error!(predictor = %key, reported = %other, "Training report belongs to another model");
            readiness.abort();
            TrainingOutcome::Failed(format!("training report for '{}'", other))
        }
        Ok(Ok(report)) if !report.error.is_empty() => {
            error!(predictor = %key, error = %report.error, "Model reported a training error");
            readiness.abort();
            TrainingOutcome::Failed(report.error)
        }
        Ok(Ok(report)) if report.trained => {
            readiness.finish(true);
            let loss = report.loss.unwrap_or_default();
            info!(predictor = %key, loss, "Model training completed");
            TrainingOutcome::Trained { loss }
        }
        Ok(Ok(_)) => {
            readiness.finish(false);
            warn!(predictor = %key, "Model reported training did not complete");
            TrainingOutcome::Rejected
        }
        Ok(Err(e)) => {
            error!(predictor = %key, error = %e, "Failed to receive training report");
            readiness.abort();
            TrainingOutcome::Failed(e.to_string())
        }
        Err(_) => {
            warn!(
                predictor = %key,
                timeout_secs = wait.as_secs(),
                "Timed out waiting for training report"
            );
            readiness.abort();
            TrainingOutcome::Failed("timed out waiting for training report".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::{samples, test_metric, StaticSource};
    use serde_json::Value;
    use std::path::Path;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};

    /// Behaviour of the fake model server
    #[derive(Clone)]
    struct FakeModel {
        train_reply: Option<&'static str>,
        /// Only report completion for training requests with this key
        complete_only: Option<&'static str>,
        predict_reply: &'static str,
    }

    /// Serve model requests on `path` until the test ends
    fn spawn_model(path: &Path, model: FakeModel) {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let model = model.clone();
                tokio::spawn(async move {
                    let (read, mut write) = tokio::io::split(stream);
                    let mut line = String::new();
                    BufReader::new(read).read_line(&mut line).await.unwrap();
                    let request: Value = serde_json::from_str(&line).unwrap();

                    if let Some(addr) = request.get("resp_recv_address").and_then(Value::as_str) {
                        let wanted = model
                            .complete_only
                            .map_or(true, |only| request["key"] == only);
                        if let Some(reply) = model.train_reply.filter(|_| wanted) {
                            let mut conn = UnixStream::connect(addr).await.unwrap();
                            conn.write_all(reply.as_bytes()).await.unwrap();
                            conn.write_all(b"\n").await.unwrap();
                        }
                    } else {
                        write.write_all(model.predict_reply.as_bytes()).await.unwrap();
                        write.write_all(b"\n").await.unwrap();
                    }
                });
            }
        });
    }

    fn params(dir: &Path) -> RemoteParams {
        RemoteParams {
            address: dir.join("model.sock").display().to_string(),
            resp_recv_address: dir.join("rra.sock").display().to_string(),
            look_back: 3,
            look_forward: 2,
            batch_size: 1,
            train_size: 4,
            epochs: 1,
            n_layers: 1,
        }
    }

    fn predictor(dir: &Path, history: &[f64]) -> RemotePredictor {
        keyed_predictor(dir, "cpu$%$avg(cpu)$remote", history)
    }

    fn keyed_predictor(dir: &Path, key: &str, history: &[f64]) -> RemotePredictor {
        let worker = Arc::new(CollectorWorker::new(
            test_metric("cpu"),
            Arc::new(StaticSource::new(vec![])),
            0,
        ));
        worker.append(samples(history));
        RemotePredictor::new(key.to_string(), params(dir), worker)
            .unwrap()
            .with_timeouts(Duration::from_secs(2), Duration::from_millis(300))
    }

    const TRAINED: &str = r#"{"trained":true,"loss":0.25,"error":""}"#;
    const PREDICTION: &str = r#"{"trained":true,"prediction":[5.0,6.0],"loss":0.25,"error":""}"#;

    #[tokio::test]
    async fn test_predict_before_training_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = predictor(dir.path(), &[1.0, 2.0, 3.0, 4.0]);

        assert!(matches!(predictor.predict().await, Err(PredictError::ModelNotReady)));
        assert_eq!(predictor.state(), ModelState::Untrained);
    }

    #[tokio::test]
    async fn test_train_then_predict() {
        let dir = tempfile::tempdir().unwrap();
        spawn_model(
            &dir.path().join("model.sock"),
            FakeModel {
                train_reply: Some(TRAINED),
                complete_only: None,
                predict_reply: PREDICTION,
            },
        );
        let predictor = predictor(dir.path(), &[1.0, 2.0, 3.0, 4.0]);

        let handle = predictor.train().await.unwrap();
        assert_eq!(handle.wait().await, TrainingOutcome::Trained { loss: 0.25 });
        assert!(predictor.is_ready());
        assert_eq!(predictor.state(), ModelState::Ready);

        let forecast = predictor.predict().await.unwrap();
        assert_eq!(forecast.values, vec![5.0, 6.0]);
        assert_eq!(forecast.baseline, 4.0);
        assert_eq!(forecast.loss, Some(0.25));
    }

    #[tokio::test]
    async fn test_training_error_report_keeps_flag() {
        let dir = tempfile::tempdir().unwrap();
        spawn_model(
            &dir.path().join("model.sock"),
            FakeModel {
                train_reply: Some(r#"{"trained":false,"error":"out of memory"}"#),
                complete_only: None,
                predict_reply: PREDICTION,
            },
        );
        let predictor = predictor(dir.path(), &[1.0, 2.0, 3.0, 4.0]);

        let outcome = predictor.train().await.unwrap().wait().await;
        assert_eq!(outcome, TrainingOutcome::Failed("out of memory".to_string()));
        assert!(!predictor.is_ready());
        assert_eq!(predictor.state(), ModelState::Untrained);
    }

    #[tokio::test]
    async fn test_training_timeout_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        spawn_model(
            &dir.path().join("model.sock"),
            FakeModel {
                train_reply: None,
                complete_only: None,
                predict_reply: PREDICTION,
            },
        );
        let predictor = predictor(dir.path(), &[1.0, 2.0, 3.0, 4.0]);

        let handle = predictor.train().await.unwrap();
        assert_eq!(predictor.state(), ModelState::Training);
        assert!(matches!(
            predictor.train().await,
            Err(PredictError::TrainingInProgress)
        ));

        assert!(matches!(handle.wait().await, TrainingOutcome::Failed(_)));
        assert_eq!(predictor.state(), ModelState::Untrained);
        assert!(predictor.train().await.is_ok());
    }

    #[tokio::test]
    async fn test_train_requires_train_size_samples() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = predictor(dir.path(), &[1.0, 2.0]);

        match predictor.train().await {
            Err(PredictError::InsufficientData { have, need }) => {
                assert_eq!(have, 2);
                assert_eq!(need, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(predictor.state(), ModelState::Untrained);
    }

    #[tokio::test]
    async fn test_unreachable_model_rolls_back_training_state() {
        let dir = tempfile::tempdir().unwrap();
        let predictor = predictor(dir.path(), &[1.0, 2.0, 3.0, 4.0]);

        assert!(matches!(
            predictor.train().await,
            Err(PredictError::Transport(_))
        ));
        assert_eq!(predictor.state(), ModelState::Untrained);
    }

    #[tokio::test]
    async fn test_untrained_prediction_reply_clears_readiness() {
        let dir = tempfile::tempdir().unwrap();
        spawn_model(
            &dir.path().join("model.sock"),
            FakeModel {
                train_reply: Some(TRAINED),
                complete_only: None,
                predict_reply: r#"{"trained":false,"prediction":[],"loss":0,"error":""}"#,
            },
        );
        let predictor = predictor(dir.path(), &[1.0, 2.0, 3.0, 4.0]);
        predictor.train().await.unwrap().wait().await;
        assert!(predictor.is_ready());

        assert!(matches!(predictor.predict().await, Err(PredictError::ModelNotReady)));
        assert!(!predictor.is_ready());
    }

    #[tokio::test]
    async fn test_predictors_sharing_completion_address_get_their_own_reports() {
        let dir = tempfile::tempdir().unwrap();
        spawn_model(
            &dir.path().join("model.sock"),
            FakeModel {
                train_reply: Some(r#"{"trained": true, "key": "A", "prediction": null, "loss": 0.1, "error": ""}"#),
                complete_only: Some("A"),
                predict_reply: PREDICTION,
            },
        );
        let a = keyed_predictor(dir.path(), "A", &[1.0, 2.0, 3.0, 4.0]);
        let b = keyed_predictor(dir.path(), "B", &[1.0, 2.0, 3.0, 4.0]);
        assert_ne!(a.completion_address(), b.completion_address());

        let handle_a = a.train().await.unwrap();
        let handle_b = b.train().await.unwrap();

        assert_eq!(handle_a.wait().await, TrainingOutcome::Trained { loss: 0.1 });
        assert!(a.is_ready());

        assert!(matches!(handle_b.wait().await, TrainingOutcome::Failed(_)));
        assert!(!b.is_ready());
        assert_eq!(b.state(), ModelState::Untrained);
    }

    #[tokio::test]
    async fn test_report_for_another_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        spawn_model(
            &dir.path().join("model.sock"),
            FakeModel {
                train_reply: Some(r#"{"trained":true,"key":"someone-else","loss":0.1,"error":""}"#),
                complete_only: None,
                predict_reply: PREDICTION,
            },
        );
        let predictor = predictor(dir.path(), &[1.0, 2.0, 3.0, 4.0]);

        let outcome = predictor.train().await.unwrap().wait().await;
        assert!(matches!(outcome, TrainingOutcome::Failed(_)));
        assert!(!predictor.is_ready());
    }

    #[tokio::test]
    async fn test_prediction_reply_without_loss() {
        let dir = tempfile::tempdir().unwrap();
        spawn_model(
            &dir.path().join("model.sock"),
            FakeModel {
                train_reply: Some(r#"{"trained": true, "key": "cpu$%$avg(cpu)$remote", "prediction": null, "loss": 0.5, "error": ""}"#),
                complete_only: None,
                predict_reply: r#"{"trained": true, "key": "cpu$%$avg(cpu)$remote", "prediction": [5.0, 6.0], "loss": null, "error": ""}"#,
            },
        );
        let predictor = predictor(dir.path(), &[1.0, 2.0, 3.0, 4.0]);
        predictor.train().await.unwrap().wait().await;

        let forecast = predictor.predict().await.unwrap();
        assert_eq!(forecast.values, vec![5.0, 6.0]);
        assert_eq!(forecast.loss, None);
    }
}
