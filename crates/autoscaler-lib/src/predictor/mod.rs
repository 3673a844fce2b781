//! Forecasting models
//!
//! A [`Predictor`] reads the trailing history of one collector and produces
//! a [`Forecast`]. The set of models is closed and chosen when the predictor
//! is built from its [`ModelSpec`].

mod holt_winters;
mod remote;
pub mod transport;

pub use holt_winters::{triple_exponential_smoothing, HoltWintersPredictor};
pub use remote::{
    ModelState, RemotePredictor, TrainingHandle, TrainingOutcome, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_TRAINING_TIMEOUT,
};

use crate::collector::CollectorWorker;
use crate::error::PredictError;
use crate::models::{Forecast, ModelKind, ModelSpec};
use std::sync::Arc;

#[derive(Debug)]
pub enum Predictor {
    HoltWinters(HoltWintersPredictor),
    Remote(RemotePredictor),
}

impl Predictor {
    /// Build the predictor described by `spec` on top of `worker`
    pub fn from_spec(
        key: String,
        spec: &ModelSpec,
        worker: Arc<CollectorWorker>,
    ) -> Result<Self, PredictError> {
        match &spec.kind {
            ModelKind::HoltWinters(params) => Ok(Predictor::HoltWinters(
                HoltWintersPredictor::new(key, *params, worker)?,
            )),
            ModelKind::Remote(params) => Ok(Predictor::Remote(RemotePredictor::new(
                key,
                params.clone(),
                worker,
            )?)),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Predictor::HoltWinters(p) => p.key(),
            Predictor::Remote(p) => p.key(),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Predictor::HoltWinters(_) => ModelKind::HOLT_WINTERS,
            Predictor::Remote(_) => ModelKind::REMOTE,
        }
    }

    /// Whether the model can serve predictions right now
    pub fn is_ready(&self) -> bool {
        match self {
            Predictor::HoltWinters(_) => true,
            Predictor::Remote(p) => p.is_ready(),
        }
    }

    pub async fn predict(&self) -> Result<Forecast, PredictError> {
        match self {
            Predictor::HoltWinters(p) => p.predict(),
            Predictor::Remote(p) => p.predict().await,
        }
    }

    /// Start a training round
    ///
    /// In-process models have nothing to train and return `None`.
    pub async fn train(&self) -> Result<Option<TrainingHandle>, PredictError> {
        match self {
            Predictor::HoltWinters(_) => Ok(None),
            Predictor::Remote(p) => p.train().await.map(Some),
        }
    }
}
