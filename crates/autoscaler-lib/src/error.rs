//! Error types shared across the prediction and scaling pipeline

use thiserror::Error;

/// Failure talking to an external collaborator (metric backend or orchestrator)
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected response: {0}")]
    Response(String),

    #[error("workload not found: {0}")]
    NotFound(String),
}

/// Errors raised by predictors and the scheduler
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("insufficient data: have {have} samples, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("model is not ready to predict")]
    ModelNotReady,

    #[error("a training round trip is already in flight")]
    TrainingInProgress,

    #[error("configuration out of sync: {0}")]
    ConfigurationSync(String),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("model transport error: {0}")]
    Transport(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("operation timed out")]
    Timeout,
}

impl PredictError {
    /// Expected steady-state conditions while a model warms up
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PredictError::InsufficientData { .. }
                | PredictError::ModelNotReady
                | PredictError::TrainingInProgress
        )
    }
}

impl From<std::io::Error> for PredictError {
    fn from(e: std::io::Error) -> Self {
        PredictError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for PredictError {
    fn from(e: serde_json::Error) -> Self {
        PredictError::Transport(format!("malformed payload: {}", e))
    }
}

/// Errors raised by scale commands
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("target replicas {target} is not above current {current}")]
    NotAbove { target: i32, current: i32 },

    #[error("target replicas {target} is not below current {current}")]
    NotBelow { target: i32, current: i32 },

    #[error(transparent)]
    Client(#[from] SourceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PredictError::InsufficientData { have: 1, need: 2 }.is_transient());
        assert!(PredictError::ModelNotReady.is_transient());
        assert!(PredictError::TrainingInProgress.is_transient());
        assert!(!PredictError::Transport("broken pipe".into()).is_transient());
        assert!(!PredictError::ConfigurationSync("missing model".into()).is_transient());
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let err: PredictError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, PredictError::Transport(_)));
    }
}
