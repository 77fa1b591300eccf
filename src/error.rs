use thiserror::Error;

/// Errors surfaced by the forecasting core.
///
/// `ArtifactUnavailable` and `InferenceFailure` are absorbed inside the
/// prediction service (they select the heuristic path); they only reach callers
/// that use the model path directly.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("Team not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No trained bundle available: {0}")]
    ArtifactUnavailable(String),

    #[error("Inference failed: {0}")]
    InferenceFailure(String),

    #[error("Ingestion failed: {0}")]
    IngestionFailure(String),

    #[error("Training failed: {0}")]
    TrainingFailure(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ForecastError>;
