use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,
    #[error("sweep index {index} out of range ({count} sweeps)")]
    SweepIndex { index: usize, count: usize },
    #[error("recording {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("failed to render figure: {0}")]
    Plot(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for AnalysisError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        AnalysisError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for AnalysisError {
    fn from(value: image::ImageError) -> Self {
        AnalysisError::Plot(value.to_string())
    }
}
