use thiserror::Error;

/// Failure kinds surfaced by the analysis stages.
///
/// Each stage validates its own inputs and returns the most specific kind it can.
/// Callers decide whether a failure is fatal for the whole run or only for one instrument.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed, missing or out-of-range input data.
    #[error("data quality error: {0}")]
    DataQuality(String),

    /// Two series that must share a date index do not.
    #[error("alignment error: {0}")]
    Alignment(String),

    /// Model fitting did not converge, exceeded its budget, or produced non-finite output.
    #[error("convergence error: {0}")]
    Convergence(String),

    /// No allocation satisfies the portfolio constraints.
    #[error("infeasible allocation: {0}")]
    Infeasible(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataQuality(_) | Self::Io(_) | Self::Csv(_) => "DataQualityError",
            Self::Alignment(_) => "AlignmentError",
            Self::Convergence(_) => "ConvergenceError",
            Self::Infeasible(_) => "InfeasibleError",
        }
    }

    /// Whether the forecaster should retry with a simpler model family.
    pub fn is_convergence(&self) -> bool {
        matches!(self, Self::Convergence(_))
    }
}

impl From<candle_core::Error> for PipelineError {
    fn from(e: candle_core::Error) -> Self {
        Self::Convergence(format!("sequence model backend failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_taxonomy() {
        assert_eq!(PipelineError::DataQuality("x".into()).kind(), "DataQualityError");
        assert_eq!(PipelineError::Alignment("x".into()).kind(), "AlignmentError");
        assert_eq!(PipelineError::Convergence("x".into()).kind(), "ConvergenceError");
        assert_eq!(PipelineError::Infeasible("x".into()).kind(), "InfeasibleError");

        let io = PipelineError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(io.kind(), "DataQualityError");
    }

    #[test]
    fn test_backend_errors_count_as_convergence() {
        let err = PipelineError::from(candle_core::Error::Msg("boom".into()));
        assert!(err.is_convergence());
        assert!(err.to_string().contains("boom"));
    }
}
