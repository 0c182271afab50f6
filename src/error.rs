//! Error taxonomy shared by every pipeline stage.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("No chess board found in image")]
    BoardNotFound,

    #[error("Position encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Invalid analysis request: {0}")]
    InvalidRequest(String),

    #[error("Engine session is closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl AnalyzerError {
    /// True for outcomes the pipeline degrades around and the caller may retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AnalyzerError::BoardNotFound
                | AnalyzerError::EncodingFailed(_)
                | AnalyzerError::InvalidPosition(_)
                | AnalyzerError::AnalysisFailed(_)
                | AnalyzerError::EngineUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(AnalyzerError::BoardNotFound.is_recoverable());
        assert!(AnalyzerError::AnalysisFailed("eof".into()).is_recoverable());
        assert!(!AnalyzerError::SessionClosed.is_recoverable());
        assert!(!AnalyzerError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            AnalyzerError::InvalidPosition("no kings".into()).to_string(),
            "Invalid position: no kings"
        );
        assert_eq!(AnalyzerError::BoardNotFound.to_string(), "No chess board found in image");
    }
}
