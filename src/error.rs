use thiserror::Error;

use crate::ingest::IngestStage;

/// Main error type for Tempograph
#[derive(Error, Debug)]
pub enum TempographError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors (fatal, raised before any I/O)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed episode or group id
    #[error("Validation error: {0}")]
    Validation(String),

    /// Embedding API errors
    #[error("Embedding API error: {0}")]
    Embedding(String),

    /// Language model API errors
    #[error("LLM error: {0}")]
    Llm(String),

    /// Response parse errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Episode not found
    #[error("Episode not found: {0}")]
    EpisodeNotFound(String),

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Edge not found
    #[error("Edge not found: {0}")]
    EdgeNotFound(String),

    /// Search errors
    #[error("Search error: {0}")]
    Search(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A resolution strategy failed and the active policy surfaced it
    #[error("Strategy '{strategy}' failed during {operation}: {message}")]
    Strategy {
        strategy: String,
        operation: String,
        message: String,
    },

    /// The caller cancelled the run or its deadline passed
    #[error("Cancelled during {0}")]
    Cancelled(IngestStage),

    /// An ingestion stage failed; wraps the underlying cause
    #[error("Ingestion failed at {stage}: {source}")]
    Stage {
        stage: IngestStage,
        #[source]
        source: Box<TempographError>,
    },
}

impl TempographError {
    /// Wrap this error with the ingestion stage it surfaced from.
    ///
    /// Cancellation and already-wrapped errors pass through untouched.
    pub fn at_stage(self, stage: IngestStage) -> Self {
        match self {
            e @ TempographError::Stage { .. } | e @ TempographError::Cancelled(_) => e,
            other => TempographError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through stage wrappers.
    pub fn root_cause(&self) -> &TempographError {
        match self {
            TempographError::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Convenient Result type using TempographError
pub type Result<T> = std::result::Result<T, TempographError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TempographError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: TempographError = rusqlite_err.into();
        assert!(matches!(err, TempographError::Database(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TempographError = io_err.into();
        assert!(matches!(err, TempographError::Io(_)));
    }

    #[test]
    fn test_stage_wrapping() {
        let err = TempographError::Llm("timeout".to_string()).at_stage(IngestStage::ExtractEntities);
        assert!(err.to_string().contains("extract_entities"));
        assert!(matches!(err.root_cause(), TempographError::Llm(_)));

        // Re-wrapping keeps the original stage
        let rewrapped = err.at_stage(IngestStage::Persist);
        assert!(rewrapped.to_string().contains("extract_entities"));
    }

    #[test]
    fn test_cancelled_is_not_wrapped() {
        let err = TempographError::Cancelled(IngestStage::Chunk).at_stage(IngestStage::Persist);
        assert!(matches!(err, TempographError::Cancelled(IngestStage::Chunk)));
    }
}
