use crate::models::DocumentKind;
use thiserror::Error;

/// Text extraction failure, carrying the original cause.
#[derive(Debug, Error)]
#[error("failed to extract {kind} text: {message}")]
pub struct ExtractionError {
    pub kind: DocumentKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ExtractionError {
    pub fn new(kind: DocumentKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: DocumentKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("vector dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("persisted state is inconsistent: {0}")]
    CorruptState(String),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("answer generation failed: {0}")]
    Answer(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
