use crate::error::{ExtractionError, RagError};
use crate::models::DocumentKind;
use async_trait::async_trait;

/// Turns raw file bytes into plain text.
pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, bytes: &[u8], kind: DocumentKind) -> Result<String, ExtractionError>;
}

/// Produces prose from a question and a prepared context string.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate_answer(&self, question: &str, context: &str) -> Result<String, RagError>;
}
