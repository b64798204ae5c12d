use crate::config::ConfidenceConfig;
use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::models::{QueryResponse, RetrievalTimings, RetrievedChunk};
use crate::store::CorpusStore;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Mean similarity of the hits; `0.0` for no hits.
pub fn average_similarity(results: &[RetrievedChunk]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(|hit| f64::from(hit.similarity)).sum::<f64>() / results.len() as f64
}

/// `w_sim * avg + w_high * (share above threshold)`, clamped to `[0, 1]`.
pub fn confidence_score(config: &ConfidenceConfig, similarities: &[f64]) -> f64 {
    if similarities.is_empty() {
        return 0.0;
    }
    let count = similarities.len() as f64;
    let average = similarities.iter().sum::<f64>() / count;
    let high = similarities
        .iter()
        .filter(|similarity| **similarity > config.high_similarity_threshold)
        .count() as f64;

    (config.similarity_weight * average + config.high_similarity_weight * (high / count))
        .clamp(0.0, 1.0)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

pub struct RetrievalCoordinator<E>
where
    E: Embedder,
{
    store: Arc<CorpusStore>,
    embedder: Arc<E>,
    confidence: ConfidenceConfig,
}

impl<E> RetrievalCoordinator<E>
where
    E: Embedder,
{
    pub fn new(store: Arc<CorpusStore>, embedder: Arc<E>, confidence: ConfidenceConfig) -> Self {
        Self {
            store,
            embedder,
            confidence,
        }
    }

    pub fn confidence(&self, results: &[RetrievedChunk]) -> f64 {
        let similarities: Vec<f64> = results.iter().map(|hit| f64::from(hit.similarity)).collect();
        confidence_score(&self.confidence, &similarities)
    }

    /// Embeds the question, searches the index and scores the hits. With a
    /// document filter only that document's chunks are candidates.
    pub fn retrieve(
        &self,
        query_text: &str,
        top_k: usize,
        document_filter: Option<&str>,
    ) -> Result<QueryResponse, RagError> {
        if query_text.trim().is_empty() {
            return Err(RagError::InvalidInput("query is empty".to_string()));
        }

        let started = Instant::now();
        let query_vector = self.embedder.embed(query_text)?;
        let embed_ms = elapsed_ms(started);

        let started = Instant::now();
        let results = match self.store.search(&query_vector, top_k, document_filter) {
            Ok(results) => results,
            Err(RagError::DimensionMismatch { expected, actual }) => {
                error!(expected, actual, "query embedding does not match index dimension");
                return Err(RagError::DimensionMismatch { expected, actual });
            }
            Err(other) => return Err(other),
        };
        let search_ms = elapsed_ms(started);

        let avg_similarity = average_similarity(&results);
        let confidence = self.confidence(&results);
        debug!(
            top_k,
            hits = results.len(),
            filter = document_filter.unwrap_or("-"),
            embed_ms,
            search_ms,
            "retrieval finished"
        );

        Ok(QueryResponse {
            question: query_text.to_string(),
            results,
            confidence,
            avg_similarity,
            timings: RetrievalTimings {
                embed_ms,
                search_ms,
            },
        })
    }
}
