use crate::error::RagError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_TARGET_TOKENS: usize = 512;
pub const DEFAULT_OVERLAP_TOKENS: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: DEFAULT_TARGET_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), RagError> {
        if self.target_tokens == 0 {
            return Err(RagError::InvalidInput(
                "target_tokens must be greater than zero".to_string(),
            ));
        }
        if self.overlap_tokens >= self.target_tokens {
            return Err(RagError::InvalidInput(format!(
                "overlap_tokens ({}) must be smaller than target_tokens ({})",
                self.overlap_tokens, self.target_tokens
            )));
        }
        Ok(())
    }
}

/// Weights for `confidence = w_sim * avg_similarity + w_high * high_fraction`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceConfig {
    pub similarity_weight: f64,
    pub high_similarity_weight: f64,
    pub high_similarity_threshold: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.7,
            high_similarity_weight: 0.3,
            high_similarity_threshold: 0.7,
        }
    }
}

impl ConfidenceConfig {
    pub fn validate(&self) -> Result<(), RagError> {
        let weights = [self.similarity_weight, self.high_similarity_weight];
        if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
            return Err(RagError::InvalidInput(
                "confidence weights must be finite and non-negative".to_string(),
            ));
        }
        if !self.high_similarity_threshold.is_finite() {
            return Err(RagError::InvalidInput(
                "high_similarity_threshold must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QualityThresholds {
    pub high_confidence: f64,
    pub low_similarity: f64,
    pub slow_query_ms: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            high_confidence: 0.7,
            low_similarity: 0.5,
            slow_query_ms: 1_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub quality: QualityThresholds,
    #[serde(default = "default_dimensions")]
    pub embedding_dimensions: usize,
    #[serde(default = "default_workers")]
    pub ingest_workers: usize,
    /// Directory for index, metadata and metrics files. `None` keeps everything in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_dimensions() -> usize {
    crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS
}

fn default_workers() -> usize {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            confidence: ConfidenceConfig::default(),
            quality: QualityThresholds::default(),
            embedding_dimensions: default_dimensions(),
            ingest_workers: default_workers(),
            data_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), RagError> {
        self.chunking.validate()?;
        self.confidence.validate()?;
        if self.embedding_dimensions == 0 {
            return Err(RagError::InvalidInput(
                "embedding_dimensions must be greater than zero".to_string(),
            ));
        }
        if self.ingest_workers == 0 {
            return Err(RagError::InvalidInput(
                "ingest_workers must be at least one".to_string(),
            ));
        }
        Ok(())
    }
}
