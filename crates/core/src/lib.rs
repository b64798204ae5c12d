pub mod answer;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod metadata;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod traits;

pub use answer::{build_context, ExtractiveAnswerGenerator, HttpAnswerGenerator, NO_CONTEXT_ANSWER};
pub use chunking::{count_tokens, Chunker, TextSegment};
pub use config::{ChunkingConfig, ConfidenceConfig, EngineConfig, QualityThresholds};
pub use embeddings::{CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use engine::{QaEngine, DEFAULT_TOP_K};
pub use error::{ExtractionError, RagError, Result};
pub use extractor::DocumentExtractor;
pub use index::{FlatIndex, IndexHit};
pub use ingest::{digest_text, discover_documents, IngestJob, IngestPipeline, IngestQueue};
pub use metadata::{ChunkTable, DocumentTable};
pub use metrics::{MetricsSummary, MetricsTracker, QueryMetricRecord};
pub use models::{
    AnswerResponse, CharSpan, Chunk, Document, DocumentKind, DocumentStatus, QueryResponse,
    RetrievalTimings, RetrievedChunk, StoreStats,
};
pub use orchestrator::{confidence_score, RetrievalCoordinator};
pub use store::{CorpusStore, Generation};
pub use traits::{AnswerGenerator, TextExtractor};
