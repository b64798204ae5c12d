use crate::answer::{build_context, NO_CONTEXT_ANSWER};
use crate::chunking::Chunker;
use crate::config::EngineConfig;
use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::extractor::DocumentExtractor;
use crate::ingest::{IngestJob, IngestPipeline, IngestQueue};
use crate::metrics::{MetricsSummary, MetricsTracker, QueryMetricRecord};
use crate::models::{AnswerResponse, Document, DocumentKind, QueryResponse, StoreStats};
use crate::orchestrator::RetrievalCoordinator;
use crate::store::{CorpusStore, METRICS_FILE};
use crate::traits::{AnswerGenerator, TextExtractor};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_TOP_K: usize = 5;

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

/// Document QA over one corpus: background ingestion, retrieval, answering
/// and query metrics. Must be opened inside a tokio runtime.
pub struct QaEngine<E>
where
    E: Embedder + 'static,
{
    store: Arc<CorpusStore>,
    pipeline: Arc<IngestPipeline<E>>,
    coordinator: RetrievalCoordinator<E>,
    metrics: MetricsTracker,
    generator: Arc<dyn AnswerGenerator>,
    queue: IngestQueue,
}

impl<E> QaEngine<E>
where
    E: Embedder + 'static,
{
    pub fn open(
        config: EngineConfig,
        embedder: E,
        generator: Arc<dyn AnswerGenerator>,
    ) -> Result<Self, RagError> {
        Self::open_with_extractor(config, embedder, generator, Arc::new(DocumentExtractor))
    }

    pub fn open_with_extractor(
        config: EngineConfig,
        embedder: E,
        generator: Arc<dyn AnswerGenerator>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Result<Self, RagError> {
        config.validate()?;
        if embedder.dimensions() != config.embedding_dimensions {
            error!(
                configured = config.embedding_dimensions,
                embedder = embedder.dimensions(),
                "embedder dimension differs from configuration"
            );
            return Err(RagError::DimensionMismatch {
                expected: config.embedding_dimensions,
                actual: embedder.dimensions(),
            });
        }

        let (store, metrics) = match &config.data_dir {
            Some(dir) => (
                CorpusStore::open(dir, config.embedding_dimensions)?,
                MetricsTracker::open(dir.join(METRICS_FILE), config.quality)?,
            ),
            None => (
                CorpusStore::in_memory(config.embedding_dimensions),
                MetricsTracker::in_memory(config.quality),
            ),
        };
        let store = Arc::new(store);
        let embedder = Arc::new(embedder);

        let pipeline = Arc::new(IngestPipeline::new(
            Chunker::new(config.chunking)?,
            Arc::clone(&embedder),
            Arc::clone(&store),
            extractor,
        ));
        let queue = IngestQueue::start(Arc::clone(&pipeline), config.ingest_workers)?;
        let coordinator = RetrievalCoordinator::new(Arc::clone(&store), embedder, config.confidence);

        info!(
            dimensions = config.embedding_dimensions,
            workers = config.ingest_workers,
            persistent = config.data_dir.is_some(),
            "engine ready"
        );

        Ok(Self {
            store,
            pipeline,
            coordinator,
            metrics,
            generator,
            queue,
        })
    }

    /// Registers an upload as `pending` and queues it for background
    /// ingestion. Only `.pdf` and `.txt` files are accepted. Once queued the
    /// document always reaches a terminal status; failing to persist the
    /// pending record is logged, not returned.
    pub fn submit_document(&self, filename: &str, bytes: Vec<u8>) -> Result<Document, RagError> {
        let filename = Path::new(filename.trim())
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| RagError::InvalidInput("filename is empty".to_string()))?;
        let kind = DocumentKind::from_filename(filename).ok_or_else(|| {
            RagError::InvalidInput(format!(
                "unsupported file type for {filename}: only .pdf and .txt are accepted"
            ))
        })?;

        let document = Document::pending(Uuid::new_v4().to_string(), filename);
        self.store.register_document(document.clone())?;
        self.queue.submit(IngestJob {
            document_id: document.id.clone(),
            filename: filename.to_string(),
            kind,
            bytes,
        })?;
        info!(document_id = %document.id, filename, %kind, "document queued");

        if let Err(persist_error) = self.store.persist() {
            warn!(document_id = %document.id, error = %persist_error, "pending document was not persisted");
        }
        Ok(document)
    }

    /// Indexes already extracted text in the calling thread. A failed
    /// document is persisted too, best effort, so it survives a restart.
    pub fn ingest(&self, document_id: &str, raw_text: &str) -> Result<Document, RagError> {
        match self.pipeline.ingest(document_id, raw_text) {
            Ok(document) => {
                self.store.persist()?;
                Ok(document)
            }
            Err(failure) => {
                if let Err(persist_error) = self.store.persist() {
                    warn!(document_id, error = %persist_error, "failed document was not persisted");
                }
                Err(failure)
            }
        }
    }

    pub fn delete_document(&self, document_id: &str) -> Result<(), RagError> {
        if !self.store.remove(document_id)? {
            return Err(RagError::NotFound(format!("document {document_id}")));
        }
        self.store.persist()
    }

    /// Retrieval only; the metric is recorded with zero LLM latency.
    pub fn query(
        &self,
        question: &str,
        top_k: usize,
        document_filter: Option<&str>,
    ) -> Result<QueryResponse, RagError> {
        let started = Instant::now();
        let response = self.coordinator.retrieve(question, top_k, document_filter)?;
        let total_ms = elapsed_ms(started);

        self.record_metric(&response, total_ms, 0.0);
        Ok(response)
    }

    /// Retrieves context and asks the generator for an answer.
    pub async fn ask(
        &self,
        question: &str,
        top_k: usize,
        document_filter: Option<&str>,
    ) -> Result<AnswerResponse, RagError> {
        if !self.store.has_chunks() {
            return Err(RagError::InvalidInput(
                "no documents available, ingest documents first".to_string(),
            ));
        }

        let started = Instant::now();
        let retrieval = self.coordinator.retrieve(question, top_k, document_filter)?;

        let (answer, llm_latency_ms) = if retrieval.results.is_empty() {
            (NO_CONTEXT_ANSWER.to_string(), 0.0)
        } else {
            let context = build_context(&retrieval.results);
            let llm_started = Instant::now();
            let answer = self.generator.generate_answer(question, &context).await?;
            (answer, elapsed_ms(llm_started))
        };
        let total_latency_ms = elapsed_ms(started);

        self.record_metric(&retrieval, total_latency_ms, llm_latency_ms);
        Ok(AnswerResponse {
            answer,
            retrieval,
            llm_latency_ms,
            total_latency_ms,
        })
    }

    fn record_metric(&self, response: &QueryResponse, total_latency_ms: f64, llm_latency_ms: f64) {
        let record = QueryMetricRecord {
            timestamp: Utc::now(),
            total_latency_ms,
            retrieval_latency_ms: response.timings.total_ms(),
            llm_latency_ms,
            avg_similarity: response.avg_similarity,
            confidence_score: response.confidence,
            num_results: response.results.len(),
            embed_latency_ms: Some(response.timings.embed_ms),
            search_latency_ms: Some(response.timings.search_ms),
        };
        if let Err(error) = self.metrics.record(record) {
            warn!(%error, "query metric was not recorded");
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSummary {
        self.metrics.aggregate()
    }

    pub fn document(&self, document_id: &str) -> Option<Document> {
        self.store.get_document(document_id)
    }

    pub fn documents(&self) -> Vec<Document> {
        self.store.list_documents()
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn persist(&self) -> Result<(), RagError> {
        self.store.persist()
    }

    /// Finishes every queued ingestion job, then persists.
    pub async fn shutdown(self) -> Result<(), RagError> {
        self.queue.shutdown().await;
        self.store.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::ExtractiveAnswerGenerator;
    use crate::config::ChunkingConfig;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::DocumentStatus;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;

    const DIMS: usize = 96;

    struct FailingGenerator;

    #[async_trait]
    impl AnswerGenerator for FailingGenerator {
        async fn generate_answer(&self, _question: &str, _context: &str) -> Result<String, RagError> {
            Err(RagError::Answer("model unavailable".to_string()))
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            chunking: ChunkingConfig {
                target_tokens: 20,
                overlap_tokens: 4,
            },
            embedding_dimensions: DIMS,
            ..EngineConfig::default()
        }
    }

    fn engine_with(config: EngineConfig, generator: Arc<dyn AnswerGenerator>) -> QaEngine<CharacterNgramEmbedder> {
        QaEngine::open(config, CharacterNgramEmbedder::new(DIMS), generator).unwrap()
    }

    fn engine() -> QaEngine<CharacterNgramEmbedder> {
        engine_with(config(), Arc::new(ExtractiveAnswerGenerator))
    }

    async fn wait_until_finished(engine: &QaEngine<CharacterNgramEmbedder>, document_id: &str) -> Document {
        for _ in 0..500 {
            if let Some(document) = engine.document(document_id) {
                if document.status.is_terminal() {
                    return document;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("document {document_id} never finished ingestion");
    }

    #[tokio::test]
    async fn invalid_configuration_fails_at_startup() {
        let mut bad = config();
        bad.chunking.overlap_tokens = bad.chunking.target_tokens;
        assert!(matches!(
            QaEngine::open(bad, CharacterNgramEmbedder::new(DIMS), Arc::new(ExtractiveAnswerGenerator)),
            Err(RagError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn embedder_must_match_configured_dimension() {
        assert!(matches!(
            QaEngine::open(config(), CharacterNgramEmbedder::new(DIMS + 1), Arc::new(ExtractiveAnswerGenerator)),
            Err(RagError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submitted_documents_are_ingested_in_the_background() {
        let engine = engine();
        let submitted = engine
            .submit_document("notes/pump.txt", b"The pump must be primed before start.".to_vec())
            .unwrap();

        assert_eq!(submitted.filename, "pump.txt");
        assert_eq!(submitted.status, DocumentStatus::Pending);
        assert_eq!(Uuid::parse_str(&submitted.id).unwrap().get_version_num(), 4);

        let finished = wait_until_finished(&engine, &submitted.id).await;
        assert_eq!(finished.status, DocumentStatus::Completed);
        assert_eq!(finished.chunk_count, Some(1));
        assert_eq!(engine.stats().live_chunks, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreadable_uploads_end_up_failed() {
        let engine = engine();
        let submitted = engine
            .submit_document("broken.pdf", b"%PDF-1.4\n%broken".to_vec())
            .unwrap();

        let finished = wait_until_finished(&engine, &submitted.id).await;
        assert_eq!(finished.status, DocumentStatus::Failed);
        assert!(finished.error.is_some());
        assert_eq!(engine.stats().live_chunks, 0);
    }

    #[tokio::test]
    async fn unsupported_uploads_are_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.submit_document("slides.pptx", vec![1, 2, 3]),
            Err(RagError::InvalidInput(_))
        ));
        assert!(engine.documents().is_empty());
    }

    #[tokio::test]
    async fn query_records_a_metric() {
        let engine = engine();
        engine
            .ingest("pumps", "Prime the pump before starting the motor.")
            .unwrap();
        engine
            .ingest("safety", "Wear gloves and goggles in the workshop.")
            .unwrap();

        let response = engine.query("how do I start the pump", 1, None).unwrap();
        assert_eq!(response.results[0].chunk.document_id, "pumps");

        let summary = engine.metrics_snapshot();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.mean_llm_latency_ms, 0.0);
        assert_eq!(summary.recent[0].num_results, 1);
    }

    #[tokio::test]
    async fn ask_needs_an_indexed_corpus() {
        let engine = engine();
        assert!(matches!(
            engine.ask("anything?", DEFAULT_TOP_K, None).await,
            Err(RagError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn ask_cites_retrieved_sources() {
        let engine = engine();
        engine
            .ingest("pumps", "Prime the pump before starting the motor.")
            .unwrap();

        let response = engine.ask("How do I start the pump?", 3, None).await.unwrap();
        assert!(response.answer.contains("Prime the pump"));
        assert_eq!(response.retrieval.results.len(), 1);
        assert!(response.total_latency_ms >= response.llm_latency_ms);
        assert_eq!(engine.metrics_snapshot().count, 1);
    }

    #[tokio::test]
    async fn ask_without_hits_has_zero_confidence() {
        let engine = engine();
        engine.ingest("pumps", "Prime the pump.").unwrap();

        let response = engine
            .ask("How do I start the pump?", 3, Some("unknown"))
            .await
            .unwrap();
        assert_eq!(response.answer, NO_CONTEXT_ANSWER);
        assert_eq!(response.retrieval.confidence, 0.0);
        assert_eq!(response.llm_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn generator_failures_are_returned() {
        let engine = engine_with(config(), Arc::new(FailingGenerator));
        engine.ingest("pumps", "Prime the pump.").unwrap();

        assert!(matches!(
            engine.ask("How?", 3, None).await,
            Err(RagError::Answer(_))
        ));
        assert_eq!(engine.metrics_snapshot().count, 0);
    }

    #[tokio::test]
    async fn deleting_a_document_drops_its_chunks() {
        let engine = engine();
        engine.ingest("pumps", "Prime the pump.").unwrap();
        engine.ingest("safety", "Wear gloves.").unwrap();

        engine.delete_document("pumps").unwrap();

        assert!(engine.document("pumps").is_none());
        let response = engine.query("pump", 5, None).unwrap();
        assert!(response
            .results
            .iter()
            .all(|hit| hit.chunk.document_id == "safety"));
        assert!(matches!(
            engine.delete_document("pumps"),
            Err(RagError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_survives_a_restart() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut persistent = config();
        persistent.data_dir = Some(dir.path().to_path_buf());

        let engine = engine_with(persistent.clone(), Arc::new(ExtractiveAnswerGenerator));
        engine.ingest("pumps", "Prime the pump before starting the motor.")?;
        engine.query("pump", 2, None)?;
        engine.shutdown().await?;

        let reopened = engine_with(persistent, Arc::new(ExtractiveAnswerGenerator));
        assert_eq!(reopened.stats().live_chunks, 1);
        assert_eq!(
            reopened.document("pumps").map(|document| document.status),
            Some(DocumentStatus::Completed)
        );
        let response = reopened.query("pump", 2, None)?;
        assert_eq!(response.results[0].chunk.document_id, "pumps");
        assert_eq!(reopened.metrics_snapshot().count, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn uploads_finish_even_when_persisting_fails() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut persistent = config();
        persistent.data_dir = Some(dir.path().to_path_buf());
        let engine = engine_with(persistent, Arc::new(ExtractiveAnswerGenerator));

        // A directory where the staged index file goes makes every persist fail.
        std::fs::create_dir(dir.path().join("index.tmp"))?;
        assert!(engine.persist().is_err());

        let submitted = engine.submit_document("a.txt", b"Prime the pump first.".to_vec())?;
        let finished = wait_until_finished(&engine, &submitted.id).await;
        assert_eq!(finished.status, DocumentStatus::Completed);
        assert_eq!(engine.query("pump", 1, None)?.results.len(), 1);

        std::fs::remove_dir(dir.path().join("index.tmp"))?;
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_ingestion_is_persisted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut persistent = config();
        persistent.data_dir = Some(dir.path().to_path_buf());

        let engine = engine_with(persistent.clone(), Arc::new(ExtractiveAnswerGenerator));
        assert!(engine.ingest("blank", "  \n ").is_err());
        drop(engine);

        let reopened = engine_with(persistent, Arc::new(ExtractiveAnswerGenerator));
        let document = reopened.document("blank").expect("failed document survives restart");
        assert_eq!(document.status, DocumentStatus::Failed);
        assert!(document.error.is_some());
        Ok(())
    }
}
