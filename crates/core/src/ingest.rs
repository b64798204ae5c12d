use crate::chunking::Chunker;
use crate::embeddings::Embedder;
use crate::error::RagError;
use crate::models::{Document, DocumentKind, DocumentStatus};
use crate::store::CorpusStore;
use crate::traits::TextExtractor;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Ingestible files under `folder`, recursively, in path order.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(DocumentKind::from_filename)
            .is_some();

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Raw upload waiting for extraction and indexing.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub document_id: String,
    pub filename: String,
    pub kind: DocumentKind,
    pub bytes: Vec<u8>,
}

/// Chunk, embed and commit one document at a time. Every failure leaves the
/// document `failed` with the reason recorded and no chunks in the index.
pub struct IngestPipeline<E>
where
    E: Embedder,
{
    chunker: Chunker,
    embedder: Arc<E>,
    store: Arc<CorpusStore>,
    extractor: Arc<dyn TextExtractor>,
}

impl<E> IngestPipeline<E>
where
    E: Embedder,
{
    pub fn new(
        chunker: Chunker,
        embedder: Arc<E>,
        store: Arc<CorpusStore>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Self {
        Self {
            chunker,
            embedder,
            store,
            extractor,
        }
    }

    pub fn store(&self) -> &Arc<CorpusStore> {
        &self.store
    }

    /// Extracts the upload's text, then runs [`IngestPipeline::ingest`].
    pub fn process(&self, job: &IngestJob) -> Result<Document, RagError> {
        self.store
            .set_document_status(&job.document_id, DocumentStatus::Processing, None)?;

        let text = match self.extractor.extract_text(&job.bytes, job.kind) {
            Ok(text) => text,
            Err(extraction) => {
                let reason = extraction.to_string();
                warn!(document_id = %job.document_id, filename = %job.filename, %reason, "text extraction failed");
                self.store.fail_document(&job.document_id, &reason)?;
                return Err(extraction.into());
            }
        };

        self.ingest(&job.document_id, &text)
    }

    /// Indexes `raw_text` for `document_id`. Unknown ids are registered first.
    pub fn ingest(&self, document_id: &str, raw_text: &str) -> Result<Document, RagError> {
        let document = match self.store.get_document(document_id) {
            Some(document) => document,
            None => {
                let document = Document::pending(document_id, document_id);
                self.store.register_document(document.clone())?;
                document
            }
        };

        match document.status {
            DocumentStatus::Pending => {
                self.store
                    .set_document_status(document_id, DocumentStatus::Processing, None)?;
            }
            DocumentStatus::Processing => {}
            status => {
                return Err(RagError::InvalidInput(format!(
                    "document {document_id} is already {status}"
                )))
            }
        }

        info!(document_id, filename = %document.filename, "ingestion started");
        match self.index_text(document_id, &document.filename, raw_text) {
            Ok(completed) => {
                info!(
                    document_id,
                    chunk_count = completed.chunk_count.unwrap_or_default(),
                    "ingestion finished"
                );
                Ok(completed)
            }
            Err(failure) => {
                error!(document_id, error = %failure, "ingestion failed");
                if let Err(status_error) = self.store.fail_document(document_id, &failure.to_string()) {
                    warn!(document_id, error = %status_error, "could not mark document failed");
                }
                Err(failure)
            }
        }
    }

    fn index_text(&self, document_id: &str, filename: &str, text: &str) -> Result<Document, RagError> {
        if text.trim().is_empty() {
            return Err(RagError::InvalidInput(format!(
                "document {document_id} contains no text"
            )));
        }
        self.store
            .set_document_checksum(document_id, digest_text(text))?;

        let chunks = self.chunker.chunk_document(document_id, filename, text);
        let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        let vectors = self.embedder.embed_batch(&texts)?;
        debug!(document_id, chunks = chunks.len(), "chunks embedded");

        self.store.commit_document(document_id, chunks, &vectors)
    }
}

/// Marks its document failed if dropped before the document reached a
/// terminal status (queue dropped, worker cancelled or panicked).
struct FailOnDrop {
    store: Arc<CorpusStore>,
    document_id: String,
}

impl Drop for FailOnDrop {
    fn drop(&mut self) {
        let unfinished = self
            .store
            .get_document(&self.document_id)
            .is_some_and(|document| !document.status.is_terminal());
        if !unfinished {
            return;
        }

        match self
            .store
            .fail_document(&self.document_id, "ingestion was cancelled")
        {
            Ok(_) => {
                warn!(document_id = %self.document_id, "ingestion cancelled");
                if let Err(persist_error) = self.store.persist() {
                    warn!(error = %persist_error, "could not persist cancelled document");
                }
            }
            Err(status_error) => {
                warn!(document_id = %self.document_id, error = %status_error, "could not mark cancelled document failed");
            }
        }
    }
}

struct QueuedJob {
    job: IngestJob,
    guard: FailOnDrop,
}

/// Background worker pool. Jobs are pulled from one shared queue and run on
/// the blocking thread pool; each success is persisted.
pub struct IngestQueue {
    sender: Option<mpsc::UnboundedSender<QueuedJob>>,
    store: Arc<CorpusStore>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestQueue {
    /// Spawns `workers` tasks on the current tokio runtime.
    pub fn start<E>(pipeline: Arc<IngestPipeline<E>>, workers: usize) -> Result<Self, RagError>
    where
        E: Embedder + 'static,
    {
        if workers == 0 {
            return Err(RagError::InvalidInput(
                "ingest_workers must be at least 1".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            RagError::InvalidInput("ingestion workers need a running tokio runtime".to_string())
        })?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let store = Arc::clone(pipeline.store());
        let workers = (0..workers)
            .map(|worker| {
                runtime.spawn(run_worker(
                    worker,
                    Arc::clone(&pipeline),
                    Arc::clone(&receiver),
                ))
            })
            .collect();

        Ok(Self {
            sender: Some(sender),
            store,
            workers,
        })
    }

    pub fn submit(&self, job: IngestJob) -> Result<(), RagError> {
        let guard = FailOnDrop {
            store: Arc::clone(&self.store),
            document_id: job.document_id.clone(),
        };
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| RagError::InvalidInput("ingestion queue is shut down".to_string()))?;
        sender
            .send(QueuedJob { job, guard })
            .map_err(|_| RagError::InvalidInput("ingestion queue is shut down".to_string()))
    }

    /// Stops accepting jobs and waits until every queued job has finished.
    pub async fn shutdown(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if let Err(join_error) = worker.await {
                error!(error = %join_error, "ingestion worker ended abnormally");
            }
        }
    }
}

async fn run_worker<E>(
    worker: usize,
    pipeline: Arc<IngestPipeline<E>>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
) where
    E: Embedder + 'static,
{
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(queued) = next else {
            break;
        };
        let document_id = queued.job.document_id.clone();
        debug!(worker, document_id = %document_id, "ingestion job picked up");

        let task_pipeline = Arc::clone(&pipeline);
        let outcome = tokio::task::spawn_blocking(move || {
            let QueuedJob { job, guard } = queued;
            let result = task_pipeline.process(&job);
            if result.is_ok() {
                if let Err(persist_error) = task_pipeline.store().persist() {
                    error!(document_id = %job.document_id, error = %persist_error, "ingested document was not persisted");
                }
            }
            drop(guard);
            result
        })
        .await;

        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(failure)) => {
                debug!(worker, document_id = %document_id, error = %failure, "ingestion job failed");
            }
            Err(join_error) => {
                error!(worker, document_id = %document_id, error = %join_error, "ingestion job aborted");
            }
        }
    }
    debug!(worker, "ingestion worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::ExtractionError;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    const DIMS: usize = 64;

    struct FakeExtractor;

    impl TextExtractor for FakeExtractor {
        fn extract_text(&self, bytes: &[u8], kind: DocumentKind) -> Result<String, ExtractionError> {
            match kind {
                DocumentKind::Text => Ok(String::from_utf8_lossy(bytes).into_owned()),
                DocumentKind::Pdf => Err(ExtractionError::new(kind, "unreadable pdf")),
            }
        }
    }

    struct PanickingEmbedder;

    impl Embedder for PanickingEmbedder {
        fn dimensions(&self) -> usize {
            DIMS
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>, RagError> {
            panic!("embedding backend crashed");
        }
    }

    fn pipeline_with<E: Embedder>(embedder: E) -> Arc<IngestPipeline<E>> {
        let chunker = Chunker::new(ChunkingConfig {
            target_tokens: 8,
            overlap_tokens: 2,
        })
        .unwrap();
        Arc::new(IngestPipeline::new(
            chunker,
            Arc::new(embedder),
            Arc::new(CorpusStore::in_memory(DIMS)),
            Arc::new(FakeExtractor),
        ))
    }

    fn pipeline() -> Arc<IngestPipeline<CharacterNgramEmbedder>> {
        pipeline_with(CharacterNgramEmbedder::new(DIMS))
    }

    fn job(document_id: &str, filename: &str, kind: DocumentKind, bytes: &[u8]) -> IngestJob {
        IngestJob {
            document_id: document_id.to_string(),
            filename: filename.to_string(),
            kind,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn discover_documents_is_recursive_and_filtered() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("b.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("a.TXT")).and_then(|mut file| file.write_all(b"notes"))?;
        File::create(base.join("image.png")).and_then(|mut file| file.write_all(b"png"))?;

        let files = discover_documents(base);
        assert_eq!(files.len(), 2);
        assert!(files.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(files.iter().all(|path| path.extension().is_some_and(|ext| ext != "png")));
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() {
        assert_eq!(digest_text("abc"), digest_text("abc"));
        assert_ne!(digest_text("abc"), digest_text("abd"));
        assert_eq!(digest_text("abc").len(), 64);
    }

    #[test]
    fn ingest_registers_unknown_ids_and_completes() {
        let pipeline = pipeline();
        let text = "one two three four five six seven eight nine ten eleven twelve";

        let document = pipeline.ingest("doc-1", text).unwrap();

        assert_eq!(document.status, DocumentStatus::Completed);
        assert_eq!(document.chunk_count, Some(2));
        assert_eq!(document.checksum.as_deref(), Some(digest_text(text).as_str()));
        assert!(document.processed_at.is_some());
        assert_eq!(pipeline.store().stats().live_chunks, 2);
    }

    #[test]
    fn completed_documents_are_not_ingested_twice() {
        let pipeline = pipeline();
        pipeline.ingest("doc-1", "some text").unwrap();
        assert!(matches!(
            pipeline.ingest("doc-1", "other text"),
            Err(RagError::InvalidInput(_))
        ));
        assert_eq!(pipeline.store().stats().live_chunks, 1);
    }

    #[test]
    fn blank_text_fails_the_document() {
        let pipeline = pipeline();
        assert!(pipeline.ingest("empty", "  \n\n ").is_err());

        let document = pipeline.store().get_document("empty").unwrap();
        assert_eq!(document.status, DocumentStatus::Failed);
        assert!(document.error.is_some());
        assert!(!pipeline.store().has_chunks());
    }

    #[test]
    fn extraction_failure_is_recorded_without_chunks() {
        let pipeline = pipeline();
        pipeline
            .store()
            .register_document(Document::pending("pdf-1", "broken.pdf"))
            .unwrap();

        let result = pipeline.process(&job("pdf-1", "broken.pdf", DocumentKind::Pdf, b"%PDF"));
        assert!(matches!(result, Err(RagError::Extraction(_))));

        let document = pipeline.store().get_document("pdf-1").unwrap();
        assert_eq!(document.status, DocumentStatus::Failed);
        assert!(document.error.unwrap().contains("unreadable pdf"));
        assert_eq!(document.chunk_count, None);
        assert!(!pipeline.store().has_chunks());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queue_drains_all_jobs_on_shutdown() {
        let pipeline = pipeline();
        let queue = IngestQueue::start(Arc::clone(&pipeline), 2).unwrap();

        for index in 0..6 {
            let id = format!("doc-{index}");
            let filename = format!("{id}.txt");
            pipeline
                .store()
                .register_document(Document::pending(id.as_str(), filename.as_str()))
                .unwrap();
            let text = format!("document number {index} talks about topic {index}");
            queue
                .submit(job(&id, &filename, DocumentKind::Text, text.as_bytes()))
                .unwrap();
        }
        queue.shutdown().await;

        let documents = pipeline.store().list_documents();
        assert_eq!(documents.len(), 6);
        assert!(documents
            .iter()
            .all(|document| document.status == DocumentStatus::Completed));
        assert_eq!(pipeline.store().snapshot().index.documents().count(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_job_leaves_document_failed() {
        let pipeline = pipeline_with(PanickingEmbedder);
        pipeline
            .store()
            .register_document(Document::pending("doc", "doc.txt"))
            .unwrap();

        let queue = IngestQueue::start(Arc::clone(&pipeline), 1).unwrap();
        queue
            .submit(job("doc", "doc.txt", DocumentKind::Text, b"some words here"))
            .unwrap();
        queue.shutdown().await;

        let document = pipeline.store().get_document("doc").unwrap();
        assert_eq!(document.status, DocumentStatus::Failed);
        assert_eq!(document.error.as_deref(), Some("ingestion was cancelled"));
    }

    #[test]
    fn dropped_jobs_are_marked_failed() {
        let pipeline = pipeline();
        pipeline
            .store()
            .register_document(Document::pending("queued", "queued.txt"))
            .unwrap();

        drop(QueuedJob {
            job: job("queued", "queued.txt", DocumentKind::Text, b"text"),
            guard: FailOnDrop {
                store: Arc::clone(pipeline.store()),
                document_id: "queued".to_string(),
            },
        });

        let document = pipeline.store().get_document("queued").unwrap();
        assert_eq!(document.status, DocumentStatus::Failed);
    }

    #[test]
    fn queue_needs_a_runtime() {
        assert!(matches!(
            IngestQueue::start(pipeline(), 1),
            Err(RagError::InvalidInput(_))
        ));
    }
}
