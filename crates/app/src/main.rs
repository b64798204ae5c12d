use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use docqa_core::config::{DEFAULT_OVERLAP_TOKENS, DEFAULT_TARGET_TOKENS};
use docqa_core::{
    discover_documents, AnswerGenerator, CharacterNgramEmbedder, ChunkingConfig, Document,
    DocumentStatus, EngineConfig, ExtractiveAnswerGenerator, HttpAnswerGenerator, QaEngine,
    QueryResponse, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_TOP_K,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "docqa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the vector index, chunk metadata, documents and metrics log
    #[arg(long, env = "DOCQA_DATA_DIR", default_value = "docqa-data")]
    data_dir: PathBuf,

    /// Fresh tokens per chunk
    #[arg(long, env = "DOCQA_TARGET_TOKENS", default_value_t = DEFAULT_TARGET_TOKENS)]
    target_tokens: usize,

    /// Tokens carried over from the previous chunk
    #[arg(long, env = "DOCQA_OVERLAP_TOKENS", default_value_t = DEFAULT_OVERLAP_TOKENS)]
    overlap_tokens: usize,

    /// Embedding dimension; must match any existing index in the data dir
    #[arg(long, env = "DOCQA_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    dimensions: usize,

    /// Background ingestion workers
    #[arg(long, env = "DOCQA_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Answer generation endpoint; without it answers are extractive
    #[arg(long, env = "DOCQA_LLM_ENDPOINT")]
    llm_endpoint: Option<String>,

    /// Bearer token for the answer endpoint
    #[arg(long, env = "DOCQA_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest .pdf and .txt files and wait until each one is indexed.
    Ingest {
        /// Folder scanned recursively for documents.
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Individual files; may be repeated.
        #[arg(long)]
        file: Vec<PathBuf>,
    },
    /// Retrieve the most similar chunks with a confidence score.
    Query {
        question: String,
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
        /// Restrict retrieval to one document id.
        #[arg(long)]
        document: Option<String>,
    },
    /// Retrieve context and generate an answer.
    Ask {
        question: String,
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
        /// Restrict retrieval to one document id.
        #[arg(long)]
        document: Option<String>,
    },
    /// List documents, oldest first.
    Documents,
    /// Show one document's processing status.
    Status { document_id: String },
    /// Delete a document and rebuild the index without its chunks.
    Delete { document_id: String },
    /// Print aggregate query metrics.
    Metrics,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            chunking: ChunkingConfig {
                target_tokens: self.target_tokens,
                overlap_tokens: self.overlap_tokens,
            },
            embedding_dimensions: self.dimensions,
            ingest_workers: self.workers,
            data_dir: Some(self.data_dir.clone()),
            ..EngineConfig::default()
        }
    }

    fn answer_generator(&self) -> anyhow::Result<Arc<dyn AnswerGenerator>> {
        match &self.llm_endpoint {
            Some(endpoint) => {
                let generator = HttpAnswerGenerator::new(endpoint, self.llm_api_key.clone())
                    .with_context(|| format!("invalid answer endpoint {endpoint}"))?;
                Ok(Arc::new(generator))
            }
            None => Ok(Arc::new(ExtractiveAnswerGenerator)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let engine = QaEngine::open(
        cli.engine_config(),
        CharacterNgramEmbedder::new(cli.dimensions),
        cli.answer_generator()?,
    )
    .with_context(|| format!("failed to open data dir {}", cli.data_dir.display()))?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        data_dir = %cli.data_dir.display(),
        "docqa boot"
    );

    match cli.command {
        Command::Ingest { folder, file } => {
            let mut paths = file;
            if let Some(folder) = &folder {
                let found = discover_documents(folder);
                if found.is_empty() {
                    warn!(folder = %folder.display(), "no .pdf or .txt files found");
                }
                paths.extend(found);
            }
            if paths.is_empty() {
                anyhow::bail!("nothing to ingest: pass --folder or --file");
            }

            let mut submitted = Vec::with_capacity(paths.len());
            for path in &paths {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let filename = path.to_string_lossy();
                match engine.submit_document(&filename, bytes) {
                    Ok(document) => submitted.push(document.id),
                    Err(error) => warn!(path = %path.display(), %error, "skipped file"),
                }
            }

            info!(count = submitted.len(), "waiting for ingestion");
            loop {
                let finished = submitted.iter().all(|document_id| {
                    engine
                        .document(document_id)
                        .map_or(true, |document| document.status.is_terminal())
                });
                if finished {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }

            let mut failed = 0;
            for document_id in &submitted {
                if let Some(document) = engine.document(document_id) {
                    if document.status == DocumentStatus::Failed {
                        failed += 1;
                    }
                    print_document(&document);
                }
            }
            let stats = engine.stats();
            println!(
                "{} document(s) ingested, {} failed, {} chunks indexed at {}",
                submitted.len() - failed,
                failed,
                stats.live_chunks,
                Utc::now().to_rfc3339()
            );
        }
        Command::Query {
            question,
            top_k,
            document,
        } => {
            let response = engine.query(&question, top_k, document.as_deref())?;
            print_retrieval(&response);
        }
        Command::Ask {
            question,
            top_k,
            document,
        } => {
            let response = engine.ask(&question, top_k, document.as_deref()).await?;
            println!("{}\n", response.answer);
            print_retrieval(&response.retrieval);
            println!(
                "latency: total={:.1}ms llm={:.1}ms",
                response.total_latency_ms, response.llm_latency_ms
            );
        }
        Command::Documents => {
            let documents = engine.documents();
            if documents.is_empty() {
                println!("no documents");
            }
            for document in &documents {
                print_document(document);
            }
        }
        Command::Status { document_id } => {
            let document = engine
                .document(&document_id)
                .with_context(|| format!("unknown document {document_id}"))?;
            print_document(&document);
            if let Some(checksum) = &document.checksum {
                println!("  sha256={checksum}");
            }
            if let Some(processed_at) = document.processed_at {
                println!("  processed_at={}", processed_at.to_rfc3339());
            }
        }
        Command::Delete { document_id } => {
            engine.delete_document(&document_id)?;
            let stats = engine.stats();
            println!(
                "deleted {document_id}; {} chunks remain (generation {})",
                stats.live_chunks, stats.generation
            );
        }
        Command::Metrics => {
            let summary = engine.metrics_snapshot();
            println!("queries: {}", summary.count);
            println!(
                "latency ms: mean={:.1} min={:.1} max={:.1} p50={:.1} p95={:.1} p99={:.1}",
                summary.latency.mean_ms,
                summary.latency.min_ms,
                summary.latency.max_ms,
                summary.latency.p50_ms,
                summary.latency.p95_ms,
                summary.latency.p99_ms
            );
            println!(
                "retrieval mean={:.1}ms llm mean={:.1}ms",
                summary.mean_retrieval_latency_ms, summary.mean_llm_latency_ms
            );
            println!(
                "similarity: mean={:.3} min={:.3} max={:.3}",
                summary.similarity.mean, summary.similarity.min, summary.similarity.max
            );
            println!(
                "confidence: mean={:.3} min={:.3} max={:.3}",
                summary.confidence.mean, summary.confidence.min, summary.confidence.max
            );
            println!(
                "quality: high_confidence={:.1}% low_similarity={:.1}% slow={:.1}%",
                summary.quality.high_confidence * 100.0,
                summary.quality.low_similarity * 100.0,
                summary.quality.slow_queries * 100.0
            );
            for record in &summary.recent {
                println!(
                    "  {} total={:.1}ms results={} confidence={:.3}",
                    record.timestamp.to_rfc3339(),
                    record.total_latency_ms,
                    record.num_results,
                    record.confidence_score
                );
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}

fn print_document(document: &Document) {
    let chunks = document
        .chunk_count
        .map_or_else(|| "-".to_string(), |count| count.to_string());
    println!(
        "{} {} status={} chunks={} created_at={}",
        document.id,
        document.filename,
        document.status,
        chunks,
        document.created_at.to_rfc3339()
    );
    if let Some(error) = &document.error {
        println!("  error={error}");
    }
}

fn print_retrieval(response: &QueryResponse) {
    println!(
        "query: {} confidence={:.3} avg_similarity={:.3}",
        response.question, response.confidence, response.avg_similarity
    );
    for hit in &response.results {
        println!(
            "[{}] similarity={:.4} document_id={} chunk={} file={}",
            hit.slot, hit.similarity, hit.chunk.document_id, hit.chunk.chunk_index, hit.chunk.filename
        );
        println!("  {}", hit.chunk.text);
    }
    if !response.results.is_empty() {
        println!("documents: {}", response.document_ids().join(", "));
    }
    println!(
        "timings: embed={:.2}ms search={:.2}ms",
        response.timings.embed_ms, response.timings.search_ms
    );
}
