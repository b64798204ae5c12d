//! Shared corpus state: vector index, chunk metadata and document table.
//!
//! The index and the chunk table always travel together inside an immutable
//! [`Generation`]. Writers build a new generation off to the side and swap the
//! handle in; readers clone the handle and never see a half-built index.
//! Writers (add, remove, persist) are serialized by a single mutex.

use crate::error::RagError;
use crate::index::{FlatIndex, PersistedIndex};
use crate::metadata::{ChunkTable, DocumentTable, PersistedChunks};
use crate::models::{Chunk, Document, DocumentStatus, RetrievedChunk, StoreStats};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{error, info, warn};

pub const INDEX_FILE: &str = "index.json";
pub const CHUNKS_FILE: &str = "chunks.json";
pub const DOCUMENTS_FILE: &str = "documents.json";
pub const METRICS_FILE: &str = "metrics.jsonl";
/// Present while a fully staged set of files is being renamed into place.
pub const PENDING_FILE: &str = "persist.pending";

const PERSISTED_FILES: [&str; 3] = [INDEX_FILE, CHUNKS_FILE, DOCUMENTS_FILE];

#[derive(Debug, Clone)]
pub struct Generation {
    pub id: u64,
    pub index: FlatIndex,
    pub chunks: ChunkTable,
}

impl Generation {
    fn empty(dimensions: usize) -> Self {
        Self {
            id: 0,
            index: FlatIndex::new(dimensions),
            chunks: ChunkTable::default(),
        }
    }

    fn with_document(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
        vectors: &[Vec<f32>],
    ) -> Result<(Generation, Range<usize>), RagError> {
        if chunks.len() != vectors.len() {
            return Err(RagError::InvalidInput(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        if let Some(stray) = chunks.iter().find(|chunk| chunk.document_id != document_id) {
            return Err(RagError::InvalidInput(format!(
                "chunk {} belongs to {}, not {document_id}",
                stray.chunk_index, stray.document_id
            )));
        }

        let mut next = self.clone();
        let slots = next.index.add(document_id, vectors)?;
        for (slot, chunk) in slots.clone().zip(chunks) {
            next.chunks.put(chunk, slot)?;
        }
        next.id = self.id + 1;
        Ok((next, slots))
    }

    /// The one rebuild routine: index and chunk table drop the document's
    /// rows together and keep the survivors in slot order, so renumbering is
    /// identical on both sides. The result is checked before it is published.
    fn without_document(&self, document_id: &str) -> Result<Generation, RagError> {
        let index = self.index.without_document(document_id);
        let chunks = self.chunks.delete_by_document(document_id);
        let next = Generation {
            id: self.id + 1,
            index,
            chunks,
        };
        next.check_consistency()?;
        Ok(next)
    }

    pub fn check_consistency(&self) -> Result<(), RagError> {
        if self.index.len() != self.chunks.len() {
            return Err(RagError::CorruptState(format!(
                "index has {} vectors but metadata has {} chunks",
                self.index.len(),
                self.chunks.len()
            )));
        }
        for (slot, chunk) in self.chunks.iter() {
            if self.index.owner(slot) != Some(chunk.document_id.as_str()) {
                return Err(RagError::CorruptState(format!(
                    "slot {slot} metadata belongs to {} but vector does not",
                    chunk.document_id
                )));
            }
        }
        Ok(())
    }
}

/// What readers observe: the live generation and documents being removed.
#[derive(Debug, Clone)]
struct Published {
    generation: Arc<Generation>,
    removing: Arc<HashSet<String>>,
}

pub struct CorpusStore {
    data_dir: Option<PathBuf>,
    published: RwLock<Published>,
    documents: RwLock<DocumentTable>,
    writer: Mutex<()>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CorpusStore {
    pub fn in_memory(dimensions: usize) -> Self {
        Self::from_parts(None, Generation::empty(dimensions), DocumentTable::default())
    }

    fn from_parts(
        data_dir: Option<PathBuf>,
        generation: Generation,
        documents: DocumentTable,
    ) -> Self {
        Self {
            data_dir,
            published: RwLock::new(Published {
                generation: Arc::new(generation),
                removing: Arc::new(HashSet::new()),
            }),
            documents: RwLock::new(documents),
            writer: Mutex::new(()),
        }
    }

    /// Loads persisted state from `dir` (missing files mean an empty corpus).
    /// Documents that were still pending or processing are marked failed.
    pub fn open(dir: impl Into<PathBuf>, dimensions: usize) -> Result<Self, RagError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        if dir.join(PENDING_FILE).exists() {
            warn!(dir = %dir.display(), "finishing an interrupted persist");
            commit_staged(&dir)?;
        }

        let mut documents: DocumentTable =
            read_json(&dir.join(DOCUMENTS_FILE))?.unwrap_or_default();
        let index: Option<PersistedIndex> = read_json(&dir.join(INDEX_FILE))?;
        let chunks: Option<PersistedChunks> = read_json(&dir.join(CHUNKS_FILE))?;

        let generation = match (index, chunks) {
            (None, None) => Generation::empty(dimensions),
            (Some(index), Some(chunks)) => {
                let (index, index_generation) = FlatIndex::from_persisted(index)?;
                let (chunks, chunk_generation) = ChunkTable::from_persisted(chunks)?;
                if index_generation != chunk_generation {
                    return Err(RagError::CorruptState(format!(
                        "index generation {index_generation} does not match chunk generation {chunk_generation}"
                    )));
                }
                if index.dimensions() != dimensions {
                    error!(
                        persisted = index.dimensions(),
                        configured = dimensions,
                        "persisted index dimension differs from embedder"
                    );
                    return Err(RagError::DimensionMismatch {
                        expected: dimensions,
                        actual: index.dimensions(),
                    });
                }
                Generation {
                    id: index_generation,
                    index,
                    chunks,
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(RagError::CorruptState(format!(
                    "{INDEX_FILE} and {CHUNKS_FILE} must be present together"
                )))
            }
        };

        generation.check_consistency()?;
        if let Some(orphan) = generation
            .index
            .documents()
            .find(|document_id| !documents.contains(document_id))
        {
            return Err(RagError::CorruptState(format!(
                "chunks reference unknown document {orphan}"
            )));
        }

        let interrupted = documents.fail_interrupted();
        for document_id in &interrupted {
            warn!(document_id = %document_id, "document was interrupted during ingestion");
        }

        info!(
            dir = %dir.display(),
            generation = generation.id,
            chunks = generation.index.len(),
            documents = documents.len(),
            "corpus store loaded"
        );

        let store = Self::from_parts(Some(dir), generation, documents);
        if !interrupted.is_empty() {
            store.persist()?;
        }
        Ok(store)
    }

    pub fn snapshot(&self) -> Arc<Generation> {
        Arc::clone(&read(&self.published).generation)
    }

    fn published(&self) -> Published {
        read(&self.published).clone()
    }

    pub fn stats(&self) -> StoreStats {
        let generation = self.snapshot();
        StoreStats {
            documents: read(&self.documents).len(),
            live_chunks: generation.index.len(),
            generation: generation.id,
        }
    }

    pub fn has_chunks(&self) -> bool {
        !self.snapshot().index.is_empty()
    }

    pub fn register_document(&self, document: Document) -> Result<(), RagError> {
        write(&self.documents).insert(document)
    }

    pub fn get_document(&self, document_id: &str) -> Option<Document> {
        read(&self.documents).get(document_id).cloned()
    }

    pub fn list_documents(&self) -> Vec<Document> {
        read(&self.documents).list()
    }

    pub fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        chunk_count: Option<usize>,
    ) -> Result<Document, RagError> {
        write(&self.documents)
            .set_status(document_id, status, chunk_count)
            .cloned()
    }

    pub fn set_document_checksum(&self, document_id: &str, checksum: String) -> Result<(), RagError> {
        write(&self.documents).set_checksum(document_id, checksum)
    }

    pub fn fail_document(&self, document_id: &str, reason: &str) -> Result<Document, RagError> {
        write(&self.documents).fail(document_id, reason).cloned()
    }

    /// Appends one document's chunks and vectors; either all land or none.
    /// Callers hold the writer lock.
    fn add_locked(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
        vectors: &[Vec<f32>],
    ) -> Result<Range<usize>, RagError> {
        if !read(&self.documents).contains(document_id) {
            return Err(RagError::NotFound(format!("document {document_id}")));
        }

        let current = self.published();
        if current.generation.index.document_slots(document_id).is_some() {
            return Err(RagError::InvalidInput(format!(
                "document {document_id} is already indexed"
            )));
        }

        let (next, slots) = match current.generation.with_document(document_id, chunks, vectors) {
            Ok(built) => built,
            Err(RagError::DimensionMismatch { expected, actual }) => {
                error!(document_id, expected, actual, "embedding dimension does not match index");
                return Err(RagError::DimensionMismatch { expected, actual });
            }
            Err(other) => return Err(other),
        };

        write(&self.published).generation = Arc::new(next);
        Ok(slots)
    }

    /// Adds the chunks and marks the document completed under one writer lock.
    pub fn commit_document(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
        vectors: &[Vec<f32>],
    ) -> Result<Document, RagError> {
        let _writer = lock(&self.writer);
        let mut documents = write(&self.documents);
        let status = documents
            .get(document_id)
            .map(|document| document.status)
            .ok_or_else(|| RagError::NotFound(format!("document {document_id}")))?;
        if status != DocumentStatus::Processing {
            return Err(RagError::InvalidInput(format!(
                "document {document_id} is {status}, expected processing"
            )));
        }
        drop(documents);

        let count = chunks.len();
        self.add_locked(document_id, chunks, vectors)?;

        documents = write(&self.documents);
        documents
            .set_status(document_id, DocumentStatus::Completed, Some(count))
            .cloned()
    }

    /// Ranked hits joined with chunk metadata. With `document_filter`, only
    /// that document's slots are scanned.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<RetrievedChunk>, RagError> {
        let Published {
            generation,
            removing,
        } = self.published();

        let hits = match document_filter {
            Some(document_id) if removing.contains(document_id) => Vec::new(),
            Some(document_id) => generation.index.search_document(query, top_k, document_id)?,
            None if removing.is_empty() => generation.index.search(query, top_k)?,
            None => generation
                .index
                .search_where(query, top_k, |_, owner| !removing.contains(owner))?,
        };

        hits.into_iter()
            .map(|hit| {
                let chunk = generation.chunks.get(hit.slot).cloned().ok_or_else(|| {
                    RagError::CorruptState(format!("slot {} has no chunk metadata", hit.slot))
                })?;
                Ok(RetrievedChunk {
                    slot: hit.slot,
                    similarity: hit.score,
                    chunk,
                })
            })
            .collect()
    }

    /// Removes a document with all its chunks. Returns `false` when the id is unknown.
    pub fn remove(&self, document_id: &str) -> Result<bool, RagError> {
        let _writer = lock(&self.writer);

        let known_document = read(&self.documents).contains(document_id);
        let current = self.published();
        let indexed = current.generation.index.document_slots(document_id).is_some();
        if !known_document && !indexed {
            return Ok(false);
        }

        let mut removing = (*current.removing).clone();
        removing.insert(document_id.to_string());
        write(&self.published).removing = Arc::new(removing);

        let rebuilt = current.generation.without_document(document_id);
        let mut published = write(&self.published);
        let mut removing = (*published.removing).clone();
        removing.remove(document_id);
        published.removing = Arc::new(removing);
        let rebuilt = rebuilt?;
        let remaining = rebuilt.index.len();
        let generation = rebuilt.id;
        published.generation = Arc::new(rebuilt);
        drop(published);

        write(&self.documents).remove(document_id);
        info!(document_id, generation, remaining, "document removed and index rebuilt");
        Ok(true)
    }

    /// Writes index, chunk metadata and document table. A no-op without a data dir.
    ///
    /// All three files are staged and synced before any of them replaces the
    /// live copy, so a crash mid-swap is finished by the next [`open`](Self::open).
    pub fn persist(&self) -> Result<(), RagError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let _writer = lock(&self.writer);

        let result = self.stage(dir).and_then(|_| commit_staged(dir));
        if let Err(error) = &result {
            error!(dir = %dir.display(), %error, "failed to persist corpus store");
        }
        result
    }

    fn stage(&self, dir: &Path) -> Result<(), RagError> {
        let generation = self.snapshot();
        let documents = read(&self.documents).clone();

        write_json_synced(
            &staged(&dir.join(INDEX_FILE)),
            &generation.index.to_persisted(generation.id),
        )?;
        write_json_synced(
            &staged(&dir.join(CHUNKS_FILE)),
            &generation.chunks.to_persisted(generation.id),
        )?;
        write_json_synced(&staged(&dir.join(DOCUMENTS_FILE)), &documents)?;
        File::create(dir.join(PENDING_FILE))?.sync_all()?;
        Ok(())
    }
}

fn staged(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

/// Renames every staged file still waiting, then clears the marker.
fn commit_staged(dir: &Path) -> Result<(), RagError> {
    for name in PERSISTED_FILES {
        let target = dir.join(name);
        let source = staged(&target);
        if source.exists() {
            fs::rename(&source, &target)?;
        }
    }
    fs::remove_file(dir.join(PENDING_FILE))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RagError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    Ok(Some(serde_json::from_reader(BufReader::new(file))?))
}

fn write_json_synced<T: Serialize>(path: &Path, value: &T) -> Result<(), RagError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}
