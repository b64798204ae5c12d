//! Chunk metadata keyed by index slot, and the document status table.

use crate::error::RagError;
use crate::models::{Chunk, Document, DocumentStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CHUNKS_FORMAT_VERSION: u32 = 1;

/// Dense slot -> chunk table. Slot numbers match [`crate::index::FlatIndex`] rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkTable {
    slots: Vec<Chunk>,
}

impl ChunkTable {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stores `chunk` at `slot`. Slots are filled in order and never overwritten.
    pub fn put(&mut self, chunk: Chunk, slot: usize) -> Result<(), RagError> {
        match slot.cmp(&self.slots.len()) {
            std::cmp::Ordering::Equal => {
                self.slots.push(chunk);
                Ok(())
            }
            std::cmp::Ordering::Less => Err(RagError::InvalidInput(format!(
                "slot {slot} already holds a chunk"
            ))),
            std::cmp::Ordering::Greater => Err(RagError::InvalidInput(format!(
                "slot {slot} would leave a gap after slot {}",
                self.slots.len()
            ))),
        }
    }

    pub fn get(&self, slot: usize) -> Option<&Chunk> {
        self.slots.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Chunk)> {
        self.slots.iter().enumerate()
    }

    pub fn chunks_for<'a>(&'a self, document_id: &'a str) -> impl Iterator<Item = (usize, &'a Chunk)> {
        self.iter()
            .filter(move |(_, chunk)| chunk.document_id == document_id)
    }

    /// Compacted copy without `document_id`; remaining slots are renumbered
    /// in their original order.
    pub fn delete_by_document(&self, document_id: &str) -> ChunkTable {
        ChunkTable {
            slots: self
                .slots
                .iter()
                .filter(|chunk| chunk.document_id != document_id)
                .cloned()
                .collect(),
        }
    }

    pub fn to_persisted(&self, generation: u64) -> PersistedChunks {
        PersistedChunks {
            version: CHUNKS_FORMAT_VERSION,
            generation,
            chunks: self.slots.iter().cloned().enumerate().collect(),
        }
    }

    pub fn from_persisted(persisted: PersistedChunks) -> Result<(ChunkTable, u64), RagError> {
        if persisted.version != CHUNKS_FORMAT_VERSION {
            return Err(RagError::CorruptState(format!(
                "unsupported chunk table version {}",
                persisted.version
            )));
        }

        let mut table = ChunkTable::default();
        for (slot, chunk) in persisted.chunks {
            table.put(chunk, slot).map_err(|_| {
                RagError::CorruptState(format!("chunk table slots are not contiguous at {slot}"))
            })?;
        }
        Ok((table, persisted.generation))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedChunks {
    pub version: u32,
    pub generation: u64,
    pub chunks: BTreeMap<usize, Chunk>,
}

/// Per-document processing status, keyed by document id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentTable {
    documents: BTreeMap<String, Document>,
}

impl DocumentTable {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn insert(&mut self, document: Document) -> Result<(), RagError> {
        if self.documents.contains_key(&document.id) {
            return Err(RagError::InvalidInput(format!(
                "document {} already exists",
                document.id
            )));
        }
        self.documents.insert(document.id.clone(), document);
        Ok(())
    }

    pub fn get(&self, document_id: &str) -> Option<&Document> {
        self.documents.get(document_id)
    }

    pub fn contains(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }

    /// Applies a monotonic status transition. `chunk_count` is required for,
    /// and only accepted with, `Completed`.
    pub fn set_status(
        &mut self,
        document_id: &str,
        status: DocumentStatus,
        chunk_count: Option<usize>,
    ) -> Result<&Document, RagError> {
        let document = self
            .documents
            .get_mut(document_id)
            .ok_or_else(|| RagError::NotFound(format!("document {document_id}")))?;

        if !document.status.can_transition_to(status) {
            return Err(RagError::InvalidInput(format!(
                "document {document_id} cannot move from {} to {status}",
                document.status
            )));
        }

        match (status, chunk_count) {
            (DocumentStatus::Completed, None) => {
                return Err(RagError::InvalidInput(
                    "completed documents need a chunk count".to_string(),
                ))
            }
            (DocumentStatus::Completed, Some(_)) => {}
            (_, Some(_)) => {
                return Err(RagError::InvalidInput(format!(
                    "chunk count can only be set on completion, not {status}"
                )))
            }
            (_, None) => {}
        }

        document.status = status;
        if status == DocumentStatus::Completed {
            document.chunk_count = chunk_count;
        }
        if status.is_terminal() {
            document.processed_at = Some(Utc::now());
        }
        Ok(document)
    }

    pub fn fail(&mut self, document_id: &str, reason: impl Into<String>) -> Result<&Document, RagError> {
        self.set_status(document_id, DocumentStatus::Failed, None)?;
        let document = self
            .documents
            .get_mut(document_id)
            .ok_or_else(|| RagError::NotFound(format!("document {document_id}")))?;
        document.error = Some(reason.into());
        Ok(document)
    }

    pub fn set_checksum(&mut self, document_id: &str, checksum: String) -> Result<(), RagError> {
        let document = self
            .documents
            .get_mut(document_id)
            .ok_or_else(|| RagError::NotFound(format!("document {document_id}")))?;
        document.checksum = Some(checksum);
        Ok(())
    }

    pub fn remove(&mut self, document_id: &str) -> Option<Document> {
        self.documents.remove(document_id)
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<Document> {
        let mut documents: Vec<Document> = self.documents.values().cloned().collect();
        documents.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        documents
    }

    /// Fails every document left pending or processing by a previous process.
    pub fn fail_interrupted(&mut self) -> Vec<String> {
        let interrupted: Vec<String> = self
            .documents
            .values()
            .filter(|document| !document.status.is_terminal())
            .map(|document| document.id.clone())
            .collect();

        for document_id in &interrupted {
            let _ = self.fail(document_id, "interrupted before ingestion finished");
        }
        interrupted
    }
}
