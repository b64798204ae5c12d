//! Flat inner-product vector index.
//!
//! Vectors live in one row-major buffer; a slot is a row number. The index is
//! append-only: removing a document produces a new, compacted index in which
//! surviving rows keep their relative order and are renumbered from zero.
//! Callers are expected to pass L2-normalized vectors so that the inner
//! product equals cosine similarity.

use crate::error::RagError;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Range;

pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Set of slots, one bit per slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotBitmap {
    words: Vec<u64>,
}

impl SlotBitmap {
    pub fn insert(&mut self, slot: usize) {
        let word = slot / 64;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (slot % 64);
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.words
            .get(slot / 64)
            .is_some_and(|word| *word & (1u64 << (slot % 64)) != 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(index, word)| {
            let mut remaining = *word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(index * 64 + bit)
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub slot: usize,
    pub score: f32,
}

/// Best first: higher score, then the earlier slot.
fn rank_order(left: &IndexHit, right: &IndexHit) -> Ordering {
    right
        .score
        .total_cmp(&left.score)
        .then_with(|| left.slot.cmp(&right.slot))
}

fn take_best(mut scored: Vec<IndexHit>, top_k: usize) -> Vec<IndexHit> {
    if top_k == 0 {
        return Vec::new();
    }
    if scored.len() > top_k {
        scored.select_nth_unstable_by(top_k - 1, rank_order);
        scored.truncate(top_k);
    }
    scored.sort_by(rank_order);
    scored
}

fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimensions: usize,
    vectors: Vec<f32>,
    owners: Vec<String>,
    membership: BTreeMap<String, SlotBitmap>,
}

impl FlatIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: Vec::new(),
            owners: Vec::new(),
            membership: BTreeMap::new(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn vector(&self, slot: usize) -> Option<&[f32]> {
        if slot >= self.len() {
            return None;
        }
        let start = slot * self.dimensions;
        Some(&self.vectors[start..start + self.dimensions])
    }

    pub fn owner(&self, slot: usize) -> Option<&str> {
        self.owners.get(slot).map(String::as_str)
    }

    pub fn document_slots(&self, document_id: &str) -> Option<&SlotBitmap> {
        self.membership.get(document_id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.membership.keys().map(String::as_str)
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), RagError> {
        if vector.len() != self.dimensions {
            return Err(RagError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(RagError::InvalidInput(
                "vector contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    /// Appends all vectors for `document_id`, or none of them.
    pub fn add(&mut self, document_id: &str, vectors: &[Vec<f32>]) -> Result<Range<usize>, RagError> {
        for vector in vectors {
            self.check_vector(vector)?;
        }

        let first = self.len();
        let bitmap = self.membership.entry(document_id.to_string()).or_default();
        for (offset, vector) in vectors.iter().enumerate() {
            self.vectors.extend_from_slice(vector);
            self.owners.push(document_id.to_string());
            bitmap.insert(first + offset);
        }
        if bitmap.is_empty() {
            self.membership.remove(document_id);
        }

        Ok(first..self.len())
    }

    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<IndexHit>, RagError> {
        self.search_where(query, top_k, |_, _| true)
    }

    /// Scans only the slots owned by `document_id`.
    pub fn search_document(
        &self,
        query: &[f32],
        top_k: usize,
        document_id: &str,
    ) -> Result<Vec<IndexHit>, RagError> {
        self.check_vector(query)?;
        let Some(slots) = self.membership.get(document_id) else {
            return Ok(Vec::new());
        };

        let scored = slots
            .iter()
            .filter_map(|slot| {
                self.vector(slot).map(|vector| IndexHit {
                    slot,
                    score: dot(vector, query),
                })
            })
            .collect();
        Ok(take_best(scored, top_k))
    }

    pub fn search_where<F>(&self, query: &[f32], top_k: usize, keep: F) -> Result<Vec<IndexHit>, RagError>
    where
        F: Fn(usize, &str) -> bool,
    {
        self.check_vector(query)?;

        let scored = self
            .vectors
            .chunks_exact(self.dimensions.max(1))
            .zip(&self.owners)
            .enumerate()
            .filter(|(slot, (_, owner))| keep(*slot, owner))
            .map(|(slot, (vector, _))| IndexHit {
                slot,
                score: dot(vector, query),
            })
            .collect();
        Ok(take_best(scored, top_k))
    }

    /// Compacted copy without `document_id`; remaining rows keep their order.
    pub fn without_document(&self, document_id: &str) -> FlatIndex {
        let mut rebuilt = FlatIndex::new(self.dimensions);

        for (slot, owner) in self.owners.iter().enumerate() {
            if owner == document_id {
                continue;
            }
            let new_slot = rebuilt.len();
            let start = slot * self.dimensions;
            rebuilt
                .vectors
                .extend_from_slice(&self.vectors[start..start + self.dimensions]);
            rebuilt.owners.push(owner.clone());
            rebuilt
                .membership
                .entry(owner.clone())
                .or_default()
                .insert(new_slot);
        }

        rebuilt
    }

    pub fn to_persisted(&self, generation: u64) -> PersistedIndex {
        PersistedIndex {
            version: INDEX_FORMAT_VERSION,
            dimensions: self.dimensions,
            generation,
            owners: self.owners.clone(),
            vectors: self
                .vectors
                .chunks_exact(self.dimensions.max(1))
                .map(encode_vector)
                .collect(),
            membership: self.membership.clone(),
        }
    }

    pub fn from_persisted(persisted: PersistedIndex) -> Result<(FlatIndex, u64), RagError> {
        if persisted.version != INDEX_FORMAT_VERSION {
            return Err(RagError::CorruptState(format!(
                "unsupported index format version {}",
                persisted.version
            )));
        }
        if persisted.owners.len() != persisted.vectors.len() {
            return Err(RagError::CorruptState(format!(
                "index has {} owners but {} vectors",
                persisted.owners.len(),
                persisted.vectors.len()
            )));
        }

        let mut index = FlatIndex::new(persisted.dimensions);
        for (encoded, owner) in persisted.vectors.iter().zip(persisted.owners) {
            let vector = decode_vector(encoded)?;
            index.check_vector(&vector)?;
            let slot = index.len();
            index.vectors.extend_from_slice(&vector);
            index.membership.entry(owner.clone()).or_default().insert(slot);
            index.owners.push(owner);
        }

        if index.membership != persisted.membership {
            return Err(RagError::CorruptState(
                "document membership does not match slot owners".to_string(),
            ));
        }

        Ok((index, persisted.generation))
    }
}

fn encode_vector(vector: &[f32]) -> String {
    let bytes: Vec<u8> = vector.iter().flat_map(|value| value.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

fn decode_vector(encoded: &str) -> Result<Vec<f32>, RagError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|error| RagError::CorruptState(format!("vector is not valid base64: {error}")))?;
    if bytes.len() % 4 != 0 {
        return Err(RagError::CorruptState(format!(
            "vector byte length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect())
}

/// On-disk form of a [`FlatIndex`]. Vectors are base64 little-endian `f32`
/// rows so that a reload is bit-exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub version: u32,
    pub dimensions: usize,
    pub generation: u64,
    pub owners: Vec<String>,
    pub vectors: Vec<String>,
    pub membership: BTreeMap<String, SlotBitmap>,
}
