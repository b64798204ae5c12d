//! Text embedders.
//!
//! Every [`Embedder`] returns L2-normalized vectors. The vector index scores
//! with a plain inner product and relies on this to get cosine similarity.

use crate::error::RagError;

const DEFAULT: usize = 256;
const WORD_WEIGHT: f32 = 2.0;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Embeds one text. Blank input is rejected rather than mapped to a zero vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, RagError>;

    /// Output order matches input order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

pub fn l2_normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in vector.iter_mut() {
            *value /= magnitude;
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 1469598103934665603u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

/// Feature-hashing embedder over character trigrams and whole words.
///
/// Deterministic and dependency free; useful offline and in tests.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn bucket(&self, bytes: &[u8]) -> usize {
        (fnv1a(bytes) % self.dimensions.max(1) as u64) as usize
    }
}

impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        if text.trim().is_empty() {
            return Err(RagError::InvalidInput(
                "cannot embed empty text".to_string(),
            ));
        }

        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();

        for word in lowered.split_whitespace() {
            let bucket = self.bucket(word.as_bytes());
            vector[bucket] += WORD_WEIGHT;
        }

        // Pad so that one- and two-character inputs still produce a trigram.
        let padded: Vec<char> = std::iter::once(' ')
            .chain(lowered.split_whitespace().flat_map(|word| word.chars().chain([' '])))
            .collect();
        let mut buffer = [0u8; 12];
        for window in padded.windows(3) {
            let mut length = 0;
            for ch in window {
                length += ch.encode_utf8(&mut buffer[length..]).len();
            }
            let bucket = self.bucket(&buffer[..length]);
            vector[bucket] += 1.0;
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_unit_length(vector: &[f32], tolerance: f32) -> bool {
        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        (magnitude - 1.0).abs() <= tolerance
    }

    fn cosine(left: &[f32], right: &[f32]) -> f32 {
        left.iter().zip(right).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow").unwrap();
        let second = embedder.embed("Hydraulic pressure and flow").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("abc").unwrap();
        assert_eq!(vector.len(), 32);
    }

    #[test]
    fn vectors_are_unit_length() {
        let embedder = CharacterNgramEmbedder::default();
        for text in ["a", "ab", "the quick brown fox", "ünïcödé text"] {
            let vector = embedder.embed(text).unwrap();
            assert!(is_unit_length(&vector, 1e-5), "{text} is not normalized");
        }
    }

    #[test]
    fn blank_text_is_invalid_input() {
        let embedder = CharacterNgramEmbedder::default();
        assert!(matches!(embedder.embed(""), Err(RagError::InvalidInput(_))));
        assert!(matches!(embedder.embed("  \n"), Err(RagError::InvalidInput(_))));
    }

    #[test]
    fn batch_preserves_order() {
        let embedder = CharacterNgramEmbedder::default();
        let batch = embedder.embed_batch(&["first text", "second text"]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed("first text").unwrap());
        assert_eq!(batch[1], embedder.embed("second text").unwrap());
    }

    #[test]
    fn batch_fails_on_any_blank_entry() {
        let embedder = CharacterNgramEmbedder::default();
        assert!(embedder.embed_batch(&["fine", " "]).is_err());
    }

    #[test]
    fn related_texts_score_higher_than_unrelated() {
        let embedder = CharacterNgramEmbedder::default();
        let query = embedder.embed("pump pressure failure").unwrap();
        let related = embedder.embed("the pump failed when pressure dropped").unwrap();
        let unrelated = embedder.embed("quarterly marketing budget review").unwrap();
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }
}
