//! Append-only query metrics with on-demand aggregation.
//!
//! Records are kept in arrival order and, when a path is given, appended to a
//! JSON-lines file. Percentiles use the nearest-rank method over the full
//! history.

use crate::config::QualityThresholds;
use crate::error::RagError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

const RECENT_RECORDS: usize = 5;

/// One query. Non-finite values are written as `"NaN"`, `"inf"` or `"-inf"`
/// so that every recorded line reads back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryMetricRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(with = "float")]
    pub total_latency_ms: f64,
    #[serde(with = "float")]
    pub retrieval_latency_ms: f64,
    #[serde(with = "float")]
    pub llm_latency_ms: f64,
    #[serde(with = "float")]
    pub avg_similarity: f64,
    #[serde(with = "float")]
    pub confidence_score: f64,
    pub num_results: usize,
    #[serde(default, with = "optional_float")]
    pub embed_latency_ms: Option<f64>,
    #[serde(default, with = "optional_float")]
    pub search_latency_ms: Option<f64>,
}

mod float {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(super) enum Stored {
        Number(f64),
        Named(String),
    }

    impl Stored {
        pub(super) fn decode<E: Error>(self) -> Result<f64, E> {
            match self {
                Stored::Number(value) => Ok(value),
                Stored::Named(name) => name
                    .parse()
                    .map_err(|_| E::custom(format!("`{name}` is not a number"))),
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    /// Older logs hold `null` where serde_json wrote a non-finite value.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Option::<Stored>::deserialize(deserializer)? {
            Some(stored) => stored.decode(),
            None => Ok(f64::NAN),
        }
    }
}

mod optional_float {
    use super::float::{self, Stored};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    struct Encoded(f64);

    impl Serialize for Encoded {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            float::serialize(&self.0, serializer)
        }
    }

    pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&Encoded(*value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<f64>, D::Error> {
        Option::<Stored>::deserialize(deserializer)?
            .map(Stored::decode)
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ValueStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityRatios {
    pub high_confidence: f64,
    pub low_similarity: f64,
    pub slow_queries: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    pub count: usize,
    pub latency: LatencyStats,
    pub mean_retrieval_latency_ms: f64,
    pub mean_llm_latency_ms: f64,
    pub similarity: ValueStats,
    pub confidence: ValueStats,
    pub quality: QualityRatios,
    pub recent: Vec<QueryMetricRecord>,
}

/// Nearest-rank percentile of an ascending slice; `0.0` when empty.
pub fn nearest_rank(sorted: &[f64], percentile: u32) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (percentile as usize * sorted.len()).div_ceil(100);
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn value_stats(values: &[f64]) -> ValueStats {
    if values.is_empty() {
        return ValueStats::default();
    }
    ValueStats {
        mean: mean(values),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

fn fraction(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

struct MetricsLog {
    records: Vec<QueryMetricRecord>,
    file: Option<File>,
}

pub struct MetricsTracker {
    thresholds: QualityThresholds,
    log: Mutex<MetricsLog>,
}

impl MetricsTracker {
    pub fn in_memory(thresholds: QualityThresholds) -> Self {
        Self {
            thresholds,
            log: Mutex::new(MetricsLog {
                records: Vec::new(),
                file: None,
            }),
        }
    }

    /// Loads any existing history from `path` and appends new records to it.
    /// Lines that fail to parse are skipped with a warning.
    pub fn open(path: impl AsRef<Path>, thresholds: QualityThresholds) -> Result<Self, RagError> {
        let path = path.as_ref();
        let mut records = Vec::new();

        match File::open(path) {
            Ok(file) => {
                for (number, line) in BufReader::new(file).lines().enumerate() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<QueryMetricRecord>(&line) {
                        Ok(record) => records.push(record),
                        Err(error) => warn!(
                            path = %path.display(),
                            line = number + 1,
                            %error,
                            "skipping unreadable metrics line"
                        ),
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), records = records.len(), "metrics log opened");

        Ok(Self {
            thresholds,
            log: Mutex::new(MetricsLog {
                records,
                file: Some(file),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MetricsLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends one record. Only an I/O failure on the log file is an error;
    /// the record is kept in memory either way.
    pub fn record(&self, record: QueryMetricRecord) -> Result<(), RagError> {
        let mut log = self.lock();
        let line = serde_json::to_string(&record)?;
        log.records.push(record);

        if let Some(file) = log.file.as_mut() {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<QueryMetricRecord> {
        self.lock().records.clone()
    }

    pub fn aggregate(&self) -> MetricsSummary {
        let records = self.records();
        let count = records.len();
        if count == 0 {
            return MetricsSummary::default();
        }

        let mut latencies: Vec<f64> = records.iter().map(|r| r.total_latency_ms).collect();
        let retrieval: Vec<f64> = records.iter().map(|r| r.retrieval_latency_ms).collect();
        let llm: Vec<f64> = records.iter().map(|r| r.llm_latency_ms).collect();
        let similarities: Vec<f64> = records.iter().map(|r| r.avg_similarity).collect();
        let confidences: Vec<f64> = records.iter().map(|r| r.confidence_score).collect();

        let overall = value_stats(&latencies);
        latencies.sort_by(f64::total_cmp);

        let thresholds = self.thresholds;
        let quality = QualityRatios {
            high_confidence: fraction(
                confidences.iter().filter(|c| **c > thresholds.high_confidence).count(),
                count,
            ),
            low_similarity: fraction(
                similarities.iter().filter(|s| **s < thresholds.low_similarity).count(),
                count,
            ),
            slow_queries: fraction(
                records
                    .iter()
                    .filter(|r| r.total_latency_ms > thresholds.slow_query_ms)
                    .count(),
                count,
            ),
        };

        MetricsSummary {
            count,
            latency: LatencyStats {
                mean_ms: overall.mean,
                min_ms: overall.min,
                max_ms: overall.max,
                p50_ms: nearest_rank(&latencies, 50),
                p95_ms: nearest_rank(&latencies, 95),
                p99_ms: nearest_rank(&latencies, 99),
            },
            mean_retrieval_latency_ms: mean(&retrieval),
            mean_llm_latency_ms: mean(&llm),
            similarity: value_stats(&similarities),
            confidence: value_stats(&confidences),
            quality,
            recent: records[count.saturating_sub(RECENT_RECORDS)..].to_vec(),
        }
    }
}
