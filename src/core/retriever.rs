//! RAG Retriever (C3): normalizes a query, searches a vector backend, filters by score
//! and caller predicates, then re-ranks the survivors with a keyword-overlap bonus before
//! truncating to `k`.
//!
//! The re-ranking bonus reuses a Jaccard word-set similarity measure originally used to
//! score relevance between conversation turns; here it blends with the vector backend's
//! own score instead of standing alone.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use async_trait::async_trait;

/// Caller-supplied predicates narrowing a retrieval beyond plain vector similarity
/// (§4.3 step 3). All set fields must match for a chunk to survive; an unset field
/// imposes no constraint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkFilters {
    pub media_type: Option<String>,
    pub conversation_scope: Option<String>,
    pub date_range: Option<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)>,
}

impl ChunkFilters {
    pub fn none() -> Self {
        Self::default()
    }

    fn matches(&self, chunk: &RetrievedChunk) -> bool {
        if let Some(media_type) = &self.media_type {
            if chunk.source.media_type.as_deref() != Some(media_type.as_str()) {
                return false;
            }
        }
        if let Some(scope) = &self.conversation_scope {
            if chunk.source.conversation_scope.as_deref() != Some(scope.as_str()) {
                return false;
            }
        }
        if let Some((from, to)) = &self.date_range {
            let created_at = chunk.source.created_at;
            if created_at < *from || created_at > *to {
                return false;
            }
        }
        true
    }
}

/// Free-form provenance carried alongside a chunk (§3 "source metadata"), plus the
/// insertion timestamp the ordering tie-break (§4.3) sorts on.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkSource {
    pub media_type: Option<String>,
    pub conversation_scope: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Default for ChunkSource {
    fn default() -> Self {
        Self {
            media_type: None,
            conversation_scope: None,
            created_at: chrono::DateTime::from_timestamp(0, 0).expect("epoch is a valid timestamp"),
        }
    }
}

/// One retrieved passage plus its blended relevance score (§3: "document id, chunk id,
/// text, score, source metadata").
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RetrievedChunk {
    pub document_id: String,
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
    pub source: ChunkSource,
}

/// Failure modes surfaced from a retrieval call (§4.3, §7).
#[derive(Debug, Clone)]
pub enum RetrievalError {
    VectorBackendUnavailable(String),
}

impl std::fmt::Display for RetrievalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrievalError::VectorBackendUnavailable(msg) => write!(f, "vector backend unavailable: {}", msg),
        }
    }
}

impl std::error::Error for RetrievalError {}

/// A corpus of chunks reachable by approximate nearest-neighbour lookup. Swappable so
/// tests and small deployments can use an in-memory backend while a production
/// deployment points at a real vector database.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RetrievedChunk>, RetrievalError>;
}

/// An in-memory [`VectorBackend`] that scores chunks by word-set Jaccard similarity to
/// the query. No embedding model involved — this is the reference backend used in tests
/// and small deployments; a real deployment substitutes a proper embedding index behind
/// the same trait.
#[derive(Default)]
pub struct InMemoryVectorBackend {
    chunks: Vec<RetrievedChunk>,
    next_chunk_id: u64,
}

impl InMemoryVectorBackend {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            next_chunk_id: 0,
        }
    }

    /// Adds a chunk with no source metadata, stamped with an insertion order that the
    /// ordering tie-break can use.
    pub fn add_chunk(&mut self, document_id: impl Into<String>, text: impl Into<String>) {
        self.add_chunk_with_source(document_id, text, ChunkSource::default());
    }

    pub fn add_chunk_with_source(&mut self, document_id: impl Into<String>, text: impl Into<String>, mut source: ChunkSource) {
        let chunk_id = self.next_chunk_id;
        self.next_chunk_id += 1;
        // Insertion order doubles as the tie-break timestamp when the caller hasn't set one.
        if source.created_at == ChunkSource::default().created_at {
            source.created_at = ChunkSource::default().created_at + chrono::Duration::nanoseconds(chunk_id as i64);
        }
        self.chunks.push(RetrievedChunk {
            document_id: document_id.into(),
            chunk_id: chunk_id.to_string(),
            text: text.into(),
            score: 0.0,
            source,
        });
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorBackend {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let mut scored: Vec<RetrievedChunk> = self
            .chunks
            .iter()
            .map(|chunk| RetrievedChunk {
                document_id: chunk.document_id.clone(),
                chunk_id: chunk.chunk_id.clone(),
                text: chunk.text.clone(),
                score: jaccard_similarity(query, &chunk.text),
                source: chunk.source.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

/// Word-set Jaccard similarity: lowercase, split on whitespace, drop words of length ≤ 2,
/// trim non-alphanumeric characters from each word's edges. Both-empty is defined as
/// identical (1.0); exactly-one-empty has no overlap (0.0).
fn jaccard_similarity(text1: &str, text2: &str) -> f32 {
    let tokenize = |text: &str| -> HashSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|w| !w.is_empty())
            .collect()
    };

    let words1 = tokenize(text1);
    let words2 = tokenize(text2);

    if words1.is_empty() && words2.is_empty() {
        return 1.0;
    }
    if words1.is_empty() || words2.is_empty() {
        return 0.0;
    }

    let intersection_size = words1.intersection(&words2).count();
    let union_size = words1.union(&words2).count();
    intersection_size as f32 / union_size as f32
}

fn cache_key(query: &str, k: usize, filters: &ChunkFilters, min_score: f32) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    k.hash(&mut hasher);
    min_score.to_bits().hash(&mut hasher);
    filters.media_type.hash(&mut hasher);
    filters.conversation_scope.hash(&mut hasher);
    filters
        .date_range
        .map(|(from, to)| (from.timestamp_nanos_opt().unwrap_or(0), to.timestamp_nanos_opt().unwrap_or(0)))
        .hash(&mut hasher);
    hasher.finish()
}

/// Normalizes a query, searches a [`VectorBackend`], filters by `min_score` and caller
/// predicates, re-ranks with a Jaccard bonus, and truncates to `k` (§4.3). A best-effort
/// in-memory cache avoids re-querying the backend for a repeated `(query, filters, k,
/// min_score)` tuple within the retriever's lifetime; it is not a correctness guarantee
/// and is never consulted across process restarts.
pub struct RagRetriever {
    backend: Box<dyn VectorBackend>,
    jaccard_weight: f32,
    cache: RwLock<HashMap<u64, Vec<RetrievedChunk>>>,
}

impl RagRetriever {
    pub fn new(backend: Box<dyn VectorBackend>) -> Self {
        Self {
            backend,
            jaccard_weight: 0.2,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_jaccard_weight(mut self, weight: f32) -> Self {
        self.jaccard_weight = weight;
        self
    }

    /// Normalize, search, filter, re-rank, truncate (§4.3).
    pub async fn retrieve(
        &self,
        query: &str,
        filters: &ChunkFilters,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let normalized = query.trim().to_lowercase();
        let key = cache_key(&normalized, k, filters, min_score);

        if let Some(hit) = self.cache.read().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        // Over-fetch so re-ranking and filtering have more than `k` candidates to choose
        // among; §4.3 step 2 fixes the floor at 20.
        let fetch_limit = k.max(20);
        let raw = self.backend.search(&normalized, fetch_limit).await?;

        let vector_weight = 1.0 - self.jaccard_weight;
        let mut reranked: Vec<RetrievedChunk> = raw
            .into_iter()
            .filter(|chunk| chunk.score >= min_score)
            .filter(|chunk| filters.matches(chunk))
            .map(|mut chunk| {
                let bonus = jaccard_similarity(&normalized, &chunk.text);
                chunk.score = chunk.score * vector_weight + bonus * self.jaccard_weight;
                chunk
            })
            .collect();

        // Stable sort descending by blended score; ties break by earlier insertion
        // timestamp, then document id lexicographic order (§4.3 "ordering guarantee").
        reranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source.created_at.cmp(&b.source.created_at))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        reranked.truncate(k);

        self.cache.write().unwrap().insert(key, reranked.clone());
        Ok(reranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_backend() -> InMemoryVectorBackend {
        let mut backend = InMemoryVectorBackend::new();
        backend.add_chunk("1", "Rust ownership and borrowing rules");
        backend.add_chunk("2", "Python list comprehensions and generators");
        backend.add_chunk("3", "Rust async runtimes: tokio and async-std");
        backend
    }

    #[tokio::test]
    async fn retrieve_ranks_by_blended_score_and_truncates() {
        let retriever = RagRetriever::new(Box::new(sample_backend()));
        let results = retriever.retrieve("Rust async programming", &ChunkFilters::none(), 2, 0.0).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].score >= results[1].score);
        assert!(results.iter().any(|r| r.document_id == "3"));
    }

    #[tokio::test]
    async fn repeated_query_hits_cache() {
        let retriever = RagRetriever::new(Box::new(sample_backend()));
        let first = retriever.retrieve("Rust ownership", &ChunkFilters::none(), 1, 0.0).await.unwrap();
        let second = retriever.retrieve("  Rust Ownership  ", &ChunkFilters::none(), 1, 0.0).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn min_score_drops_weak_matches() {
        let retriever = RagRetriever::new(Box::new(sample_backend()));
        let unfiltered = retriever.retrieve("Rust async programming", &ChunkFilters::none(), 3, 0.0).await.unwrap();
        assert_eq!(unfiltered.len(), 3);
        let filtered = retriever
            .retrieve("Rust async programming", &ChunkFilters::none(), 3, 0.3)
            .await
            .unwrap();
        assert!(filtered.len() < unfiltered.len());
        assert!(filtered.iter().all(|c| c.score >= 0.3));
    }

    #[tokio::test]
    async fn media_type_filter_excludes_non_matching_chunks() {
        let mut backend = InMemoryVectorBackend::new();
        backend.add_chunk_with_source(
            "1",
            "Rust ownership and borrowing rules",
            ChunkSource {
                media_type: Some("text".to_string()),
                ..ChunkSource::default()
            },
        );
        backend.add_chunk_with_source(
            "2",
            "Rust ownership diagram",
            ChunkSource {
                media_type: Some("image".to_string()),
                ..ChunkSource::default()
            },
        );
        let retriever = RagRetriever::new(Box::new(backend));
        let filters = ChunkFilters {
            media_type: Some("text".to_string()),
            ..ChunkFilters::none()
        };
        let results = retriever.retrieve("Rust ownership", &filters, 10, 0.0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "1");
    }

    #[tokio::test]
    async fn ties_break_by_insertion_order_then_document_id() {
        // Both chunks are identical text so they tie on blended score; insertion order
        // (chunk "1" added first) decides the ordering, not document id.
        let mut backend = InMemoryVectorBackend::new();
        backend.add_chunk("2", "identical content here");
        backend.add_chunk("1", "identical content here");
        let retriever = RagRetriever::new(Box::new(backend));
        let results = retriever.retrieve("identical content here", &ChunkFilters::none(), 2, 0.0).await.unwrap();
        assert_eq!(results[0].document_id, "2");
        assert_eq!(results[1].document_id, "1");
    }

    #[test]
    fn jaccard_both_empty_is_identical() {
        assert_eq!(jaccard_similarity("", ""), 1.0);
    }

    #[test]
    fn jaccard_one_empty_has_no_overlap() {
        assert_eq!(jaccard_similarity("hello world", ""), 0.0);
    }

    #[test]
    fn jaccard_short_words_are_ignored() {
        // "a" and "to" are both length <= 2 and dropped, leaving disjoint word sets.
        assert_eq!(jaccard_similarity("a to it", "a to it"), 1.0);
    }
}
