//! Per-user knowledge base.
//!
//! Documents are split into bounded chunks, each embedded independently.
//! Search is hybrid: `beta * cosine + (1 - beta) * bm25_norm`, strictly
//! filtered by user. A request that cannot be attributed to a user is
//! rejected with `permission_denied` — isolation is enforced here, not
//! left to the stores.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::embedding::{Embedder, tokenize};
use crate::error::{Result, RuntimeError};
use crate::model::{ChunkRecord, DocumentRecord, fresh_id};
use crate::store::{MetadataFilter, RecordStore, VectorPoint, VectorStore};

const NAMESPACE: &str = "knowledge";

/// Chunking and ranking parameters.
#[derive(Debug, Clone, Copy)]
pub struct KnowledgeConfig {
    /// Weight of cosine similarity (vs BM25) in ranking.
    pub beta: f32,
    /// Target chunk size in approximate tokens.
    pub chunk_target_tokens: usize,
    /// Hard chunk size cap in approximate tokens.
    pub chunk_max_tokens: usize,
}

impl From<&RuntimeConfig> for KnowledgeConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            beta: config.knowledge_beta,
            chunk_target_tokens: config.chunk_target_tokens,
            chunk_max_tokens: config.chunk_max_tokens,
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

/// A search hit with its blended score.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeHit {
    /// The matched chunk, with original text and source offset.
    pub chunk: ChunkRecord,
    /// `beta * cosine + (1 - beta) * bm25_norm`.
    pub score: f32,
}

/// The per-user knowledge store.
pub struct KnowledgeSubsystem {
    records: Arc<dyn RecordStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    config: KnowledgeConfig,
}

impl std::fmt::Debug for KnowledgeSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeSubsystem")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KnowledgeSubsystem {
    /// Creates the subsystem over its collaborators.
    pub fn new(
        records: Arc<dyn RecordStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: KnowledgeConfig,
    ) -> Self {
        Self {
            records,
            vectors,
            embedder,
            config,
        }
    }

    fn require_user(user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(RuntimeError::PermissionDenied(
                "knowledge access requires a user identity".into(),
            ));
        }
        Ok(())
    }

    /// Chunks, embeds, and stores a document.
    pub async fn ingest(
        &self,
        user_id: &str,
        name: &str,
        mime: &str,
        text: &str,
    ) -> Result<DocumentRecord> {
        Self::require_user(user_id)?;

        let document = DocumentRecord {
            doc_id: fresh_id(),
            user_id: user_id.to_owned(),
            name: name.to_owned(),
            mime: mime.to_owned(),
            created_at: Utc::now(),
        };

        let pieces = chunk_text(
            text,
            self.config.chunk_target_tokens,
            self.config.chunk_max_tokens,
        );
        let chunks: Vec<ChunkRecord> = pieces
            .into_iter()
            .enumerate()
            .map(|(ordinal, (offset, segment))| ChunkRecord {
                chunk_id: fresh_id(),
                doc_id: document.doc_id.clone(),
                user_id: user_id.to_owned(),
                ordinal: ordinal as u64,
                text: segment,
                source_offset: offset,
            })
            .collect();

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        self.records.insert_document(&document).await?;
        self.records.insert_chunks(&chunks).await?;

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                VectorPoint::new(&chunk.chunk_id, embedding, user_id)
                    .with_meta("doc_id", &chunk.doc_id)
                    .with_meta("ordinal", chunk.ordinal.to_string())
            })
            .collect();
        self.vectors.upsert(NAMESPACE, points).await?;

        info!(
            user = user_id,
            doc = %document.doc_id,
            chunks = chunks.len(),
            "ingested document"
        );
        Ok(document)
    }

    /// Hybrid search over the user's chunks.
    ///
    /// An empty knowledge base yields an empty list, not an error.
    pub async fn search(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<KnowledgeHit>> {
        Self::require_user(user_id)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let corpus = self.records.list_chunks(user_id, None).await?;
        if corpus.is_empty() {
            return Ok(Vec::new());
        }

        // Vector leg, oversampled so the keyword leg can still promote.
        let query_embedding = self.embedder.embed_one(query).await?;
        let oversample = (k * 4).max(16);
        let vector_hits = self
            .vectors
            .search(
                NAMESPACE,
                &query_embedding,
                oversample,
                &MetadataFilter::for_user(user_id),
            )
            .await?;
        let cosine_by_id: HashMap<&str, f32> = vector_hits
            .iter()
            .map(|hit| (hit.id.as_str(), hit.score))
            .collect();

        // Keyword leg over the whole user corpus, normalized to [0, 1].
        let query_tokens = tokenize(query);
        let bm25_raw = bm25_scores(&corpus, &query_tokens);
        let bm25_max = bm25_raw.iter().copied().fold(0.0f32, f32::max);

        let mut candidate_ids: HashSet<&str> =
            cosine_by_id.keys().copied().collect();
        let mut by_bm25: Vec<(usize, f32)> = bm25_raw.iter().copied().enumerate().collect();
        by_bm25.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (idx, score) in by_bm25.into_iter().take(oversample) {
            if score > 0.0 {
                candidate_ids.insert(corpus[idx].chunk_id.as_str());
            }
        }

        let bm25_by_id: HashMap<&str, f32> = corpus
            .iter()
            .zip(&bm25_raw)
            .map(|(chunk, raw)| {
                let norm = if bm25_max > 0.0 { raw / bm25_max } else { 0.0 };
                (chunk.chunk_id.as_str(), norm)
            })
            .collect();

        let beta = self.config.beta;
        let mut hits: Vec<KnowledgeHit> = corpus
            .iter()
            .filter(|chunk| candidate_ids.contains(chunk.chunk_id.as_str()))
            .map(|chunk| {
                let id = chunk.chunk_id.as_str();
                let similarity = cosine_by_id.get(id).copied().unwrap_or(0.0);
                let keyword = bm25_by_id.get(id).copied().unwrap_or(0.0);
                KnowledgeHit {
                    chunk: chunk.clone(),
                    score: beta * similarity + (1.0 - beta) * keyword,
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Removes a document and its chunks from both stores.
    pub async fn delete_document(&self, user_id: &str, doc_id: &str) -> Result<()> {
        Self::require_user(user_id)?;
        let chunk_ids: Vec<String> = self
            .records
            .list_chunks(user_id, Some(doc_id))
            .await?
            .into_iter()
            .map(|c| c.chunk_id)
            .collect();
        self.records.delete_document(user_id, doc_id).await?;
        self.vectors.remove(NAMESPACE, &chunk_ids).await?;
        Ok(())
    }
}

/// Splits text into `(byte_offset, segment)` pieces of roughly
/// `target_tokens`, never exceeding `max_tokens` (approximated at four
/// bytes per token). Cuts prefer whitespace; pathological unbroken runs
/// are force-cut at the cap.
pub(crate) fn chunk_text(
    text: &str,
    target_tokens: usize,
    max_tokens: usize,
) -> Vec<(u64, String)> {
    let target_bytes = target_tokens.saturating_mul(4).max(1);
    let max_bytes = max_tokens.saturating_mul(4).max(target_bytes);
    let mut out = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        // Skip leading whitespace.
        while let Some(c) = text[start..].chars().next() {
            if c.is_whitespace() {
                start += c.len_utf8();
            } else {
                break;
            }
        }
        if start >= text.len() {
            break;
        }

        let remaining = &text[start..];
        if remaining.len() <= max_bytes {
            out.push((start as u64, remaining.trim_end().to_owned()));
            break;
        }

        // Window end at a char boundary no further than the hard cap.
        let mut window_end = max_bytes;
        while !remaining.is_char_boundary(window_end) {
            window_end -= 1;
        }
        let window = &remaining[..window_end];

        // Prefer the first whitespace at or past the target.
        let cut = window
            .char_indices()
            .filter(|(idx, c)| *idx >= target_bytes.min(window_end) && c.is_whitespace())
            .map(|(idx, _)| idx)
            .next()
            .or_else(|| {
                window
                    .char_indices()
                    .filter(|(_, c)| c.is_whitespace())
                    .map(|(idx, _)| idx)
                    .next_back()
            })
            .unwrap_or(window_end);

        let segment = remaining[..cut].trim_end();
        if !segment.is_empty() {
            out.push((start as u64, segment.to_owned()));
        }
        start += cut.max(1);
    }
    out
}

/// Okapi BM25 scores of `query_tokens` against every chunk, in corpus order.
fn bm25_scores(corpus: &[ChunkRecord], query_tokens: &[String]) -> Vec<f32> {
    const K1: f32 = 1.2;
    const B: f32 = 0.75;

    let docs: Vec<Vec<String>> = corpus.iter().map(|c| tokenize(&c.text)).collect();
    let n = docs.len() as f32;
    let avgdl = docs.iter().map(Vec::len).sum::<usize>() as f32 / n.max(1.0);

    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for doc in &docs {
        let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
        for token in unique {
            *doc_freq.entry(token).or_insert(0) += 1;
        }
    }

    docs.iter()
        .map(|doc| {
            let dl = doc.len() as f32;
            query_tokens
                .iter()
                .map(|term| {
                    let df = doc_freq.get(term.as_str()).copied().unwrap_or(0) as f32;
                    if df == 0.0 {
                        return 0.0;
                    }
                    let tf = doc.iter().filter(|t| *t == term).count() as f32;
                    if tf == 0.0 {
                        return 0.0;
                    }
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * dl / avgdl.max(1.0)))
                })
                .sum()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::{InMemoryVectorStore, SqliteRecordStore};

    const DIM: usize = 128;

    fn subsystem() -> KnowledgeSubsystem {
        KnowledgeSubsystem::new(
            Arc::new(SqliteRecordStore::in_memory().expect("store")),
            Arc::new(InMemoryVectorStore::new(DIM)),
            Arc::new(HashEmbedder::new(DIM)),
            KnowledgeConfig::default(),
        )
    }

    #[tokio::test]
    async fn ingest_then_search_finds_relevant_chunk() {
        let knowledge = subsystem();
        knowledge
            .ingest(
                "user-a",
                "pets.txt",
                "text/plain",
                "The office dog is named Biscuit and loves tennis balls. \
                 Parking is available in the basement garage after six.",
            )
            .await
            .expect("ingest");

        let hits = knowledge
            .search("user-a", "what is the dog called", 3)
            .await
            .expect("search");

        assert!(!hits.is_empty());
        assert!(hits[0].chunk.text.contains("Biscuit"));
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn search_is_isolated_per_user() {
        let knowledge = subsystem();
        knowledge
            .ingest("user-a", "a.txt", "text/plain", "alpha secret document")
            .await
            .expect("ingest");

        let hits = knowledge
            .search("user-b", "alpha secret", 5)
            .await
            .expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn anonymous_search_is_rejected() {
        let knowledge = subsystem();
        let err = knowledge.search("", "anything", 5).await.expect_err("reject");
        assert!(matches!(err, RuntimeError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn empty_knowledge_base_yields_empty_list() {
        let knowledge = subsystem();
        let hits = knowledge
            .search("user-a", "anything at all", 5)
            .await
            .expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_document_removes_its_chunks() {
        let knowledge = subsystem();
        let doc = knowledge
            .ingest("user-a", "a.txt", "text/plain", "ephemeral content here")
            .await
            .expect("ingest");

        knowledge
            .delete_document("user-a", &doc.doc_id)
            .await
            .expect("delete");

        let hits = knowledge
            .search("user-a", "ephemeral content", 5)
            .await
            .expect("search");
        assert!(hits.is_empty());
    }

    #[test]
    fn chunker_respects_target_and_records_offsets() {
        let text = (0..200)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 20, 30);

        assert!(chunks.len() > 1);
        for (offset, segment) in &chunks {
            assert!(segment.len() <= 30 * 4);
            // Offsets point at the segment in the source.
            let at = *offset as usize;
            assert!(text[at..].starts_with(segment.split(' ').next().unwrap_or("")));
        }
    }

    #[test]
    fn chunker_force_cuts_unbroken_runs() {
        let text = "x".repeat(5000);
        let chunks = chunk_text(&text, 100, 200);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|(_, s)| s.len() <= 200 * 4));
    }

    #[test]
    fn chunker_handles_empty_and_whitespace() {
        assert!(chunk_text("", 10, 20).is_empty());
        assert!(chunk_text("   \n\t  ", 10, 20).is_empty());
    }

    #[test]
    fn bm25_prefers_matching_documents() {
        let corpus: Vec<ChunkRecord> = [
            "the dog chased the ball",
            "quarterly finance report",
            "a dog and another dog",
        ]
        .iter()
        .enumerate()
        .map(|(i, text)| ChunkRecord {
            chunk_id: format!("c{i}"),
            doc_id: "d".into(),
            user_id: "u".into(),
            ordinal: i as u64,
            text: (*text).to_owned(),
            source_offset: 0,
        })
        .collect();

        let scores = bm25_scores(&corpus, &tokenize("dog"));
        assert!(scores[0] > 0.0);
        assert!((scores[1] - 0.0).abs() < f32::EPSILON);
        assert!(scores[2] > scores[0], "higher tf should score higher");
    }
}
