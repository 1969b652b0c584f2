//! Per-user memory.
//!
//! After each run an extraction pass distills the transcript into zero or
//! more candidate memories, deduplicates them against the user's existing
//! memories (embedding cosine AND token Jaccard), and persists survivors.
//! Retrieval is topic-pre-filtered and ranked by a blend of cosine
//! similarity and topic overlap. A background merge pass collapses
//! near-identical memories into one canonical record, archiving the
//! originals.
//!
//! Writes are serialized per user so deduplication is deterministic;
//! reads run concurrently.

pub mod topics;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::embedding::{Embedder, cosine, tokenize};
use crate::error::{Result, RuntimeError};
use crate::llm::{ChatMessage, ChatRequest, LlmBackend};
use crate::model::{MemoryRecord, fresh_id};
use crate::store::{MetadataFilter, RecordStore, VectorPoint, VectorStore};

const NAMESPACE: &str = "memories";

const EXTRACTION_PROMPT: &str = "\
You extract durable facts about the user from a conversation transcript.
Return a JSON array, possibly empty, of objects {\"topics\": [string], \"text\": string}.
Each text is one self-contained fact worth remembering across sessions
(preferences, relationships, projects, deadlines, expertise, ...).
Skip chit-chat, one-off requests, and anything already implied by another fact.
Return only the JSON array, no commentary.";

/// Similarity thresholds and ranking weights.
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// Cosine threshold above which a candidate duplicates an existing memory.
    pub dedup_cosine: f32,
    /// Token-Jaccard threshold paired with the cosine check.
    pub dedup_jaccard: f32,
    /// Cosine threshold above which the optimizer merges memories.
    pub merge_cosine: f32,
    /// Weight of cosine (vs topic overlap) in retrieval ranking.
    pub rank_alpha: f32,
}

impl From<&RuntimeConfig> for MemoryConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            dedup_cosine: config.memory_dedup_cosine,
            dedup_jaccard: config.memory_dedup_jaccard,
            merge_cosine: config.memory_merge_cosine,
            rank_alpha: config.memory_rank_alpha,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

/// A retrieval hit with its blended score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMemory {
    /// The matched memory.
    pub memory: MemoryRecord,
    /// `alpha * cosine + (1 - alpha) * topic_overlap`.
    pub score: f32,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    topics: Vec<String>,
    text: String,
}

/// The per-user memory store.
pub struct MemorySubsystem {
    records: Arc<dyn RecordStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    backend: Arc<dyn LlmBackend>,
    config: MemoryConfig,
    user_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for MemorySubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySubsystem")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MemorySubsystem {
    /// Creates the subsystem over its collaborators.
    pub fn new(
        records: Arc<dyn RecordStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn LlmBackend>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            records,
            vectors,
            embedder,
            backend,
            config,
            user_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The single-writer lock for one user's memories.
    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .user_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(user_id.to_owned()).or_default())
    }

    fn require_user(user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(RuntimeError::PermissionDenied(
                "memory access requires a user identity".into(),
            ));
        }
        Ok(())
    }

    /// Extracts and persists new memories from a run transcript.
    ///
    /// Duplicates of existing memories (cosine ≥ `dedup_cosine` AND Jaccard
    /// ≥ `dedup_jaccard`) are dropped. Returns the memories actually
    /// created. Failures here must not fail the enclosing run; callers log
    /// and emit a metrics-class event instead.
    pub async fn create(
        &self,
        user_id: &str,
        source_run_id: Option<&str>,
        transcript: &str,
    ) -> Result<Vec<MemoryRecord>> {
        Self::require_user(user_id)?;
        if transcript.trim().is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.extract_candidates(transcript).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let existing = self.records.list_memories(user_id, false).await?;
        // Texts by id, extended as the batch inserts, so a repeated
        // candidate within one extraction is caught too.
        let mut texts_by_id: HashMap<String, String> = existing
            .iter()
            .map(|m| (m.memory_id.clone(), m.text.clone()))
            .collect();

        let mut created = Vec::new();
        for candidate in candidates {
            let topics = topics::normalize_all(&candidate.topics);
            let text = candidate.text.trim();
            if text.is_empty() {
                continue;
            }

            let embedding = self.embedder.embed_one(text).await?;
            if self
                .is_duplicate(user_id, text, &embedding, &texts_by_id)
                .await?
            {
                debug!(user = user_id, "dropping duplicate memory candidate");
                continue;
            }

            let memory = MemoryRecord {
                memory_id: fresh_id(),
                user_id: user_id.to_owned(),
                topics,
                text: text.to_owned(),
                source_run_id: source_run_id.map(str::to_owned),
                created_at: Utc::now(),
                archived_at: None,
            };
            self.records.insert_memory(&memory).await?;
            self.vectors
                .upsert(
                    NAMESPACE,
                    vec![VectorPoint::new(&memory.memory_id, embedding, user_id)],
                )
                .await?;
            texts_by_id.insert(memory.memory_id.clone(), memory.text.clone());
            created.push(memory);
        }

        if !created.is_empty() {
            info!(user = user_id, count = created.len(), "created memories");
        }
        Ok(created)
    }

    async fn extract_candidates(&self, transcript: &str) -> Result<Vec<Candidate>> {
        let request = ChatRequest::new(
            self.backend.default_model(),
            vec![
                ChatMessage::system(EXTRACTION_PROMPT),
                ChatMessage::user(transcript),
            ],
        );
        let response = self.backend.chat(&request).await?;
        let text = response.text().unwrap_or_default();
        Ok(parse_candidates(text))
    }

    async fn is_duplicate(
        &self,
        user_id: &str,
        text: &str,
        embedding: &[f32],
        texts_by_id: &HashMap<String, String>,
    ) -> Result<bool> {
        let near = self
            .vectors
            .search(
                NAMESPACE,
                embedding,
                8,
                &MetadataFilter::for_user(user_id),
            )
            .await?;

        for hit in near {
            if hit.score < self.config.dedup_cosine {
                break;
            }
            let Some(other_text) = texts_by_id.get(&hit.id) else {
                continue;
            };
            if jaccard(text, other_text) >= self.config.dedup_jaccard {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Topic-filtered, similarity-ranked retrieval.
    ///
    /// When `topics` is non-empty it is a structural pre-filter: a memory
    /// sharing no listed topic is excluded before ranking. Archived
    /// memories never appear.
    pub async fn search(
        &self,
        user_id: &str,
        topics: &[String],
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredMemory>> {
        Self::require_user(user_id)?;
        let topics = topics::normalize_all(topics);

        let candidates: Vec<MemoryRecord> = self
            .records
            .list_memories(user_id, false)
            .await?
            .into_iter()
            .filter(|m| {
                topics.is_empty() || m.topics.iter().any(|t| topics.contains(t))
            })
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed_one(query).await?;
        let ids: Vec<String> = candidates.iter().map(|m| m.memory_id.clone()).collect();
        let points = self.vectors.fetch(NAMESPACE, &ids).await?;
        let vectors_by_id: HashMap<&str, &[f32]> = points
            .iter()
            .map(|p| (p.id.as_str(), p.vector.as_slice()))
            .collect();

        let alpha = self.config.rank_alpha;
        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .map(|memory| {
                let similarity = vectors_by_id
                    .get(memory.memory_id.as_str())
                    .map_or(0.0, |v| cosine(&query_embedding, v));
                let overlap = topic_overlap(&memory.topics, &topics);
                ScoredMemory {
                    score: alpha * similarity + (1.0 - alpha) * overlap,
                    memory,
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Merges near-identical memories for one user.
    ///
    /// Clusters of memories with pairwise cosine ≥ `merge_cosine` collapse
    /// into a single canonical memory carrying the union of topics and the
    /// longest text; the originals are archived, not deleted. Returns the
    /// canonical memories created.
    pub async fn optimize(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        Self::require_user(user_id)?;
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let memories = self.records.list_memories(user_id, false).await?;
        if memories.len() < 2 {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = memories.iter().map(|m| m.memory_id.clone()).collect();
        let points = self.vectors.fetch(NAMESPACE, &ids).await?;
        let vectors_by_id: HashMap<&str, &[f32]> = points
            .iter()
            .map(|p| (p.id.as_str(), p.vector.as_slice()))
            .collect();

        let mut consumed: HashSet<usize> = HashSet::new();
        let mut canonicals = Vec::new();

        for i in 0..memories.len() {
            if consumed.contains(&i) {
                continue;
            }
            let Some(anchor_vec) = vectors_by_id.get(memories[i].memory_id.as_str()) else {
                continue;
            };

            let mut cluster = vec![i];
            for j in (i + 1)..memories.len() {
                if consumed.contains(&j) {
                    continue;
                }
                // Batched jobs must never merge across users; the listing
                // is already scoped, but verify at the boundary anyway.
                if memories[j].user_id != memories[i].user_id {
                    warn!(
                        a = %memories[i].memory_id,
                        b = %memories[j].memory_id,
                        "merge candidates with mismatched owners, skipping"
                    );
                    continue;
                }
                let Some(other_vec) = vectors_by_id.get(memories[j].memory_id.as_str()) else {
                    continue;
                };
                if cosine(anchor_vec, other_vec) >= self.config.merge_cosine {
                    cluster.push(j);
                }
            }
            if cluster.len() < 2 {
                continue;
            }
            consumed.extend(cluster.iter().copied());

            let members: Vec<&MemoryRecord> = cluster.iter().map(|&idx| &memories[idx]).collect();
            let canonical_text = members
                .iter()
                .max_by_key(|m| m.text.len())
                .map(|m| m.text.clone())
                .unwrap_or_default();
            let mut topic_union: Vec<String> = Vec::new();
            for member in &members {
                for topic in &member.topics {
                    if !topic_union.contains(topic) {
                        topic_union.push(topic.clone());
                    }
                }
            }

            let embedding = self.embedder.embed_one(&canonical_text).await?;
            let canonical = MemoryRecord {
                memory_id: fresh_id(),
                user_id: user_id.to_owned(),
                topics: topic_union,
                text: canonical_text,
                source_run_id: None,
                created_at: Utc::now(),
                archived_at: None,
            };
            self.records.insert_memory(&canonical).await?;
            self.vectors
                .upsert(
                    NAMESPACE,
                    vec![VectorPoint::new(&canonical.memory_id, embedding, user_id)],
                )
                .await?;

            let merged_ids: Vec<String> =
                members.iter().map(|m| m.memory_id.clone()).collect();
            self.records
                .archive_memories(&merged_ids, Utc::now())
                .await?;
            self.vectors.remove(NAMESPACE, &merged_ids).await?;

            info!(
                user = user_id,
                merged = merged_ids.len(),
                canonical = %canonical.memory_id,
                "merged near-duplicate memories"
            );
            canonicals.push(canonical);
        }

        Ok(canonicals)
    }
}

/// `|a ∩ b| / |a ∪ b|` over lower-cased alphanumeric tokens.
fn jaccard(a: &str, b: &str) -> f32 {
    let set_a: HashSet<String> = tokenize(a).into_iter().collect();
    let set_b: HashSet<String> = tokenize(b).into_iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f32 / union as f32
}

/// Fraction of the queried topics the memory carries. Zero when no topics
/// were queried.
fn topic_overlap(memory_topics: &[String], queried: &[String]) -> f32 {
    if queried.is_empty() {
        return 0.0;
    }
    let hits = queried.iter().filter(|t| memory_topics.contains(t)).count();
    hits as f32 / queried.len() as f32
}

/// Parses the extraction model's output, tolerating code fences and prose
/// around the JSON array.
fn parse_candidates(text: &str) -> Vec<Candidate> {
    let start = text.find('[');
    let end = text.rfind(']');
    let slice = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => return Vec::new(),
    };
    serde_json::from_str(slice).unwrap_or_default()
}

/// Compacts a run into the transcript handed to the extraction pass.
#[must_use]
pub fn compact_transcript(input: &str, output: &str, member_outputs: &[(String, String)]) -> String {
    const MAX_LEN: usize = 6000;

    let mut transcript = format!("User: {input}\n");
    for (member, text) in member_outputs {
        transcript.push_str(&format!("{member}: {text}\n"));
    }
    transcript.push_str(&format!("Assistant: {output}\n"));

    if transcript.len() > MAX_LEN {
        let mut cut = MAX_LEN;
        while !transcript.is_char_boundary(cut) {
            cut -= 1;
        }
        transcript.truncate(cut);
    }
    transcript
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::llm::mock::{MockBackend, MockTurn};
    use crate::store::{InMemoryVectorStore, SqliteRecordStore};

    const DIM: usize = 128;

    fn subsystem(backend: MockBackend) -> MemorySubsystem {
        MemorySubsystem::new(
            Arc::new(SqliteRecordStore::in_memory().expect("store")),
            Arc::new(InMemoryVectorStore::new(DIM)),
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(backend),
            MemoryConfig::default(),
        )
    }

    fn extraction(json: &str) -> MockBackend {
        MockBackend::new().otherwise(MockTurn::text(json))
    }

    #[tokio::test]
    async fn create_persists_extracted_memories() {
        let memory = subsystem(extraction(
            r#"[{"topics": ["Family"], "text": "Has two kids named Ana and Ben"}]"#,
        ));

        let created = memory
            .create("user-a", Some("run-1"), "User: I have two kids, Ana and Ben.")
            .await
            .expect("create");

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].topics, vec!["family"]);
        assert_eq!(created[0].source_run_id.as_deref(), Some("run-1"));

        let found = memory
            .search("user-a", &[], "kids", 5)
            .await
            .expect("search");
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn create_dedups_near_identical_candidates() {
        let memory = subsystem(extraction(
            r#"[{"topics": ["family"], "text": "Has two kids named Ana and Ben"}]"#,
        ));

        let first = memory
            .create("user-a", None, "transcript one")
            .await
            .expect("create");
        assert_eq!(first.len(), 1);

        // Identical extraction on a later run is dropped.
        let second = memory
            .create("user-a", None, "transcript two")
            .await
            .expect("create");
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn search_applies_structural_topic_filter() {
        let memory = subsystem(extraction(
            r#"[
                {"topics": ["family"], "text": "Has two kids"},
                {"topics": ["work"], "text": "Leads the data platform team"}
            ]"#,
        ));
        memory.create("user-a", None, "t").await.expect("create");

        let family_only = memory
            .search("user-a", &["family".into()], "anything", 10)
            .await
            .expect("search");
        assert_eq!(family_only.len(), 1);
        assert_eq!(family_only[0].memory.topics, vec!["family"]);

        let none = memory
            .search("user-a", &["finance".into()], "anything", 10)
            .await
            .expect("search");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn search_is_isolated_per_user() {
        let memory = subsystem(extraction(
            r#"[{"topics": ["family"], "text": "Has two kids"}]"#,
        ));
        memory.create("user-a", None, "t").await.expect("create");

        let other = memory
            .search("user-b", &["family".into()], "kids", 10)
            .await
            .expect("search");
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn search_rejects_anonymous_callers() {
        let memory = subsystem(MockBackend::new());
        let err = memory
            .search("  ", &[], "anything", 5)
            .await
            .expect_err("must reject");
        assert!(matches!(err, RuntimeError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn optimize_merges_and_archives() {
        let memory = subsystem(extraction(
            r#"[
                {"topics": ["hobbies"], "text": "Enjoys hiking in the mountains"},
                {"topics": ["travel"], "text": "Enjoys hiking in the mountains on weekends"}
            ]"#,
        ));
        // Lower the merge bar so the hash embeddings cluster.
        let memory = MemorySubsystem {
            config: MemoryConfig {
                merge_cosine: 0.75,
                ..MemoryConfig::default()
            },
            ..memory
        };

        memory.create("user-a", None, "t").await.expect("create");
        let canonicals = memory.optimize("user-a").await.expect("optimize");

        assert_eq!(canonicals.len(), 1);
        let canonical = &canonicals[0];
        assert_eq!(canonical.text, "Enjoys hiking in the mountains on weekends");
        assert!(canonical.topics.contains(&"hobbies".to_owned()));
        assert!(canonical.topics.contains(&"travel".to_owned()));

        // Only the canonical memory is retrievable.
        let active = memory.search("user-a", &[], "hiking", 10).await.expect("search");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].memory.memory_id, canonical.memory_id);
    }

    #[test]
    fn jaccard_measures_token_overlap() {
        assert!((jaccard("a b c", "a b c") - 1.0).abs() < 1e-6);
        assert!((jaccard("a b", "a c") - (1.0 / 3.0)).abs() < 1e-6);
        assert!((jaccard("", "") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn parse_candidates_tolerates_fences() {
        let fenced = "```json\n[{\"topics\": [\"work\"], \"text\": \"fact\"}]\n```";
        let parsed = parse_candidates(fenced);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].text, "fact");

        assert!(parse_candidates("no json here").is_empty());
        assert!(parse_candidates("[]").is_empty());
    }

    #[test]
    fn compact_transcript_bounds_length() {
        let long_output = "x".repeat(10_000);
        let transcript = compact_transcript("hi", &long_output, &[]);
        assert!(transcript.len() <= 6000);
        assert!(transcript.starts_with("User: hi"));
    }
}
