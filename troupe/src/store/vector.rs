//! Vector storage seam and the bundled in-process index.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::VectorError;
use crate::embedding::cosine;

/// An embedded point with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    /// Point identifier (memory id, chunk id, ...).
    pub id: String,
    /// The embedding, of the index's fixed dimension.
    pub vector: Vec<f32>,
    /// Flat string metadata used for filtering.
    pub metadata: HashMap<String, String>,
}

impl VectorPoint {
    /// Creates a point owned by `user_id`.
    #[must_use]
    pub fn new(id: impl Into<String>, vector: Vec<f32>, user_id: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_owned(), user_id.to_owned());
        Self {
            id: id.into(),
            vector,
            metadata,
        }
    }

    /// Attaches an extra metadata field.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A similarity search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    /// Matched point id.
    pub id: String,
    /// Cosine similarity to the query.
    pub score: f32,
    /// The point's metadata.
    pub metadata: HashMap<String, String>,
}

/// A metadata filter that always carries a user scope.
///
/// There is intentionally no way to construct a filter without a
/// `user_id` — per-user isolation is unrepresentable to violate at this
/// layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataFilter {
    user_id: String,
    equals: Vec<(String, String)>,
}

impl MetadataFilter {
    /// Creates a filter scoped to `user_id`.
    #[must_use]
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            equals: Vec::new(),
        }
    }

    /// Adds an equality constraint.
    #[must_use]
    pub fn and_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    /// The user scope of this filter.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        if metadata.get("user_id").map(String::as_str) != Some(self.user_id.as_str()) {
            return false;
        }
        self.equals
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// Approximate-nearest-neighbor storage seam.
///
/// Namespaces separate collections (`"memories"`, `"knowledge"`). Every
/// search carries a [`MetadataFilter`], which always includes the user.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The fixed dimensionality of stored vectors.
    fn dimension(&self) -> usize;

    /// Inserts or replaces points.
    async fn upsert(
        &self,
        namespace: &str,
        points: Vec<VectorPoint>,
    ) -> Result<(), VectorError>;

    /// Fetches points by id; missing ids are silently skipped.
    async fn fetch(&self, namespace: &str, ids: &[String]) -> Result<Vec<VectorPoint>, VectorError>;

    /// Returns the `k` most similar points passing the filter, best first.
    async fn search(
        &self,
        namespace: &str,
        query: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>, VectorError>;

    /// Removes points by id.
    async fn remove(&self, namespace: &str, ids: &[String]) -> Result<(), VectorError>;
}

/// Bundled in-process index: exact cosine scan over a hash map.
///
/// Suitable for tests, the CLI, and modest per-user corpora; a server
/// deployment swaps in a real ANN engine behind the same trait.
#[derive(Debug)]
pub struct InMemoryVectorStore {
    dimension: usize,
    namespaces: RwLock<HashMap<String, HashMap<String, VectorPoint>>>,
}

impl InMemoryVectorStore {
    /// Creates an empty index for vectors of length `dimension`.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.dimension {
            return Err(VectorError::Dimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(
        &self,
        namespace: &str,
        points: Vec<VectorPoint>,
    ) -> Result<(), VectorError> {
        for point in &points {
            self.check_dimension(&point.vector)?;
        }
        let mut namespaces = self
            .namespaces
            .write()
            .map_err(|e| VectorError::Upstream(e.to_string()))?;
        let space = namespaces.entry(namespace.to_owned()).or_default();
        for point in points {
            space.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn fetch(
        &self,
        namespace: &str,
        ids: &[String],
    ) -> Result<Vec<VectorPoint>, VectorError> {
        let namespaces = self
            .namespaces
            .read()
            .map_err(|e| VectorError::Upstream(e.to_string()))?;
        let Some(space) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| space.get(id).cloned()).collect())
    }

    async fn search(
        &self,
        namespace: &str,
        query: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>, VectorError> {
        self.check_dimension(query)?;
        let namespaces = self
            .namespaces
            .read()
            .map_err(|e| VectorError::Upstream(e.to_string()))?;
        let Some(space) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = space
            .values()
            .filter(|point| filter.matches(&point.metadata))
            .map(|point| VectorMatch {
                id: point.id.clone(),
                score: cosine(query, &point.vector),
                metadata: point.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(k);
        Ok(matches)
    }

    async fn remove(&self, namespace: &str, ids: &[String]) -> Result<(), VectorError> {
        let mut namespaces = self
            .namespaces
            .write()
            .map_err(|e| VectorError::Upstream(e.to_string()))?;
        if let Some(space) = namespaces.get_mut(namespace) {
            for id in ids {
                space.remove(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[tokio::test]
    async fn upsert_rejects_wrong_dimension() {
        let store = InMemoryVectorStore::new(4);
        let err = store
            .upsert("memories", vec![VectorPoint::new("p1", vec![1.0], "u1")])
            .await
            .expect_err("must reject");
        assert!(matches!(err, VectorError::Dimension { expected: 4, actual: 1 }));
    }

    #[tokio::test]
    async fn search_is_scoped_to_the_filtered_user() {
        let store = InMemoryVectorStore::new(4);
        store
            .upsert(
                "memories",
                vec![
                    VectorPoint::new("a-mem", unit(4, 0), "user-a"),
                    VectorPoint::new("b-mem", unit(4, 0), "user-b"),
                ],
            )
            .await
            .expect("upsert");

        let hits = store
            .search("memories", &unit(4, 0), 10, &MetadataFilter::for_user("user-a"))
            .await
            .expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a-mem");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_and_truncates() {
        let store = InMemoryVectorStore::new(2);
        store
            .upsert(
                "knowledge",
                vec![
                    VectorPoint::new("exact", vec![1.0, 0.0], "u"),
                    VectorPoint::new("near", vec![0.9, 0.1], "u"),
                    VectorPoint::new("far", vec![0.0, 1.0], "u"),
                ],
            )
            .await
            .expect("upsert");

        let hits = store
            .search("knowledge", &[1.0, 0.0], 2, &MetadataFilter::for_user("u"))
            .await
            .expect("search");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "exact");
        assert_eq!(hits[1].id, "near");
    }

    #[tokio::test]
    async fn extra_equality_constraints_apply() {
        let store = InMemoryVectorStore::new(2);
        store
            .upsert(
                "knowledge",
                vec![
                    VectorPoint::new("c1", vec![1.0, 0.0], "u").with_meta("doc_id", "d1"),
                    VectorPoint::new("c2", vec![1.0, 0.0], "u").with_meta("doc_id", "d2"),
                ],
            )
            .await
            .expect("upsert");

        let filter = MetadataFilter::for_user("u").and_eq("doc_id", "d2");
        let hits = store
            .search("knowledge", &[1.0, 0.0], 10, &filter)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c2");
    }

    #[tokio::test]
    async fn fetch_and_remove_roundtrip() {
        let store = InMemoryVectorStore::new(2);
        store
            .upsert("memories", vec![VectorPoint::new("m1", vec![1.0, 0.0], "u")])
            .await
            .expect("upsert");

        let fetched = store
            .fetch("memories", &["m1".to_owned(), "missing".to_owned()])
            .await
            .expect("fetch");
        assert_eq!(fetched.len(), 1);

        store
            .remove("memories", &["m1".to_owned()])
            .await
            .expect("remove");
        assert!(
            store
                .fetch("memories", &["m1".to_owned()])
                .await
                .expect("fetch")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn missing_namespace_searches_empty() {
        let store = InMemoryVectorStore::new(2);
        let hits = store
            .search("nothing", &[1.0, 0.0], 5, &MetadataFilter::for_user("u"))
            .await
            .expect("search");
        assert!(hits.is_empty());
    }
}
