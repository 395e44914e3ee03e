//! ============================================================================
//! Memory Store - Semantic memory index backends
//! ============================================================================
//! Stores rendered turns as vectors and answers per-user k-NN queries.
//!
//! - `QdrantMemoryIndex`: Qdrant collection with cosine distance and
//!   payload filters on `user_id` / `memory_type`
//! - `InMemoryVectorIndex`: linear cosine scan over per-user partitions
//! - `DisabledIndex`: no vector backend; every call is `IndexUnavailable`
//!
//! Zero vectors (the embedding failure sentinel) never rank.
//! ============================================================================

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, Condition, CreateCollectionBuilder, Distance, Filter, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::embeddings::is_sentinel;
use super::types::{MemoryCategory, ScoredMemory, SemanticMemoryRecord, TurnMetadata};
use crate::types::{MemoryError, MemoryResult};

/// Default Qdrant collection name
pub const COLLECTION_NAME: &str = "coach_memories";

/// Vector store with per-user filtered similarity search
#[async_trait]
pub trait SemanticMemoryIndex: Send + Sync {
    async fn store(&self, record: &SemanticMemoryRecord) -> MemoryResult<()>;

    /// Top `k` records of `user_id` by cosine similarity, best first,
    /// optionally restricted to one category
    async fn query(
        &self,
        user_id: &str,
        embedding: &[f32],
        k: usize,
        memory_type: Option<MemoryCategory>,
    ) -> MemoryResult<Vec<ScoredMemory>>;

    async fn health_check(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Cosine similarity; 0.0 for mismatched, empty or zero-norm input
pub fn cosine_similarity(v1: &[f32], v2: &[f32]) -> f32 {
    if v1.len() != v2.len() || v1.is_empty() {
        return 0.0;
    }
    let dot_product: f32 = v1.iter().zip(v2).map(|(a, b)| a * b).sum();
    let mag1: f32 = v1.iter().map(|a| a * a).sum::<f32>().sqrt();
    let mag2: f32 = v2.iter().map(|a| a * a).sum::<f32>().sqrt();
    if mag1 == 0.0 || mag2 == 0.0 {
        return 0.0;
    }
    dot_product / (mag1 * mag2)
}

fn check_storable(record: &SemanticMemoryRecord, dimension: usize) -> MemoryResult<()> {
    if record.embedding.is_empty() || is_sentinel(&record.embedding) {
        return Err(MemoryError::Validation(
            "Cannot index a memory without a real embedding".to_string(),
        ));
    }
    if record.embedding.len() != dimension {
        return Err(MemoryError::Validation(format!(
            "Embedding has {} dimensions, index expects {}",
            record.embedding.len(),
            dimension
        )));
    }
    Ok(())
}

// ============================================================================
// Qdrant
// ============================================================================

/// Semantic index backed by a Qdrant collection
pub struct QdrantMemoryIndex {
    client: Qdrant,
    url: String,
    collection: String,
    dimension: usize,
    collection_ready: OnceCell<()>,
}

impl QdrantMemoryIndex {
    /// Build the client. The collection is created lazily on first use.
    pub fn new(url: &str, collection: &str, dimension: usize) -> MemoryResult<Self> {
        debug!("Configuring Qdrant at {} (collection {})", url, collection);

        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| MemoryError::Configuration(format!("Failed to create Qdrant client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
            collection: collection.to_string(),
            dimension,
            collection_ready: OnceCell::new(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Ensure the memories collection exists
    async fn ensure_collection(&self) -> MemoryResult<()> {
        self.collection_ready
            .get_or_try_init(|| async {
                let exists = self
                    .client
                    .collection_exists(&self.collection)
                    .await
                    .map_err(|e| MemoryError::index("Failed to check collection existence", e))?;

                if !exists {
                    info!("Creating collection: {}", self.collection);
                    self.client
                        .create_collection(
                            CreateCollectionBuilder::new(&self.collection).vectors_config(
                                VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine),
                            ),
                        )
                        .await
                        .map_err(|e| MemoryError::index("Failed to create collection", e))?;
                    info!("Collection {} created successfully", self.collection);
                } else {
                    debug!("Collection {} already exists", self.collection);
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn filter_for(user_id: &str, memory_type: Option<MemoryCategory>) -> Filter {
        let mut conditions = vec![Condition::matches("user_id", user_id.to_string())];
        if let Some(category) = memory_type {
            conditions.push(Condition::matches("memory_type", category.as_str().to_string()));
        }
        Filter::must(conditions)
    }
}

#[async_trait]
impl SemanticMemoryIndex for QdrantMemoryIndex {
    async fn store(&self, record: &SemanticMemoryRecord) -> MemoryResult<()> {
        check_storable(record, self.dimension)?;
        self.ensure_collection().await?;

        debug!("Storing memory {} for user {}", record.id, record.user_id);

        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| MemoryError::Serialization(format!("memory metadata: {}", e)))?;

        let payload: HashMap<String, Value> = [
            ("user_id".to_string(), Value::from(record.user_id.clone())),
            ("text".to_string(), Value::from(record.text.clone())),
            (
                "memory_type".to_string(),
                Value::from(record.memory_type.as_str().to_string()),
            ),
            (
                "timestamp".to_string(),
                Value::from(record.timestamp.timestamp_micros()),
            ),
            ("metadata".to_string(), Value::from(metadata)),
        ]
        .into_iter()
        .collect();

        let point = PointStruct::new(record.id.to_string(), record.embedding.clone(), payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]))
            .await
            .map_err(|e| MemoryError::index("Failed to upsert memory", e))?;

        debug!("Memory {} stored successfully", record.id);
        Ok(())
    }

    async fn query(
        &self,
        user_id: &str,
        embedding: &[f32],
        k: usize,
        memory_type: Option<MemoryCategory>,
    ) -> MemoryResult<Vec<ScoredMemory>> {
        if k == 0 || is_sentinel(embedding) {
            return Ok(vec![]);
        }
        self.ensure_collection().await?;

        debug!("Searching memories for user {} (limit: {})", user_id, k);

        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, embedding.to_vec(), k as u64)
                    .filter(Self::filter_for(user_id, memory_type))
                    .with_payload(true),
            )
            .await
            .map_err(|e| MemoryError::index("Failed to search memories", e))?;

        let memories: Vec<ScoredMemory> = search_result
            .result
            .into_iter()
            .filter_map(|point| {
                let id = extract_uuid_from_point_id(point.id?)?;
                let payload = point.payload;
                let record = SemanticMemoryRecord {
                    id,
                    user_id: get_string(&payload, "user_id")?,
                    text: get_string(&payload, "text")?,
                    embedding: vec![],
                    memory_type: get_string(&payload, "memory_type")?
                        .parse()
                        .unwrap_or(MemoryCategory::Casual),
                    timestamp: get_i64(&payload, "timestamp")
                        .and_then(chrono::DateTime::from_timestamp_micros)?,
                    metadata: get_string(&payload, "metadata")
                        .and_then(|raw| serde_json::from_str::<TurnMetadata>(&raw).ok())
                        .unwrap_or_default(),
                };
                Some(ScoredMemory {
                    record,
                    score: point.score,
                })
            })
            .filter(|m| m.record.user_id == user_id)
            .collect();

        debug!("Found {} matching memories", memories.len());
        Ok(memories)
    }

    async fn health_check(&self) -> bool {
        match self.client.health_check().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Qdrant health check failed ({}): {}", self.url, e);
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "qdrant"
    }
}

// Helper to extract UUID from PointId
fn extract_uuid_from_point_id(point_id: qdrant_client::qdrant::PointId) -> Option<Uuid> {
    match point_id.point_id_options? {
        PointIdOptions::Uuid(uuid_str) => Uuid::parse_str(&uuid_str).ok(),
        PointIdOptions::Num(_) => None,
    }
}

fn get_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str().map(|s| s.to_string()))
}

fn get_i64(payload: &HashMap<String, Value>, key: &str) -> Option<i64> {
    payload.get(key).and_then(|v| v.as_integer())
}

// ============================================================================
// In-process
// ============================================================================

/// Linear-scan cosine index partitioned by user
pub struct InMemoryVectorIndex {
    dimension: usize,
    partitions: RwLock<HashMap<String, Vec<SemanticMemoryRecord>>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records held for `user_id`
    pub async fn len_for(&self, user_id: &str) -> usize {
        self.partitions
            .read()
            .await
            .get(user_id)
            .map(|records| records.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SemanticMemoryIndex for InMemoryVectorIndex {
    async fn store(&self, record: &SemanticMemoryRecord) -> MemoryResult<()> {
        check_storable(record, self.dimension)?;
        self.partitions
            .write()
            .await
            .entry(record.user_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn query(
        &self,
        user_id: &str,
        embedding: &[f32],
        k: usize,
        memory_type: Option<MemoryCategory>,
    ) -> MemoryResult<Vec<ScoredMemory>> {
        if k == 0 || is_sentinel(embedding) {
            return Ok(vec![]);
        }

        let partitions = self.partitions.read().await;
        let Some(records) = partitions.get(user_id) else {
            return Ok(vec![]);
        };

        let mut results: Vec<ScoredMemory> = records
            .iter()
            .filter(|r| memory_type.map_or(true, |category| r.memory_type == category))
            .filter(|r| !is_sentinel(&r.embedding))
            .map(|r| {
                let score = cosine_similarity(embedding, &r.embedding);
                let mut record = r.clone();
                record.embedding = vec![];
                ScoredMemory { record, score }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.record.timestamp.cmp(&a.record.timestamp))
        });
        results.truncate(k);
        Ok(results)
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Disabled
// ============================================================================

/// Stand-in when no vector backend is configured
#[derive(Debug, Default)]
pub struct DisabledIndex;

#[async_trait]
impl SemanticMemoryIndex for DisabledIndex {
    async fn store(&self, _record: &SemanticMemoryRecord) -> MemoryResult<()> {
        Err(MemoryError::IndexUnavailable("semantic index disabled".to_string()))
    }

    async fn query(
        &self,
        _user_id: &str,
        _embedding: &[f32],
        _k: usize,
        _memory_type: Option<MemoryCategory>,
    ) -> MemoryResult<Vec<ScoredMemory>> {
        Err(MemoryError::IndexUnavailable("semantic index disabled".to_string()))
    }

    async fn health_check(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::ConversationTurn;
    use chrono::{Duration, Utc};

    fn record(user_id: &str, message: &str, category: MemoryCategory, embedding: Vec<f32>) -> SemanticMemoryRecord {
        let turn = ConversationTurn::new(user_id, message, "ok", category);
        SemanticMemoryRecord::from_turn(&turn, embedding)
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_in_memory_ranks_by_similarity() {
        let index = InMemoryVectorIndex::new(3);
        index
            .store(&record("u1", "far", MemoryCategory::Casual, vec![0.0, 0.0, 1.0]))
            .await
            .unwrap();
        index
            .store(&record("u1", "close", MemoryCategory::Casual, vec![1.0, 0.1, 0.0]))
            .await
            .unwrap();
        index
            .store(&record("u1", "middle", MemoryCategory::Casual, vec![1.0, 1.0, 0.0]))
            .await
            .unwrap();

        let results = index.query("u1", &[1.0, 0.0, 0.0], 2, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].record.text.contains("close"));
        assert!(results[1].record.text.contains("middle"));
        assert!(results[0].score >= results[1].score);
        assert!(results[0].record.embedding.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_user_isolation() {
        let index = InMemoryVectorIndex::new(2);
        index
            .store(&record("alice", "alice secret", MemoryCategory::Mood, vec![1.0, 0.0]))
            .await
            .unwrap();
        index
            .store(&record("bob", "bob note", MemoryCategory::Mood, vec![1.0, 0.0]))
            .await
            .unwrap();

        let results = index.query("bob", &[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.user_id, "bob");
        assert!(index.query("carol", &[1.0, 0.0], 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_category_filter() {
        let index = InMemoryVectorIndex::new(2);
        index
            .store(&record("u1", "oats", MemoryCategory::MealLog, vec![1.0, 0.0]))
            .await
            .unwrap();
        index
            .store(&record("u1", "tired", MemoryCategory::Mood, vec![1.0, 0.0]))
            .await
            .unwrap();

        let meals = index
            .query("u1", &[1.0, 0.0], 10, Some(MemoryCategory::MealLog))
            .await
            .unwrap();
        assert_eq!(meals.len(), 1);
        assert_eq!(meals[0].record.memory_type, MemoryCategory::MealLog);
    }

    #[tokio::test]
    async fn test_zero_vectors_never_rank() {
        let index = InMemoryVectorIndex::new(2);
        assert!(matches!(
            index
                .store(&record("u1", "sentinel", MemoryCategory::Casual, vec![0.0, 0.0]))
                .await,
            Err(MemoryError::Validation(_))
        ));
        assert!(matches!(
            index
                .store(&record("u1", "wrong dims", MemoryCategory::Casual, vec![1.0, 0.0, 0.0]))
                .await,
            Err(MemoryError::Validation(_))
        ));
        index
            .store(&record("u1", "real", MemoryCategory::Casual, vec![0.0, 1.0]))
            .await
            .unwrap();

        assert!(index.query("u1", &[0.0, 0.0], 5, None).await.unwrap().is_empty());
        assert_eq!(index.len_for("u1").await, 1);
    }

    #[tokio::test]
    async fn test_equal_scores_prefer_recent() {
        let index = InMemoryVectorIndex::new(2);
        let mut old = record("u1", "old", MemoryCategory::Casual, vec![1.0, 0.0]);
        old.timestamp = Utc::now() - Duration::days(3);
        let new = record("u1", "new", MemoryCategory::Casual, vec![1.0, 0.0]);
        index.store(&old).await.unwrap();
        index.store(&new).await.unwrap();

        let results = index.query("u1", &[1.0, 0.0], 2, None).await.unwrap();
        assert!(results[0].record.text.contains("new"));
    }

    #[tokio::test]
    async fn test_disabled_index_is_unavailable() {
        let index = DisabledIndex;
        assert!(!index.health_check().await);
        assert!(matches!(
            index.query("u1", &[1.0], 3, None).await,
            Err(MemoryError::IndexUnavailable(_))
        ));
        assert!(matches!(
            index
                .store(&record("u1", "x", MemoryCategory::Casual, vec![1.0]))
                .await,
            Err(MemoryError::IndexUnavailable(_))
        ));
    }

    // Integration tests require a running Qdrant instance
    // These are marked as ignored by default

    #[tokio::test]
    #[ignore]
    async fn test_qdrant_store_and_search() {
        let index = QdrantMemoryIndex::new("http://localhost:6334", "coach_memories_test", 8).unwrap();
        assert!(index.health_check().await);

        let user = format!("test_user_{}", Uuid::new_v4());
        let mut memory = record(&user, "Test memory content", MemoryCategory::MealLog, vec![0.1; 8]);
        memory.metadata.insert("source".to_string(), "test".to_string());
        index.store(&memory).await.unwrap();

        let results = index.query(&user, &[0.1; 8], 10, None).await.unwrap();
        assert!(!results.is_empty());
        assert!(results[0].record.text.contains("Test memory content"));
        assert_eq!(results[0].record.metadata.get("source").map(String::as_str), Some("test"));

        let filtered = index
            .query(&user, &[0.1; 8], 10, Some(MemoryCategory::Mood))
            .await
            .unwrap();
        assert!(filtered.is_empty());
    }
}
