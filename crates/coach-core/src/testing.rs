//! Test doubles for the backend traits: a scripted language model and
//! backends that always fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::db::{InMemoryStore, ProfilePatch, ProfileStore, TurnLog, UserProfile};
use crate::llm::{LanguageModel, ToolSpec};
use crate::memory::embeddings::EmbeddingGenerator;
use crate::memory::store::SemanticMemoryIndex;
use crate::memory::types::{ConversationTurn, MemoryCategory, ScoredMemory, SemanticMemoryRecord};
use crate::types::{MemoryError, MemoryResult};

/// Scripted language model. Returns queued replies in order, then
/// `"reply {n}"`. Every context it receives is recorded.
#[derive(Default)]
pub struct MockLanguageModel {
    responses: Mutex<VecDeque<MemoryResult<String>>>,
    contexts: Mutex<Vec<String>>,
    tool_names: Mutex<Vec<Vec<String>>>,
    delay: Option<Duration>,
    always_fail: bool,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.responses.lock().unwrap().push_back(Ok(text.into()));
        self
    }

    pub fn with_error(self, error: MemoryError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn last_context(&self) -> Option<String> {
        self.contexts.lock().unwrap().last().cloned()
    }

    pub fn last_tools(&self) -> Vec<String> {
        self.tool_names.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(&self, context: &str, tools: &[ToolSpec]) -> MemoryResult<String> {
        let call = {
            let mut contexts = self.contexts.lock().unwrap();
            contexts.push(context.to_string());
            contexts.len()
        };
        self.tool_names
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail {
            return Err(MemoryError::LanguageModel("mock model down".to_string()));
        }

        let scripted = self.responses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("reply {}", call)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Embedding backend that is always unreachable
pub struct FailingEmbedder {
    dimension: usize,
    calls: AtomicUsize,
}

impl FailingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingGenerator for FailingEmbedder {
    async fn generate(&self, _text: &str) -> MemoryResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(MemoryError::Embedding("connection refused".to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Vector index that is always unreachable
#[derive(Default)]
pub struct FailingIndex {
    stores: AtomicUsize,
}

impl FailingIndex {
    pub fn store_attempts(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SemanticMemoryIndex for FailingIndex {
    async fn store(&self, _record: &SemanticMemoryRecord) -> MemoryResult<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        Err(MemoryError::IndexUnavailable("connection refused".to_string()))
    }

    async fn query(
        &self,
        _user_id: &str,
        _embedding: &[f32],
        _k: usize,
        _memory_type: Option<MemoryCategory>,
    ) -> MemoryResult<Vec<ScoredMemory>> {
        Err(MemoryError::IndexUnavailable("connection refused".to_string()))
    }

    async fn health_check(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Profile store and turn log that are always unreachable
#[derive(Default)]
pub struct FailingStorage;

#[async_trait]
impl ProfileStore for FailingStorage {
    async fn get(&self, _user_id: &str) -> MemoryResult<Option<UserProfile>> {
        Err(MemoryError::StorageUnavailable("disk on fire".to_string()))
    }

    async fn upsert(&self, _user_id: &str, _patch: &ProfilePatch) -> MemoryResult<UserProfile> {
        Err(MemoryError::StorageUnavailable("disk on fire".to_string()))
    }
}

#[async_trait]
impl TurnLog for FailingStorage {
    async fn append(&self, _turn: &ConversationTurn) -> MemoryResult<()> {
        Err(MemoryError::StorageUnavailable("disk on fire".to_string()))
    }

    async fn query(
        &self,
        _user_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> MemoryResult<Vec<ConversationTurn>> {
        Err(MemoryError::StorageUnavailable("disk on fire".to_string()))
    }

    async fn recent(&self, _user_id: &str, _limit: usize) -> MemoryResult<Vec<ConversationTurn>> {
        Err(MemoryError::StorageUnavailable("disk on fire".to_string()))
    }
}

/// In-memory turn log whose appends take `delay`
pub struct SlowTurnLog {
    inner: InMemoryStore,
    delay: Duration,
}

impl SlowTurnLog {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl TurnLog for SlowTurnLog {
    async fn append(&self, turn: &ConversationTurn) -> MemoryResult<()> {
        tokio::time::sleep(self.delay).await;
        TurnLog::append(&self.inner, turn).await
    }

    async fn query(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> MemoryResult<Vec<ConversationTurn>> {
        TurnLog::query(&self.inner, user_id, since).await
    }

    async fn recent(&self, user_id: &str, limit: usize) -> MemoryResult<Vec<ConversationTurn>> {
        TurnLog::recent(&self.inner, user_id, limit).await
    }
}

/// Profile store and turn log that never answer
#[derive(Default)]
pub struct StalledStorage;

#[async_trait]
impl ProfileStore for StalledStorage {
    async fn get(&self, _user_id: &str) -> MemoryResult<Option<UserProfile>> {
        std::future::pending().await
    }

    async fn upsert(&self, _user_id: &str, _patch: &ProfilePatch) -> MemoryResult<UserProfile> {
        std::future::pending().await
    }
}

#[async_trait]
impl TurnLog for StalledStorage {
    async fn append(&self, _turn: &ConversationTurn) -> MemoryResult<()> {
        std::future::pending().await
    }

    async fn query(
        &self,
        _user_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> MemoryResult<Vec<ConversationTurn>> {
        std::future::pending().await
    }

    async fn recent(&self, _user_id: &str, _limit: usize) -> MemoryResult<Vec<ConversationTurn>> {
        std::future::pending().await
    }
}
