//! ============================================================================
//! Memory Writer - Persists completed turns
//! ============================================================================
//! Each turn goes to two places:
//!
//! 1. the durable `TurnLog` (retried, failure logged at error level)
//! 2. the `SemanticMemoryIndex`, as an embedded `SemanticMemoryRecord`
//!
//! The two writes are independent. An index failure never rolls back or
//! blocks the log write. Index writes can be deferred to a background task
//! and awaited later with `flush`. With a deadline, any write still running
//! when it passes keeps going in the background.
//! ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::classifier::MessageClassifier;
use super::embeddings::{is_sentinel, ResilientEmbedder};
use super::store::SemanticMemoryIndex;
use super::types::{ConversationTurn, SemanticMemoryRecord, TurnMetadata};
use crate::db::{validate_user_id, TurnLog};
use crate::retry::{with_retry, RetryConfig};
use crate::types::{MemoryError, MemoryResult};

/// When the semantic index write happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWriteMode {
    /// Before `persist` returns
    Inline,
    /// On a background task; await with `MemoryWriter::flush`
    Deferred,
}

/// What happened to the index write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWrite {
    Stored,
    /// Embedding unavailable, nothing to index
    Skipped,
    Failed,
    Deferred,
}

/// Outcome of persisting one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistReport {
    /// False when the append failed or was still running at the deadline
    pub logged: bool,
    pub index: IndexWrite,
}

pub struct MemoryWriter {
    turn_log: Arc<dyn TurnLog>,
    index: Arc<dyn SemanticMemoryIndex>,
    embedder: ResilientEmbedder,
    classifier: MessageClassifier,
    retry: RetryConfig,
    pending: Mutex<JoinSet<()>>,
}

impl MemoryWriter {
    pub fn new(
        turn_log: Arc<dyn TurnLog>,
        index: Arc<dyn SemanticMemoryIndex>,
        embedder: ResilientEmbedder,
        retry: RetryConfig,
    ) -> Self {
        Self {
            turn_log,
            index,
            embedder,
            classifier: MessageClassifier::default(),
            retry,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: MessageClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Classify the message and build the turn
    pub fn build_turn(
        &self,
        user_id: &str,
        message: &str,
        response: &str,
        metadata: TurnMetadata,
    ) -> ConversationTurn {
        let mut turn = ConversationTurn::new(
            user_id,
            message,
            response,
            self.classifier.classify(message),
        );
        turn.metadata = metadata;
        turn
    }

    /// Classify, build and persist a turn with an inline index write
    pub async fn record(
        &self,
        user_id: &str,
        message: &str,
        response: &str,
    ) -> MemoryResult<(ConversationTurn, PersistReport)> {
        validate_user_id(user_id)?;
        if message.trim().is_empty() {
            return Err(MemoryError::Validation("message cannot be empty".to_string()));
        }

        let turn = self.build_turn(user_id, message, response, TurnMetadata::new());
        let report = self.persist(&turn, IndexWriteMode::Inline).await;
        Ok((turn, report))
    }

    /// Append to the turn log, then index. Never fails; see the report.
    pub async fn persist(&self, turn: &ConversationTurn, mode: IndexWriteMode) -> PersistReport {
        self.persist_until(turn, mode, None).await
    }

    /// Like `persist`, but returns by `deadline`. Writes that have not
    /// finished by then complete in the background.
    pub async fn persist_until(
        &self,
        turn: &ConversationTurn,
        mode: IndexWriteMode,
        deadline: Option<Instant>,
    ) -> PersistReport {
        let append = tokio::spawn(Self::append_turn(
            self.turn_log.clone(),
            self.retry.clone(),
            turn.clone(),
        ));
        let logged = self
            .finish_by(deadline, "turn log append", append)
            .await
            .unwrap_or(false);

        let task = Self::index_turn(
            self.index.clone(),
            self.embedder.clone(),
            self.retry.clone(),
            turn.clone(),
        );
        let index = match mode {
            IndexWriteMode::Inline => self
                .finish_by(deadline, "index write", tokio::spawn(task))
                .await
                .unwrap_or(IndexWrite::Deferred),
            IndexWriteMode::Deferred => {
                self.spawn_pending(async move {
                    task.await;
                })
                .await;
                IndexWrite::Deferred
            }
        };

        PersistReport { logged, index }
    }

    /// Await `task` until `deadline`. Past it the task is left running and
    /// `flush` waits for it; returns None in that case or if it panicked.
    pub(crate) async fn finish_by<T: Send + 'static>(
        &self,
        deadline: Option<Instant>,
        operation: &str,
        mut task: JoinHandle<T>,
    ) -> Option<T> {
        let joined = match deadline {
            None => task.await,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match timeout(remaining, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            "{} still running at the turn deadline, finishing in background",
                            operation
                        );
                        self.spawn_pending(async move {
                            let _ = task.await;
                        })
                        .await;
                        return None;
                    }
                }
            }
        };

        match joined {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{} task failed: {}", operation, e);
                None
            }
        }
    }

    async fn spawn_pending<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().await;
        while pending.try_join_next().is_some() {}
        pending.spawn(task);
    }

    async fn append_turn(turn_log: Arc<dyn TurnLog>, retry: RetryConfig, turn: ConversationTurn) -> bool {
        let result = with_retry(&retry, "turn_log.append", || {
            let turn_log = turn_log.clone();
            let turn = &turn;
            async move { turn_log.append(turn).await }
        })
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to log turn for user {}: {}", turn.user_id, e);
                false
            }
        }
    }

    async fn index_turn(
        index: Arc<dyn SemanticMemoryIndex>,
        embedder: ResilientEmbedder,
        retry: RetryConfig,
        turn: ConversationTurn,
    ) -> IndexWrite {
        let embedding = embedder.embed(&turn.render()).await;
        if is_sentinel(&embedding) {
            warn!(
                "No embedding for {} turn of user {}, not indexed",
                turn.memory_type, turn.user_id
            );
            return IndexWrite::Skipped;
        }

        let record = SemanticMemoryRecord::from_turn(&turn, embedding);
        let result = with_retry(&retry, "index.store", || {
            let index = index.clone();
            let record = &record;
            async move { index.store(record).await }
        })
        .await;

        match result {
            Ok(()) => {
                debug!("Indexed memory {} for user {}", record.id, record.user_id);
                IndexWrite::Stored
            }
            Err(e) => {
                warn!(
                    "Semantic index {} write failed for user {}: {}",
                    index.name(),
                    record.user_id,
                    e
                );
                IndexWrite::Failed
            }
        }
    }

    /// Await every deferred or overdue write. Returns how many completed.
    pub async fn flush(&self) -> usize {
        let mut drained = std::mem::take(&mut *self.pending.lock().await);
        let mut completed = 0;
        while let Some(result) = drained.join_next().await {
            match result {
                Ok(_) => completed += 1,
                Err(e) => warn!("Deferred index write task failed: {}", e),
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;
    use crate::memory::embeddings::HashingEmbedder;
    use crate::memory::store::InMemoryVectorIndex;
    use crate::memory::types::MemoryCategory;
    use crate::testing::{FailingEmbedder, FailingIndex, FailingStorage, SlowTurnLog};
    use std::time::Duration;

    const DIM: usize = 64;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            attempt_timeout_ms: 200,
            jitter: false,
        }
    }

    fn hashing() -> ResilientEmbedder {
        ResilientEmbedder::new(Arc::new(HashingEmbedder::new(DIM)), fast_retry())
    }

    #[tokio::test]
    async fn test_record_logs_and_indexes() {
        let log = Arc::new(InMemoryStore::new());
        let index = Arc::new(InMemoryVectorIndex::new(DIM));
        let writer = MemoryWriter::new(log.clone(), index.clone(), hashing(), fast_retry());

        let (turn, report) = writer
            .record("u1", "I ate chicken for lunch", "Great protein choice")
            .await
            .unwrap();

        assert_eq!(turn.memory_type, MemoryCategory::MealLog);
        assert_eq!(report, PersistReport { logged: true, index: IndexWrite::Stored });
        assert_eq!(TurnLog::query(log.as_ref(), "u1", None).await.unwrap(), vec![turn]);
        assert_eq!(index.len_for("u1").await, 1);
    }

    #[tokio::test]
    async fn test_index_failure_keeps_log_entry() {
        let log = Arc::new(InMemoryStore::new());
        let index = Arc::new(FailingIndex::default());
        let writer = MemoryWriter::new(log.clone(), index.clone(), hashing(), fast_retry());

        let (_, report) = writer.record("u1", "hello", "hi!").await.unwrap();

        assert!(report.logged);
        assert_eq!(report.index, IndexWrite::Failed);
        assert_eq!(index.store_attempts(), 2);
        assert_eq!(TurnLog::query(log.as_ref(), "u1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_log_failure_still_indexes() {
        let index = Arc::new(InMemoryVectorIndex::new(DIM));
        let writer = MemoryWriter::new(Arc::new(FailingStorage), index.clone(), hashing(), fast_retry());

        let (_, report) = writer.record("u1", "I feel tired", "rest up").await.unwrap();
        assert!(!report.logged);
        assert_eq!(report.index, IndexWrite::Stored);
        assert_eq!(index.len_for("u1").await, 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_skips_index() {
        let log = Arc::new(InMemoryStore::new());
        let index = Arc::new(InMemoryVectorIndex::new(DIM));
        let failing = Arc::new(FailingEmbedder::new(DIM));
        let embedder = ResilientEmbedder::new(failing.clone(), fast_retry());
        let writer = MemoryWriter::new(log.clone(), index.clone(), embedder, fast_retry());

        let (_, report) = writer.record("u1", "hi", "hello").await.unwrap();
        assert!(report.logged);
        assert_eq!(report.index, IndexWrite::Skipped);
        assert_eq!(index.len_for("u1").await, 0);
        assert_eq!(failing.calls(), 2);
    }

    #[tokio::test]
    async fn test_deferred_writes_complete_on_flush() {
        let log = Arc::new(InMemoryStore::new());
        let index = Arc::new(InMemoryVectorIndex::new(DIM));
        let writer = MemoryWriter::new(log.clone(), index.clone(), hashing(), fast_retry());

        for i in 0..3 {
            let turn = writer.build_turn("u1", &format!("message {}", i), "ok", TurnMetadata::new());
            let report = writer.persist(&turn, IndexWriteMode::Deferred).await;
            assert!(report.logged);
            assert_eq!(report.index, IndexWrite::Deferred);
        }

        writer.flush().await;
        assert_eq!(index.len_for("u1").await, 3);
        assert_eq!(writer.flush().await, 0);
    }

    #[tokio::test]
    async fn test_overdue_append_finishes_in_background() {
        let log = Arc::new(SlowTurnLog::new(Duration::from_millis(150)));
        let index = Arc::new(InMemoryVectorIndex::new(DIM));
        let writer = MemoryWriter::new(log.clone(), index.clone(), hashing(), fast_retry());
        let turn = writer.build_turn("u1", "late lunch", "ok", TurnMetadata::new());

        let started = Instant::now();
        let deadline = started + Duration::from_millis(30);
        let report = writer
            .persist_until(&turn, IndexWriteMode::Inline, Some(deadline))
            .await;
        assert!(started.elapsed() < Duration::from_millis(140));
        assert!(!report.logged);

        assert!(writer.flush().await >= 1);
        assert_eq!(TurnLog::query(log.as_ref(), "u1", None).await.unwrap(), vec![turn]);
        assert_eq!(index.len_for("u1").await, 1);
    }

    #[tokio::test]
    async fn test_record_validates_input() {
        let writer = MemoryWriter::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryVectorIndex::new(DIM)),
            hashing(),
            fast_retry(),
        );
        assert!(matches!(
            writer.record("", "hi", "hello").await,
            Err(MemoryError::Validation(_))
        ));
        assert!(matches!(
            writer.record("u1", "   ", "hello").await,
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn test_build_turn_carries_metadata() {
        let writer = MemoryWriter::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryVectorIndex::new(DIM)),
            hashing(),
            fast_retry(),
        );
        let mut metadata = TurnMetadata::new();
        metadata.insert("retrieval".to_string(), "keyword".to_string());

        let turn = writer.build_turn("u1", "I want to lose weight", "Let's plan", metadata);
        assert_eq!(turn.memory_type, MemoryCategory::GoalCheck);
        assert_eq!(turn.metadata.get("retrieval").map(String::as_str), Some("keyword"));
    }
}
