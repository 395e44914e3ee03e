//! ============================================================================
//! Memory Coordinator - The per-turn entry point
//! ============================================================================
//! `process_turn(user_id, message)` is the only call the dispatch layer
//! makes:
//!
//! ```text
//! validate -> lock user session -> assemble context -> language model
//!          -> append to window -> MemoryWriter -> touch profile
//! ```
//!
//! Same-user turns are serialized by the session mutex; different users
//! only share the brief session-map lookup. Every backend degrades instead
//! of failing the turn, so a valid message always gets a non-empty reply.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::context::{AssembledContext, ContextAssembler, RecalledMemory, RetrievalSource};
use super::embeddings::{create_embedding_service, EmbeddingGenerator, HashingEmbedder, ResilientEmbedder};
use super::store::{DisabledIndex, InMemoryVectorIndex, QdrantMemoryIndex, SemanticMemoryIndex};
use super::types::{ConversationTurn, MemoryCategory, TurnMetadata};
use super::window::ConversationWindow;
use super::writer::{IndexWriteMode, MemoryWriter, PersistReport};
use crate::config::{CoachConfig, IndexBackend, StorageBackend};
use crate::db::{validate_user_id, CoachDb, InMemoryStore, ProfilePatch, ProfileStore, TurnLog, UserProfile};
use crate::llm::{default_tools, LanguageModel, ToolSpec, FALLBACK_REPLY};
use crate::retry::{with_retry, RetryConfig};
use crate::types::{MemoryError, MemoryResult};

/// User id queried by `health`
const HEALTH_CHECK_USER: &str = "__health__";

/// The storage and retrieval backends, selected once at construction
#[derive(Clone)]
pub struct MemoryBackends {
    pub profiles: Arc<dyn ProfileStore>,
    pub turn_log: Arc<dyn TurnLog>,
    pub index: Arc<dyn SemanticMemoryIndex>,
    pub embedder: Arc<dyn EmbeddingGenerator>,
}

impl MemoryBackends {
    /// Construct the backends named by `config`
    pub fn from_config(config: &CoachConfig) -> MemoryResult<Self> {
        let (profiles, turn_log): (Arc<dyn ProfileStore>, Arc<dyn TurnLog>) = match config.storage {
            StorageBackend::Redb => {
                let db = Arc::new(CoachDb::open(config.db_path.as_deref())?);
                (db.clone() as Arc<dyn ProfileStore>, db as Arc<dyn TurnLog>)
            }
            StorageBackend::Memory => {
                let store = Arc::new(InMemoryStore::new());
                (store.clone() as Arc<dyn ProfileStore>, store as Arc<dyn TurnLog>)
            }
        };

        let index: Arc<dyn SemanticMemoryIndex> = match config.index {
            IndexBackend::Qdrant => Arc::new(QdrantMemoryIndex::new(
                &config.qdrant_url,
                &config.collection,
                config.embedding_dim,
            )?),
            IndexBackend::Memory => Arc::new(InMemoryVectorIndex::new(config.embedding_dim)),
            IndexBackend::None => Arc::new(DisabledIndex),
        };

        let embedder = create_embedding_service(
            config.embeddings.as_str(),
            config.openai_api_key.clone(),
            Some(config.embedding_base_url.clone()),
            Some(config.embedding_model.clone()),
            config.embedding_dim,
            config.backend_timeout(),
        )?;

        info!(
            "Memory backends: storage={:?}, index={}, embeddings={}",
            config.storage,
            index.name(),
            embedder.name()
        );

        Ok(Self {
            profiles,
            turn_log,
            index,
            embedder,
        })
    }

    /// Everything in process, hashing embeddings
    pub fn in_memory(embedding_dim: usize) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            profiles: store.clone(),
            turn_log: store,
            index: Arc::new(InMemoryVectorIndex::new(embedding_dim)),
            embedder: Arc::new(HashingEmbedder::new(embedding_dim)),
        }
    }
}

/// Per-user in-process state
#[derive(Debug)]
pub struct UserSession {
    pub window: ConversationWindow,
}

struct SessionEntry {
    session: Arc<Mutex<UserSession>>,
    /// Milliseconds since the coordinator started
    last_seen: AtomicU64,
}

/// Result of one turn with the details `process_turn` hides
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: String,
    /// None when the input was rejected
    pub turn: Option<ConversationTurn>,
    pub retrieval: RetrievalSource,
    pub persisted: Option<PersistReport>,
    /// The best-effort reply was used
    pub degraded: bool,
}

impl TurnOutcome {
    fn rejected() -> Self {
        Self {
            response: String::new(),
            turn: None,
            retrieval: RetrievalSource::None,
            persisted: None,
            degraded: false,
        }
    }
}

/// Reachability of each backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub index_backend: String,
    pub index: bool,
    pub profiles: bool,
    pub turn_log: bool,
    pub embeddings_backend: String,
    pub language_model: String,
    pub active_sessions: usize,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.index && self.profiles && self.turn_log
    }
}

pub struct MemoryCoordinator {
    profiles: Arc<dyn ProfileStore>,
    turn_log: Arc<dyn TurnLog>,
    index: Arc<dyn SemanticMemoryIndex>,
    embedder_name: String,
    assembler: ContextAssembler,
    writer: MemoryWriter,
    model: Arc<dyn LanguageModel>,
    tools: Vec<ToolSpec>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    started: Instant,
    window_capacity: usize,
    max_sessions: usize,
    turn_deadline: Duration,
    backend_retry: RetryConfig,
    llm_retry: RetryConfig,
    index_mode: IndexWriteMode,
}

impl MemoryCoordinator {
    pub fn new(backends: MemoryBackends, model: Arc<dyn LanguageModel>, config: &CoachConfig) -> Self {
        let backend_retry = config.backend_retry();
        let embedder = ResilientEmbedder::new(backends.embedder.clone(), backend_retry.clone());

        let assembler = ContextAssembler::new(
            backends.profiles.clone(),
            backends.turn_log.clone(),
            backends.index.clone(),
            embedder.clone(),
            backend_retry.clone(),
        )
        .with_memory_k(config.memory_k)
        .with_fallback_candidates(config.fallback_candidates);

        let writer = MemoryWriter::new(
            backends.turn_log.clone(),
            backends.index.clone(),
            embedder,
            backend_retry.clone(),
        );

        Self {
            profiles: backends.profiles,
            turn_log: backends.turn_log,
            index: backends.index,
            embedder_name: backends.embedder.name().to_string(),
            assembler,
            writer,
            model,
            tools: default_tools(),
            sessions: RwLock::new(HashMap::new()),
            started: Instant::now(),
            window_capacity: config.window_capacity,
            max_sessions: config.max_sessions.max(1),
            turn_deadline: config.turn_deadline(),
            backend_retry,
            llm_retry: config.llm_retry(),
            index_mode: if config.defer_index_writes {
                IndexWriteMode::Deferred
            } else {
                IndexWriteMode::Inline
            },
        }
    }

    /// Build backends from `config` and wire them up
    pub fn from_config(config: &CoachConfig, model: Arc<dyn LanguageModel>) -> MemoryResult<Self> {
        Ok(Self::new(MemoryBackends::from_config(config)?, model, config))
    }

    /// Replace the tools advertised to the model
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    // ========================================================================
    // Turn processing
    // ========================================================================

    /// Answer `message` for `user_id`. Empty input is a no-op returning "".
    pub async fn process_turn(&self, user_id: &str, message: &str) -> String {
        self.process_turn_detailed(user_id, message).await.response
    }

    pub async fn process_turn_detailed(&self, user_id: &str, message: &str) -> TurnOutcome {
        if message.trim().is_empty() || validate_user_id(user_id).is_err() {
            debug!("Ignoring empty or invalid turn for user {:?}", user_id);
            return TurnOutcome::rejected();
        }

        let deadline = Instant::now() + self.turn_deadline;
        let session = self.session(user_id).await;
        let mut session = session.lock().await;
        let window = session.window.snapshot();

        let answered = timeout(deadline.saturating_duration_since(Instant::now()), async {
            let context = self.assembler.assemble(user_id, message, &window).await;
            let reply = self.generate(&context).await;
            (context, reply)
        })
        .await;

        let mut metadata = TurnMetadata::new();
        let (response, retrieval, degraded) = match answered {
            Ok((context, reply)) => {
                annotate_profile(&mut metadata, context.profile.as_ref());
                match reply {
                    Ok(text) => (text, context.retrieval, false),
                    Err(e) => {
                        warn!("Language model failed for {}: {}", user_id, e);
                        (FALLBACK_REPLY.to_string(), context.retrieval, true)
                    }
                }
            }
            Err(_) => {
                warn!(
                    "Turn deadline of {:?} exceeded for {}, sending best-effort reply",
                    self.turn_deadline, user_id
                );
                (FALLBACK_REPLY.to_string(), RetrievalSource::None, true)
            }
        };
        metadata.insert("retrieval".to_string(), retrieval.as_str().to_string());
        if degraded {
            metadata.insert("degraded".to_string(), "true".to_string());
        }

        let turn = self.writer.build_turn(user_id, message, &response, metadata);
        session.window.append(turn.clone());

        let persisted = self
            .writer
            .persist_until(&turn, self.index_mode, Some(deadline))
            .await;
        let touch = tokio::spawn(touch_profile(
            self.profiles.clone(),
            self.backend_retry.clone(),
            user_id.to_string(),
        ));
        self.writer
            .finish_by(Some(deadline), "profile touch", touch)
            .await;

        debug!(
            "Processed {} turn for {} ({} in window)",
            turn.memory_type,
            user_id,
            session.window.len()
        );

        TurnOutcome {
            response,
            turn: Some(turn),
            retrieval,
            persisted: Some(persisted),
            degraded,
        }
    }

    async fn generate(&self, context: &AssembledContext) -> MemoryResult<String> {
        let prompt = context.render();
        let model = self.model.clone();
        let tools = self.tools.as_slice();
        let prompt = prompt.as_str();

        let reply = with_retry(&self.llm_retry, "llm.complete", || {
            let model = model.clone();
            async move { model.complete(prompt, tools).await }
        })
        .await?;

        if reply.trim().is_empty() {
            return Err(MemoryError::LanguageModel("empty completion".to_string()));
        }
        Ok(reply)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn session(&self, user_id: &str) -> Arc<Mutex<UserSession>> {
        let now = self.elapsed_ms();
        {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(user_id) {
                entry.last_seen.store(now, Ordering::Relaxed);
                return entry.session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(user_id.to_string())
            .or_insert_with(|| SessionEntry {
                session: Arc::new(Mutex::new(UserSession {
                    window: ConversationWindow::new(self.window_capacity),
                })),
                last_seen: AtomicU64::new(now),
            })
            .session
            .clone();

        if sessions.len() > self.max_sessions {
            evict_idle(&mut sessions, self.max_sessions, user_id);
        }
        session
    }

    /// Number of live per-user sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    // ========================================================================
    // Supplementary operations
    // ========================================================================

    /// Merge `patch` into the user's profile
    pub async fn update_profile(&self, user_id: &str, patch: &ProfilePatch) -> MemoryResult<UserProfile> {
        validate_user_id(user_id)?;
        let session = self.session(user_id).await;
        let _guard = session.lock().await;

        let profiles = self.profiles.clone();
        let profile = with_retry(&self.backend_retry, "profile_store.upsert", || {
            let profiles = profiles.clone();
            async move { profiles.upsert(user_id, patch).await }
        })
        .await?;
        info!("Updated profile for user {}", user_id);
        Ok(profile)
    }

    pub async fn profile(&self, user_id: &str) -> MemoryResult<Option<UserProfile>> {
        validate_user_id(user_id)?;
        let profiles = self.profiles.clone();
        with_retry(&self.backend_retry, "profile_store.get", || {
            let profiles = profiles.clone();
            async move { profiles.get(user_id).await }
        })
        .await
    }

    /// Logged turns of `user_id` since `since`, oldest first
    pub async fn history(
        &self,
        user_id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> MemoryResult<Vec<ConversationTurn>> {
        validate_user_id(user_id)?;
        let turn_log = self.turn_log.clone();
        with_retry(&self.backend_retry, "turn_log.query", || {
            let turn_log = turn_log.clone();
            async move { turn_log.query(user_id, since).await }
        })
        .await
    }

    /// Current window of `user_id`, oldest first. Empty without a session.
    pub async fn window(&self, user_id: &str) -> Vec<ConversationTurn> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(user_id).map(|entry| entry.session.clone())
        };
        match session {
            Some(session) => session.lock().await.window.snapshot(),
            None => vec![],
        }
    }

    /// Memories relevant to `query`, without generating a reply
    pub async fn recall(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        memory_type: Option<MemoryCategory>,
    ) -> MemoryResult<(Vec<RecalledMemory>, RetrievalSource)> {
        validate_user_id(user_id)?;
        if query.trim().is_empty() {
            return Err(MemoryError::Validation("query cannot be empty".to_string()));
        }
        Ok(self.assembler.recall(user_id, query, k, memory_type).await)
    }

    /// Check each backend once. A check that outlives the backend
    /// timeout counts as unreachable.
    pub async fn health(&self) -> HealthReport {
        let limit = self.backend_retry.attempt_timeout();
        let index = timeout(limit, self.index.health_check())
            .await
            .unwrap_or(false);
        let profiles = matches!(
            timeout(limit, self.profiles.get(HEALTH_CHECK_USER)).await,
            Ok(Ok(_))
        );
        let turn_log = matches!(
            timeout(limit, self.turn_log.recent(HEALTH_CHECK_USER, 1)).await,
            Ok(Ok(_))
        );

        HealthReport {
            index_backend: self.index.name().to_string(),
            index,
            profiles,
            turn_log,
            embeddings_backend: self.embedder_name.clone(),
            language_model: self.model.name().to_string(),
            active_sessions: self.session_count().await,
        }
    }

    /// Await deferred index writes and any write that overran its turn
    pub async fn flush(&self) -> usize {
        self.writer.flush().await
    }
}

/// Create the profile on first contact, otherwise refresh `last_interaction`
async fn touch_profile(profiles: Arc<dyn ProfileStore>, retry: RetryConfig, user_id: String) {
    let patch = ProfilePatch::new();
    let result = with_retry(&retry, "profile_store.upsert", || {
        let profiles = profiles.clone();
        let (user_id, patch) = (&user_id, &patch);
        async move { profiles.upsert(user_id, patch).await }
    })
    .await;
    if let Err(e) = result {
        warn!("Could not update last_interaction for {}: {}", user_id, e);
    }
}

/// Remove least recently seen sessions that nobody holds until at most
/// `max` remain. `keep` is never evicted.
fn evict_idle(sessions: &mut HashMap<String, SessionEntry>, max: usize, keep: &str) {
    let mut idle: Vec<(String, u64)> = sessions
        .iter()
        .filter(|(user_id, entry)| {
            user_id.as_str() != keep && Arc::strong_count(&entry.session) == 1
        })
        .map(|(user_id, entry)| (user_id.clone(), entry.last_seen.load(Ordering::Relaxed)))
        .collect();
    idle.sort_by_key(|(_, last_seen)| *last_seen);

    let excess = sessions.len().saturating_sub(max);
    for (user_id, _) in idle.into_iter().take(excess) {
        sessions.remove(&user_id);
        debug!("Evicted idle session for {}", user_id);
    }
}

/// Profile snapshot stored with each turn
fn annotate_profile(metadata: &mut TurnMetadata, profile: Option<&UserProfile>) {
    if let Some(profile) = profile {
        if !profile.goals.is_empty() {
            metadata.insert("profile_goals".to_string(), profile.goals.join(", "));
        }
        if let Some(weight) = profile.weight {
            metadata.insert("profile_weight".to_string(), weight.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::InMemoryVectorIndex;
    use crate::memory::writer::IndexWrite;
    use crate::testing::{
        FailingEmbedder, FailingIndex, FailingStorage, MockLanguageModel, SlowTurnLog, StalledStorage,
    };

    const DIM: usize = 64;

    fn test_config() -> CoachConfig {
        CoachConfig {
            storage: StorageBackend::Memory,
            index: IndexBackend::Memory,
            embedding_dim: DIM,
            max_retries: 2,
            backend_timeout_ms: 500,
            llm_timeout_ms: 500,
            turn_deadline_ms: 5_000,
            defer_index_writes: false,
            ..Default::default()
        }
    }

    fn coordinator(model: Arc<MockLanguageModel>) -> MemoryCoordinator {
        MemoryCoordinator::new(MemoryBackends::in_memory(DIM), model, &test_config())
    }

    #[tokio::test]
    async fn test_process_turn_end_to_end() {
        let model = Arc::new(MockLanguageModel::new().with_response("Chicken is a great choice!"));
        let coach = coordinator(model.clone());

        let outcome = coach
            .process_turn_detailed("u1", "I ate chicken for lunch")
            .await;

        assert_eq!(outcome.response, "Chicken is a great choice!");
        assert!(!outcome.degraded);
        let turn = outcome.turn.unwrap();
        assert_eq!(turn.memory_type, MemoryCategory::MealLog);
        assert_eq!(turn.metadata.get("retrieval").map(String::as_str), Some("semantic"));
        assert_eq!(
            outcome.persisted,
            Some(PersistReport { logged: true, index: IndexWrite::Stored })
        );

        assert_eq!(coach.history("u1", None).await.unwrap().len(), 1);
        assert_eq!(coach.window("u1").await.len(), 1);
        // first contact creates the profile
        assert_eq!(coach.profile("u1").await.unwrap().unwrap().name, "User");
        assert_eq!(model.last_tools().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_input_is_noop() {
        let model = Arc::new(MockLanguageModel::new());
        let coach = coordinator(model.clone());

        assert_eq!(coach.process_turn("u1", "   ").await, "");
        assert_eq!(coach.process_turn("", "hello").await, "");
        assert_eq!(model.call_count(), 0);
        assert_eq!(coach.session_count().await, 0);
        assert!(coach.history("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_profile_reaches_the_model() {
        let model = Arc::new(MockLanguageModel::new());
        let coach = coordinator(model.clone());
        coach
            .update_profile("u1", &ProfilePatch::new().name("Alex").goals(["build muscle"]))
            .await
            .unwrap();

        coach.process_turn("u1", "How's my progress?").await;

        let context = model.last_context().unwrap();
        assert!(context.contains("Alex"));
        assert!(context.contains("build muscle"));
        assert!(context.ends_with("How's my progress?"));
    }

    #[tokio::test]
    async fn test_window_feeds_next_turn() {
        let model = Arc::new(MockLanguageModel::new().with_response("Hydrate well"));
        let coach = coordinator(model.clone());

        coach.process_turn("u1", "Just finished a long run").await;
        coach.process_turn("u1", "what now").await;

        let contexts = model.contexts();
        assert_eq!(contexts.len(), 2);
        assert!(!contexts[0].contains("<recent_conversation>"));
        assert!(contexts[1].contains("<recent_conversation>"));
        assert!(contexts[1].contains("User: Just finished a long run\nCoach: Hydrate well"));
    }

    #[tokio::test]
    async fn test_embedding_failure_still_answers_and_logs() {
        let model = Arc::new(MockLanguageModel::new());
        let mut backends = MemoryBackends::in_memory(DIM);
        backends.embedder = Arc::new(FailingEmbedder::new(DIM));
        let coach = MemoryCoordinator::new(backends, model, &test_config());

        let outcome = coach.process_turn_detailed("u1", "hello coach").await;

        assert!(!outcome.response.is_empty());
        assert_eq!(outcome.retrieval, RetrievalSource::Keyword);
        assert_eq!(outcome.persisted.unwrap().index, IndexWrite::Skipped);
        assert_eq!(coach.history("u1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_index_down_uses_keyword_path() {
        let model = Arc::new(MockLanguageModel::new());
        let mut backends = MemoryBackends::in_memory(DIM);
        backends.index = Arc::new(FailingIndex::default());
        let coach = MemoryCoordinator::new(backends, model.clone(), &test_config());

        coach.process_turn("u1", "I snacked on almonds").await;
        let outcome = coach.process_turn_detailed("u1", "are almonds healthy").await;

        assert_eq!(outcome.retrieval, RetrievalSource::Keyword);
        assert_eq!(outcome.persisted.unwrap().index, IndexWrite::Failed);
        assert_eq!(coach.history("u1", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_model_failure_gives_best_effort_reply() {
        let model = Arc::new(MockLanguageModel::failing());
        let coach = coordinator(model.clone());

        let outcome = coach.process_turn_detailed("u1", "I feel tired").await;
        assert_eq!(outcome.response, FALLBACK_REPLY);
        assert!(outcome.degraded);
        assert_eq!(model.call_count(), 2);

        let logged = coach.history("u1", None).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].metadata.get("degraded").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_turn_deadline() {
        let model = Arc::new(MockLanguageModel::new().with_delay(Duration::from_millis(300)));
        let config = CoachConfig {
            turn_deadline_ms: 50,
            llm_timeout_ms: 1_000,
            ..test_config()
        };
        let coach = MemoryCoordinator::new(MemoryBackends::in_memory(DIM), model, &config);

        let started = Instant::now();
        let response = coach.process_turn("u1", "quick question").await;
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(response, FALLBACK_REPLY);

        coach.flush().await;
        assert_eq!(coach.history("u1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_turn_log_does_not_hold_the_reply() {
        let model = Arc::new(MockLanguageModel::new());
        let config = CoachConfig {
            turn_deadline_ms: 200,
            backend_timeout_ms: 2_000,
            ..test_config()
        };
        let turn_log = Arc::new(SlowTurnLog::new(Duration::from_millis(800)));
        let mut backends = MemoryBackends::in_memory(DIM);
        backends.turn_log = turn_log.clone();
        let coach = MemoryCoordinator::new(backends, model, &config);

        let started = Instant::now();
        let outcome = coach.process_turn_detailed("u1", "quick question").await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(outcome.response, "reply 1");
        assert!(!outcome.persisted.unwrap().logged);

        // the append finishes after the reply
        coach.flush().await;
        let logged = TurnLog::query(turn_log.as_ref(), "u1", None).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].message, "quick question");
    }

    #[tokio::test]
    async fn test_health_does_not_hang_on_stalled_storage() {
        let model = Arc::new(MockLanguageModel::new());
        let config = CoachConfig {
            backend_timeout_ms: 100,
            ..test_config()
        };
        let mut backends = MemoryBackends::in_memory(DIM);
        backends.profiles = Arc::new(StalledStorage);
        backends.turn_log = Arc::new(StalledStorage);
        let coach = MemoryCoordinator::new(backends, model, &config);

        let health = timeout(Duration::from_secs(2), coach.health())
            .await
            .expect("health should answer within the backend timeouts");
        assert!(!health.profiles);
        assert!(!health.turn_log);
        assert!(health.index);
        assert_eq!(health.language_model, "mock");
    }

    #[tokio::test]
    async fn test_rejected_model_request_is_not_retried() {
        let model = Arc::new(MockLanguageModel::new().with_error(MemoryError::Rejected {
            service: "Chat API".to_string(),
            status: 401,
            message: "invalid api key".to_string(),
        }));
        let coach = coordinator(model.clone());

        let outcome = coach.process_turn_detailed("u1", "hello").await;
        assert_eq!(outcome.response, FALLBACK_REPLY);
        assert!(outcome.degraded);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_storage_down_still_answers() {
        let model = Arc::new(MockLanguageModel::new().with_response("Still here"));
        let mut backends = MemoryBackends::in_memory(DIM);
        backends.profiles = Arc::new(FailingStorage);
        backends.turn_log = Arc::new(FailingStorage);
        let coach = MemoryCoordinator::new(backends, model, &test_config());

        let outcome = coach.process_turn_detailed("u1", "hi").await;
        assert_eq!(outcome.response, "Still here");
        assert!(!outcome.persisted.unwrap().logged);
        assert_eq!(coach.window("u1").await.len(), 1);

        let health = coach.health().await;
        assert!(!health.profiles);
        assert!(!health.turn_log);
        assert!(health.index);
        assert!(!health.all_healthy());
    }

    #[tokio::test]
    async fn test_concurrent_same_user_turns_keep_order() {
        let model = Arc::new(MockLanguageModel::new().with_delay(Duration::from_millis(5)));
        let coach = Arc::new(coordinator(model));

        let mut handles = Vec::new();
        for i in 0..8 {
            let coach = coach.clone();
            handles.push(tokio::spawn(async move {
                coach.process_turn("u1", &format!("message {}", i)).await
            }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap().is_empty());
        }

        let window: Vec<String> = coach.window("u1").await.into_iter().map(|t| t.message).collect();
        let logged: Vec<String> = coach
            .history("u1", None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.message)
            .collect();
        assert_eq!(window.len(), 8);
        assert_eq!(window, logged);
    }

    #[tokio::test]
    async fn test_users_never_see_each_other() {
        let model = Arc::new(MockLanguageModel::new());
        let coach = coordinator(model.clone());

        coach
            .process_turn("alice", "my secret salmon marinade uses miso")
            .await;
        coach.process_turn("bob", "any salmon marinade ideas?").await;

        let bob_context = model.last_context().unwrap();
        assert!(!bob_context.contains("miso"));
        let (memories, _) = coach.recall("bob", "salmon marinade miso", 5, None).await.unwrap();
        assert!(memories.iter().all(|m| !m.text.contains("miso")));
    }

    #[tokio::test]
    async fn test_recall_finds_past_turn() {
        let model = Arc::new(MockLanguageModel::new().with_response("Oats are great fuel"));
        let coach = coordinator(model);
        coach.process_turn("u1", "I ate oats for breakfast").await;

        let (memories, source) = coach
            .recall("u1", "oats breakfast", 3, Some(MemoryCategory::MealLog))
            .await
            .unwrap();
        assert_eq!(source, RetrievalSource::Semantic);
        assert_eq!(memories.len(), 1);
        assert!(memories[0].text.contains("Oats are great fuel"));

        assert!(matches!(
            coach.recall("u1", " ", 3, None).await,
            Err(MemoryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_deferred_index_writes() {
        let model = Arc::new(MockLanguageModel::new());
        let config = CoachConfig {
            defer_index_writes: true,
            ..test_config()
        };
        let backends = MemoryBackends::in_memory(DIM);
        let index = Arc::new(InMemoryVectorIndex::new(DIM));
        let backends = MemoryBackends {
            index: index.clone(),
            ..backends
        };
        let coach = MemoryCoordinator::new(backends, model, &config);

        let outcome = coach.process_turn_detailed("u1", "lunch was a burrito").await;
        assert_eq!(outcome.persisted.unwrap().index, IndexWrite::Deferred);

        coach.flush().await;
        assert_eq!(index.len_for("u1").await, 1);
    }

    #[tokio::test]
    async fn test_idle_sessions_evicted() {
        let model = Arc::new(MockLanguageModel::new());
        let config = CoachConfig {
            max_sessions: 2,
            ..test_config()
        };
        let coach = MemoryCoordinator::new(MemoryBackends::in_memory(DIM), model, &config);

        coach.process_turn("a", "hi").await;
        coach.process_turn("b", "hi").await;
        coach.process_turn("c", "hi").await;

        assert_eq!(coach.session_count().await, 2);
        assert!(!coach.window("c").await.is_empty());
    }

    #[tokio::test]
    async fn test_update_profile_validation() {
        let coach = coordinator(Arc::new(MockLanguageModel::new()));
        assert!(matches!(
            coach.update_profile("", &ProfilePatch::new()).await,
            Err(MemoryError::Validation(_))
        ));
        let profile = coach
            .update_profile("u1", &ProfilePatch::new().weight(75.0))
            .await
            .unwrap();
        assert_eq!(profile.weight, Some(75.0));
    }

    #[test]
    fn test_from_config_memory_backends() {
        let backends = MemoryBackends::from_config(&CoachConfig {
            index: IndexBackend::None,
            ..test_config()
        })
        .unwrap();
        assert_eq!(backends.index.name(), "none");
        assert_eq!(backends.embedder.name(), "hashing");
        assert_eq!(backends.embedder.dimension(), DIM);
    }
}
