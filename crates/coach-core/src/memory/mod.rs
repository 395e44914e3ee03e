//! ============================================================================
//! Memory Module - Layered conversation memory for the coach
//! ============================================================================
//! Four layers feed every reply:
//! - a bounded per-user window of recent turns (in process)
//! - the durable turn log (`crate::db::TurnLog`)
//! - the structured user profile (`crate::db::ProfileStore`)
//! - a semantic index over past turns, with a keyword fallback
//!
//! ## Architecture
//! ```text
//! Message → Profile + Embed → Vector Search ──(unavailable)──→ Keyword Ranker
//!                                  ↓                                ↓
//!        [Profile] + [Relevant Memories] + [Recent Window] + [Message]
//!                                  ↓
//!                           Language Model
//!                                  ↓
//!            Window ← Turn → Turn Log + Semantic Index → Profile touch
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use coach_core::{CoachConfig, MemoryCoordinator, OpenAiChatModel};
//!
//! let config = CoachConfig::from_env()?;
//! let model = Arc::new(OpenAiChatModel::new(api_key, &config.llm_base_url, &config.llm_model, timeout)?);
//! let coach = MemoryCoordinator::from_config(&config, model)?;
//!
//! let reply = coach.process_turn("telegram:42", "I ate chicken for lunch").await;
//! ```
//! ============================================================================

pub mod classifier;
pub mod context;
pub mod coordinator;
pub mod embeddings;
pub mod fallback;
pub mod store;
pub mod types;
pub mod window;
pub mod writer;

// Re-export public types
pub use classifier::{classify, MessageClassifier};
pub use context::{AssembledContext, ContextAssembler, RecalledMemory, RetrievalSource};
pub use coordinator::{HealthReport, MemoryBackends, MemoryCoordinator, TurnOutcome, UserSession};
pub use embeddings::{
    create_embedding_service, is_sentinel, EmbeddingGenerator, EmbeddingService, HashingEmbedder,
    ResilientEmbedder, EMBEDDING_DIM,
};
pub use fallback::{KeywordFallbackRanker, RankedTurn};
pub use store::{
    cosine_similarity, DisabledIndex, InMemoryVectorIndex, QdrantMemoryIndex, SemanticMemoryIndex,
    COLLECTION_NAME,
};
pub use types::{ConversationTurn, MemoryCategory, ScoredMemory, SemanticMemoryRecord, TurnMetadata};
pub use window::{ConversationWindow, DEFAULT_WINDOW_CAPACITY};
pub use writer::{IndexWrite, IndexWriteMode, MemoryWriter, PersistReport};
