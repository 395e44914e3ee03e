//! ============================================================================
//! COACH-CORE: Memory and context assembly for a conversational coach
//! ============================================================================
//! This crate handles everything between an inbound message and the reply:
//! - Per-user recent-turn windows and session serialization
//! - Durable profiles and turn log in redb
//! - Semantic recall via Qdrant (or in process) with a keyword fallback
//! - Prompt assembly and the language model call
//! ============================================================================

pub mod config;
pub mod db;
pub mod llm;
pub mod memory;
pub mod retry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use config::{CoachConfig, EmbeddingBackend, IndexBackend, StorageBackend};
pub use db::{CoachDb, DbStats, InMemoryStore, ProfilePatch, ProfileStore, TurnLog, UserProfile};
pub use llm::{default_tools, LanguageModel, OpenAiChatModel, ToolSpec, FALLBACK_REPLY};
pub use memory::{
    classify, AssembledContext, ConversationTurn, HealthReport, MemoryBackends, MemoryCategory,
    MemoryCoordinator, RecalledMemory, RetrievalSource, TurnOutcome,
};
pub use retry::{with_retry, RetryConfig};
pub use types::{MemoryError, MemoryResult};
