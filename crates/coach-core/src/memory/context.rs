//! ============================================================================
//! Context Assembler - Builds the model prompt for one turn
//! ============================================================================
//! Combines, in this order:
//!
//! ```text
//! <user_profile>          profile summary (omitted when unknown)
//! <relevant_memories>     top-k past turns, most relevant first
//! <recent_conversation>   window snapshot, oldest first
//! {new message}           verbatim, always last
//! ```
//!
//! Memories come from the semantic index. When the index is unavailable or
//! the query embedding is the zero sentinel, recent turns from the turn log
//! are ranked by keyword overlap instead. Assembly never fails.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::embeddings::{is_sentinel, ResilientEmbedder};
use super::fallback::KeywordFallbackRanker;
use super::store::SemanticMemoryIndex;
use super::types::{ConversationTurn, MemoryCategory};
use crate::db::{ProfileStore, TurnLog, UserProfile};
use crate::retry::{with_retry, RetryConfig};

/// Default number of memories per context
pub const DEFAULT_MEMORY_K: usize = 3;

/// Default number of recent turns scanned by the keyword fallback
pub const DEFAULT_FALLBACK_CANDIDATES: usize = 50;

/// Which retrieval path produced the memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    /// The vector index answered
    Semantic,
    /// Keyword overlap over recent turns
    Keyword,
    /// Nothing could be retrieved
    None,
}

impl RetrievalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalSource::Semantic => "semantic",
            RetrievalSource::Keyword => "keyword",
            RetrievalSource::None => "none",
        }
    }
}

/// One past turn selected for the prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub text: String,
    pub memory_type: MemoryCategory,
    pub timestamp: DateTime<Utc>,
    /// Cosine similarity, or keyword overlap count
    pub score: f32,
}

/// Everything the model sees for one turn
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub user_id: String,
    pub profile: Option<UserProfile>,
    pub memories: Vec<RecalledMemory>,
    pub window: Vec<ConversationTurn>,
    pub message: String,
    pub retrieval: RetrievalSource,
}

impl AssembledContext {
    /// Prompt text. Ends with the verbatim new message.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if let Some(profile) = &self.profile {
            out.push_str("<user_profile>\n");
            out.push_str(&profile.summary());
            out.push_str("\n</user_profile>\n\n");
        }

        if !self.memories.is_empty() {
            out.push_str("<relevant_memories>\n");
            for memory in &self.memories {
                out.push_str(&format!(
                    "- [{} {}] {}\n",
                    memory.timestamp.format("%Y-%m-%d"),
                    memory.memory_type,
                    memory.text
                ));
            }
            out.push_str("</relevant_memories>\n\n");
        }

        if !self.window.is_empty() {
            out.push_str("<recent_conversation>\n");
            for turn in &self.window {
                out.push_str(&turn.render());
                out.push('\n');
            }
            out.push_str("</recent_conversation>\n\n");
        }

        out.push_str(&self.message);
        out
    }
}

pub struct ContextAssembler {
    profiles: Arc<dyn ProfileStore>,
    turn_log: Arc<dyn TurnLog>,
    index: Arc<dyn SemanticMemoryIndex>,
    embedder: ResilientEmbedder,
    ranker: KeywordFallbackRanker,
    retry: RetryConfig,
    memory_k: usize,
    fallback_candidates: usize,
}

impl ContextAssembler {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        turn_log: Arc<dyn TurnLog>,
        index: Arc<dyn SemanticMemoryIndex>,
        embedder: ResilientEmbedder,
        retry: RetryConfig,
    ) -> Self {
        Self {
            profiles,
            turn_log,
            index,
            embedder,
            ranker: KeywordFallbackRanker::new(),
            retry,
            memory_k: DEFAULT_MEMORY_K,
            fallback_candidates: DEFAULT_FALLBACK_CANDIDATES,
        }
    }

    pub fn with_memory_k(mut self, k: usize) -> Self {
        self.memory_k = k;
        self
    }

    pub fn with_fallback_candidates(mut self, candidates: usize) -> Self {
        self.fallback_candidates = candidates;
        self
    }

    pub fn memory_k(&self) -> usize {
        self.memory_k
    }

    /// Build the context for `new_message`
    pub async fn assemble(
        &self,
        user_id: &str,
        new_message: &str,
        window: &[ConversationTurn],
    ) -> AssembledContext {
        let profile = self.load_profile(user_id).await;
        let (memories, retrieval) = self
            .retrieve(user_id, new_message, self.memory_k, None, window)
            .await;

        debug!(
            "Assembled context for {}: profile={}, {} memories via {}, {} window turns",
            user_id,
            profile.is_some(),
            memories.len(),
            retrieval.as_str(),
            window.len()
        );

        AssembledContext {
            user_id: user_id.to_string(),
            profile,
            memories,
            window: window.to_vec(),
            message: new_message.to_string(),
            retrieval,
        }
    }

    /// Retrieval on its own, optionally restricted to one category
    pub async fn recall(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        memory_type: Option<MemoryCategory>,
    ) -> (Vec<RecalledMemory>, RetrievalSource) {
        self.retrieve(user_id, query, k, memory_type, &[]).await
    }

    async fn load_profile(&self, user_id: &str) -> Option<UserProfile> {
        let profiles = self.profiles.clone();
        match with_retry(&self.retry, "profile_store.get", || {
            let profiles = profiles.clone();
            async move { profiles.get(user_id).await }
        })
        .await
        {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Profile unavailable for {}, continuing without: {}", user_id, e);
                None
            }
        }
    }

    async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        memory_type: Option<MemoryCategory>,
        window: &[ConversationTurn],
    ) -> (Vec<RecalledMemory>, RetrievalSource) {
        if k == 0 {
            return (vec![], RetrievalSource::None);
        }

        let embedding = self.embedder.embed(query).await;
        if is_sentinel(&embedding) {
            debug!("Query embedding unavailable for {}, using keyword fallback", user_id);
            return self.keyword_fallback(user_id, query, k, memory_type, window).await;
        }

        // over-fetch so hits already shown in the window can be dropped
        let limit = k + window.len();
        let index = self.index.clone();
        let result = with_retry(&self.retry, "index.query", || {
            let index = index.clone();
            let embedding = &embedding;
            async move { index.query(user_id, embedding, limit, memory_type).await }
        })
        .await;

        match result {
            Ok(scored) => {
                let memories = scored
                    .into_iter()
                    .filter(|m| m.record.user_id == user_id)
                    .filter(|m| !shown_in_window(window, m.record.timestamp, &m.record.text))
                    .take(k)
                    .map(|m| RecalledMemory {
                        text: m.record.text,
                        memory_type: m.record.memory_type,
                        timestamp: m.record.timestamp,
                        score: m.score,
                    })
                    .collect();
                (memories, RetrievalSource::Semantic)
            }
            Err(e) => {
                warn!(
                    "Semantic index {} unavailable for {}, using keyword fallback: {}",
                    self.index.name(),
                    user_id,
                    e
                );
                self.keyword_fallback(user_id, query, k, memory_type, window).await
            }
        }
    }

    async fn keyword_fallback(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        memory_type: Option<MemoryCategory>,
        window: &[ConversationTurn],
    ) -> (Vec<RecalledMemory>, RetrievalSource) {
        let turn_log = self.turn_log.clone();
        let limit = self.fallback_candidates;
        let candidates = match with_retry(&self.retry, "turn_log.recent", || {
            let turn_log = turn_log.clone();
            async move { turn_log.recent(user_id, limit).await }
        })
        .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!("Turn log unavailable for {}, no memories this turn: {}", user_id, e);
                return (vec![], RetrievalSource::None);
            }
        };

        let candidates: Vec<ConversationTurn> = candidates
            .into_iter()
            .filter(|t| memory_type.map_or(true, |category| t.memory_type == category))
            .filter(|t| !shown_in_window(window, t.timestamp, &t.render()))
            .collect();

        let memories = self
            .ranker
            .rank(query, candidates, k)
            .into_iter()
            .map(|ranked| RecalledMemory {
                text: ranked.turn.render(),
                memory_type: ranked.turn.memory_type,
                timestamp: ranked.turn.timestamp,
                score: ranked.score as f32,
            })
            .collect();
        (memories, RetrievalSource::Keyword)
    }
}

/// Whether a past turn is already part of the recent window. Timestamps
/// compare at microsecond precision, which is what the index stores.
fn shown_in_window(window: &[ConversationTurn], timestamp: DateTime<Utc>, text: &str) -> bool {
    window.iter().any(|w| {
        w.timestamp.timestamp_micros() == timestamp.timestamp_micros() && w.render() == text
    })
}
