//! ============================================================================
//! Keyword Fallback Ranker - Lexical recall without a vector backend
//! ============================================================================
//! Scores past turns by the number of distinct words they share with the
//! query. Used whenever semantic search is unavailable; has no external
//! dependencies and cannot fail.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::classifier::tokenize;
use super::types::ConversationTurn;

/// A past turn with its lexical overlap score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTurn {
    pub turn: ConversationTurn,
    pub score: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordFallbackRanker;

impl KeywordFallbackRanker {
    pub fn new() -> Self {
        Self
    }

    /// Distinct words shared between the query and `message + response`
    pub fn score(&self, query_words: &HashSet<String>, turn: &ConversationTurn) -> usize {
        if query_words.is_empty() {
            return 0;
        }
        let turn_words: HashSet<String> =
            tokenize(&format!("{} {}", turn.message, turn.response))
                .into_iter()
                .collect();
        query_words.intersection(&turn_words).count()
    }

    /// Top `k` candidates by overlap. Zero-overlap candidates are dropped;
    /// equal scores rank the more recent turn first.
    pub fn rank(&self, query: &str, candidates: Vec<ConversationTurn>, k: usize) -> Vec<RankedTurn> {
        let query_words: HashSet<String> = tokenize(query).into_iter().collect();

        let mut ranked: Vec<RankedTurn> = candidates
            .into_iter()
            .filter_map(|turn| {
                let score = self.score(&query_words, &turn);
                (score > 0).then_some(RankedTurn { turn, score })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.turn.timestamp.cmp(&a.turn.timestamp))
        });
        ranked.truncate(k);
        ranked
    }
}
