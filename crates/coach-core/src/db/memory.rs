//! Process-local `ProfileStore` and `TurnLog`, for tests and
//! `COACH_STORAGE=memory`. Same semantics as `CoachDb`, nothing survives a
//! restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::types::{ProfilePatch, UserProfile};
use super::{validate_user_id, ProfileStore, TurnLog};
use crate::memory::types::ConversationTurn;
use crate::types::MemoryResult;

#[derive(Default)]
pub struct InMemoryStore {
    profiles: RwLock<HashMap<String, UserProfile>>,
    turns: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryStore {
    async fn get(&self, user_id: &str) -> MemoryResult<Option<UserProfile>> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }

    async fn upsert(&self, user_id: &str, patch: &ProfilePatch) -> MemoryResult<UserProfile> {
        validate_user_id(user_id)?;
        let now = Utc::now();

        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::new(user_id, now));
        patch.apply_to(profile);
        profile.last_interaction = profile.last_interaction.max(now);
        Ok(profile.clone())
    }
}

#[async_trait]
impl TurnLog for InMemoryStore {
    async fn append(&self, turn: &ConversationTurn) -> MemoryResult<()> {
        validate_user_id(&turn.user_id)?;

        let mut turns = self.turns.write().await;
        let log = turns.entry(turn.user_id.clone()).or_default();
        // equal timestamps keep insertion order
        let at = log.partition_point(|t| t.timestamp <= turn.timestamp);
        log.insert(at, turn.clone());
        Ok(())
    }

    async fn query(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> MemoryResult<Vec<ConversationTurn>> {
        let turns = self.turns.read().await;
        Ok(turns
            .get(user_id)
            .map(|log| {
                log.iter()
                    .filter(|t| since.map_or(true, |since| t.timestamp >= since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> MemoryResult<Vec<ConversationTurn>> {
        let turns = self.turns.read().await;
        Ok(turns
            .get(user_id)
            .map(|log| log[log.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default())
    }
}
