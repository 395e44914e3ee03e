//! ============================================================================
//! Memory Types - Data structures for conversation memory
//! ============================================================================
//! Defines conversation turns, semantic memory records and their category.
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::types::MemoryError;

/// Opaque per-turn annotations (profile snapshot, retrieval path, ...)
pub type TurnMetadata = BTreeMap<String, String>;

/// Category tag attached to every turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// User reported something they ate
    MealLog,
    /// Goals, weight, progress
    GoalCheck,
    /// User asked for a recommendation
    Advice,
    /// Energy, feelings, mood
    Mood,
    Casual,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 5] = [
        MemoryCategory::MealLog,
        MemoryCategory::GoalCheck,
        MemoryCategory::Advice,
        MemoryCategory::Mood,
        MemoryCategory::Casual,
    ];

    /// Stable wire name, also used as the index payload value
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::MealLog => "meal_log",
            MemoryCategory::GoalCheck => "goal_check",
            MemoryCategory::Advice => "advice",
            MemoryCategory::Mood => "mood",
            MemoryCategory::Casual => "casual",
        }
    }

    /// Get the display name for this category
    pub fn display_name(&self) -> &'static str {
        match self {
            MemoryCategory::MealLog => "Meal Log",
            MemoryCategory::GoalCheck => "Goal Check",
            MemoryCategory::Advice => "Advice",
            MemoryCategory::Mood => "Mood",
            MemoryCategory::Casual => "Casual",
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "meal_log" | "meallog" | "meal" => Ok(MemoryCategory::MealLog),
            "goal_check" | "goalcheck" | "goal" => Ok(MemoryCategory::GoalCheck),
            "advice" => Ok(MemoryCategory::Advice),
            "mood" => Ok(MemoryCategory::Mood),
            "casual" => Ok(MemoryCategory::Casual),
            _ => Err(MemoryError::Validation(format!(
                "Unknown memory category '{}'. Valid values: meal_log, goal_check, advice, mood, casual",
                s
            ))),
        }
    }
}

/// One user message plus the coach's response. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_id: String,
    pub message: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
    pub memory_type: MemoryCategory,
    #[serde(default)]
    pub metadata: TurnMetadata,
}

impl ConversationTurn {
    pub fn new(
        user_id: impl Into<String>,
        message: impl Into<String>,
        response: impl Into<String>,
        memory_type: MemoryCategory,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            response: response.into(),
            timestamp: Utc::now(),
            memory_type,
            metadata: TurnMetadata::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The turn as a single string, used for embedding and prompts
    pub fn render(&self) -> String {
        format!("User: {}\nCoach: {}", self.message, self.response)
    }
}

/// A turn projected into the vector space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMemoryRecord {
    pub id: Uuid,
    pub user_id: String,
    /// Rendered turn text
    pub text: String,
    /// Vector embedding (not returned by queries)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub memory_type: MemoryCategory,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: TurnMetadata,
}

impl SemanticMemoryRecord {
    /// Build the record for a logged turn
    pub fn from_turn(turn: &ConversationTurn, embedding: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: turn.user_id.clone(),
            text: turn.render(),
            embedding,
            memory_type: turn.memory_type,
            timestamp: turn.timestamp,
            metadata: turn.metadata.clone(),
        }
    }
}

/// A record returned by a k-NN query with its cosine similarity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub record: SemanticMemoryRecord,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parsing() {
        assert_eq!("meal_log".parse::<MemoryCategory>().unwrap(), MemoryCategory::MealLog);
        assert_eq!("goal-check".parse::<MemoryCategory>().unwrap(), MemoryCategory::GoalCheck);
        assert_eq!("Mood".parse::<MemoryCategory>().unwrap(), MemoryCategory::Mood);
        assert!(matches!(
            "snack".parse::<MemoryCategory>(),
            Err(MemoryError::Validation(_))
        ));
    }

    #[test]
    fn test_category_wire_names_round_trip() {
        for category in MemoryCategory::ALL {
            assert_eq!(category.as_str().parse::<MemoryCategory>().unwrap(), category);
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
    }

    #[test]
    fn test_turn_render() {
        let turn = ConversationTurn::new("u1", "I had oats", "Nice start!", MemoryCategory::MealLog);
        assert_eq!(turn.render(), "User: I had oats\nCoach: Nice start!");
    }

    #[test]
    fn test_record_from_turn() {
        let turn = ConversationTurn::new("u1", "I feel tired", "Rest up", MemoryCategory::Mood)
            .with_metadata("retrieval", "keyword");
        let record = SemanticMemoryRecord::from_turn(&turn, vec![0.5; 4]);

        assert_eq!(record.user_id, "u1");
        assert_eq!(record.text, turn.render());
        assert_eq!(record.memory_type, MemoryCategory::Mood);
        assert_eq!(record.timestamp, turn.timestamp);
        assert_eq!(record.metadata.get("retrieval").map(String::as_str), Some("keyword"));
    }
}
