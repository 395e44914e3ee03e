//! ============================================================================
//! Message Classifier - Rule-table category tagging
//! ============================================================================
//! Tags each turn with a `MemoryCategory` by keyword overlap. Rules are
//! tried in table order and the first rule with a matching keyword wins:
//!
//! ```text
//! meal_log > goal_check > advice > mood > (casual)
//! ```
//!
//! Meal keywords are reporting words ("ate", "lunch"), not intent words, so
//! a question like "what should I eat?" falls through to advice.
//! ============================================================================

use super::types::MemoryCategory;

/// Default rule table, in priority order
const DEFAULT_RULES: &[(MemoryCategory, &[&str])] = &[
    (
        MemoryCategory::MealLog,
        &[
            "ate", "eaten", "breakfast", "lunch", "dinner", "snack", "snacked", "meal", "meals",
            "food",
        ],
    ),
    (
        MemoryCategory::GoalCheck,
        &[
            "goal", "goals", "weight", "lose", "gain", "build", "muscle", "progress", "target",
        ],
    ),
    (
        MemoryCategory::Advice,
        &[
            "advice", "help", "recommend", "recommendation", "suggest", "suggestion", "tips",
            "what should", "should i",
        ],
    ),
    (
        MemoryCategory::Mood,
        &[
            "feel", "feeling", "mood", "tired", "energy", "good", "bad", "stressed", "exhausted",
        ],
    ),
];

/// Lowercase, split on whitespace, trim surrounding punctuation
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|word| !word.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
struct Rule {
    category: MemoryCategory,
    /// Each keyword as its token sequence; single words have length 1
    keywords: Vec<Vec<String>>,
}

impl Rule {
    fn matches(&self, tokens: &[String]) -> bool {
        self.keywords.iter().any(|phrase| {
            !phrase.is_empty()
                && phrase.len() <= tokens.len()
                && tokens.windows(phrase.len()).any(|window| window == phrase.as_slice())
        })
    }
}

/// Ordered `(category, keywords)` table evaluated first-match-wins
#[derive(Debug, Clone)]
pub struct MessageClassifier {
    rules: Vec<Rule>,
}

impl Default for MessageClassifier {
    fn default() -> Self {
        Self::with_rules(
            DEFAULT_RULES
                .iter()
                .map(|(category, keywords)| (*category, keywords.iter().map(|k| k.to_string()).collect())),
        )
    }
}

impl MessageClassifier {
    /// Build a classifier from a custom table. Order is priority.
    pub fn with_rules(rules: impl IntoIterator<Item = (MemoryCategory, Vec<String>)>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(category, keywords)| Rule {
                category,
                keywords: keywords.iter().map(|k| tokenize(k)).collect(),
            })
            .collect();
        Self { rules }
    }

    /// Classify a message. Never fails; unmatched text is `Casual`.
    pub fn classify(&self, text: &str) -> MemoryCategory {
        let tokens = tokenize(text);
        self.rules
            .iter()
            .find(|rule| rule.matches(&tokens))
            .map(|rule| rule.category)
            .unwrap_or(MemoryCategory::Casual)
    }
}

/// Classify with the default rule table
pub fn classify(text: &str) -> MemoryCategory {
    MessageClassifier::default().classify(text)
}
