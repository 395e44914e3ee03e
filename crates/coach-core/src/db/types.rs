//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{MemoryError, MemoryResult};

/// Name given to a profile created on first contact
pub const DEFAULT_PROFILE_NAME: &str = "User";

pub const DEFAULT_EXPERIENCE_LEVEL: &str = "beginner";

/// Structured per-user profile. One per `user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    pub age: Option<u32>,
    /// Kilograms
    pub weight: Option<f64>,
    /// Centimeters
    pub height: Option<f64>,
    pub activity_level: Option<String>,
    pub dietary_restrictions: BTreeSet<String>,
    /// Ordered, most important first
    pub goals: Vec<String>,
    /// kcal per day
    pub calorie_target: Option<u32>,
    /// Grams per day
    pub protein_target: Option<f64>,
    pub experience_level: String,
    pub training_days: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
}

impl UserProfile {
    /// Fresh profile with defaults, as created on first contact
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            name: DEFAULT_PROFILE_NAME.to_string(),
            age: None,
            weight: None,
            height: None,
            activity_level: None,
            dietary_restrictions: BTreeSet::new(),
            goals: Vec::new(),
            calorie_target: None,
            protein_target: None,
            experience_level: DEFAULT_EXPERIENCE_LEVEL.to_string(),
            training_days: Vec::new(),
            created_at: now,
            last_interaction: now,
        }
    }

    /// Short human-readable summary used in the prompt
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Name: {}", self.name)];
        if !self.goals.is_empty() {
            lines.push(format!("Goals: {}", self.goals.join(", ")));
        }
        if let Some(weight) = self.weight {
            lines.push(format!("Weight: {}kg", weight));
        }
        if let Some(calories) = self.calorie_target {
            lines.push(format!("Calorie target: {} kcal", calories));
        }
        if let Some(protein) = self.protein_target {
            lines.push(format!("Protein target: {}g", protein));
        }
        if !self.dietary_restrictions.is_empty() {
            let restrictions: Vec<&str> =
                self.dietary_restrictions.iter().map(String::as_str).collect();
            lines.push(format!("Dietary restrictions: {}", restrictions.join(", ")));
        }
        lines.join("\n")
    }
}

/// Partial profile update. `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub weight: Option<f64>,
    pub height: Option<f64>,
    pub activity_level: Option<String>,
    pub dietary_restrictions: Option<BTreeSet<String>>,
    pub goals: Option<Vec<String>>,
    pub calorie_target: Option<u32>,
    pub protein_target: Option<f64>,
    pub experience_level: Option<String>,
    pub training_days: Option<Vec<String>>,
}

/// Keys accepted by `ProfilePatch::set_field`
pub const PROFILE_FIELDS: &[&str] = &[
    "name",
    "age",
    "weight",
    "height",
    "activity_level",
    "dietary_restrictions",
    "goals",
    "calorie_target",
    "protein_target",
    "experience_level",
    "training_days",
];

impl ProfilePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn age(mut self, age: u32) -> Self {
        self.age = Some(age);
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn goals<I, S>(mut self, goals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.goals = Some(goals.into_iter().map(Into::into).collect());
        self
    }

    pub fn dietary_restrictions<I, S>(mut self, restrictions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dietary_restrictions = Some(restrictions.into_iter().map(Into::into).collect());
        self
    }

    pub fn calorie_target(mut self, calories: u32) -> Self {
        self.calorie_target = Some(calories);
        self
    }

    pub fn protein_target(mut self, grams: f64) -> Self {
        self.protein_target = Some(grams);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Set one field from its string form. Lists are comma separated.
    pub fn set_field(&mut self, key: &str, value: &str) -> MemoryResult<()> {
        let value = value.trim();
        match key.trim() {
            "name" => self.name = Some(non_empty(key, value)?),
            "age" => self.age = Some(parse_number(key, value)?),
            "weight" => self.weight = Some(parse_positive(key, value)?),
            "height" => self.height = Some(parse_positive(key, value)?),
            "activity_level" => self.activity_level = Some(non_empty(key, value)?),
            "dietary_restrictions" => {
                self.dietary_restrictions = Some(split_list(value).into_iter().collect())
            }
            "goals" => self.goals = Some(split_list(value)),
            "calorie_target" => self.calorie_target = Some(parse_number(key, value)?),
            "protein_target" => self.protein_target = Some(parse_positive(key, value)?),
            "experience_level" => self.experience_level = Some(non_empty(key, value)?),
            "training_days" => self.training_days = Some(split_list(value)),
            other => {
                return Err(MemoryError::Validation(format!(
                    "Unknown profile field '{}'. Valid fields: {}",
                    other,
                    PROFILE_FIELDS.join(", ")
                )))
            }
        }
        Ok(())
    }

    /// Parse `key=value` pairs into a patch
    pub fn from_pairs<I, S>(pairs: I) -> MemoryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patch = Self::default();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                MemoryError::Validation(format!("Expected key=value, got '{}'", pair))
            })?;
            patch.set_field(key, value)?;
        }
        Ok(patch)
    }

    /// Overwrite the supplied fields of `profile`
    pub fn apply_to(&self, profile: &mut UserProfile) {
        if let Some(name) = &self.name {
            profile.name = name.clone();
        }
        if let Some(age) = self.age {
            profile.age = Some(age);
        }
        if let Some(weight) = self.weight {
            profile.weight = Some(weight);
        }
        if let Some(height) = self.height {
            profile.height = Some(height);
        }
        if let Some(level) = &self.activity_level {
            profile.activity_level = Some(level.clone());
        }
        if let Some(restrictions) = &self.dietary_restrictions {
            profile.dietary_restrictions = restrictions.clone();
        }
        if let Some(goals) = &self.goals {
            profile.goals = goals.clone();
        }
        if let Some(calories) = self.calorie_target {
            profile.calorie_target = Some(calories);
        }
        if let Some(protein) = self.protein_target {
            profile.protein_target = Some(protein);
        }
        if let Some(level) = &self.experience_level {
            profile.experience_level = level.clone();
        }
        if let Some(days) = &self.training_days {
            profile.training_days = days.clone();
        }
    }
}

fn non_empty(key: &str, value: &str) -> MemoryResult<String> {
    if value.is_empty() {
        return Err(MemoryError::Validation(format!("{} cannot be empty", key)));
    }
    Ok(value.to_string())
}

fn parse_number(key: &str, value: &str) -> MemoryResult<u32> {
    value
        .parse()
        .map_err(|_| MemoryError::Validation(format!("{} must be a whole number, got '{}'", key, value)))
}

fn parse_positive(key: &str, value: &str) -> MemoryResult<f64> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| MemoryError::Validation(format!("{} must be a number, got '{}'", key, value)))?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err(MemoryError::Validation(format!("{} must be positive, got '{}'", key, value)));
    }
    Ok(parsed)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Database statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub total_profiles: usize,
    pub total_turns: usize,
    pub users_with_turns: usize,
    /// Turn count per category wire name
    pub turn_counts: BTreeMap<String, usize>,
}
