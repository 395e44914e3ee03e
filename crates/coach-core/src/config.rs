//! ============================================================================
//! Coach Configuration
//! ============================================================================
//! Every knob is read from the environment (the binary loads `.env` first).
//! `from_lookup` takes any key lookup so tests never touch process env.
//! ============================================================================

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::memory::embeddings::{DEFAULT_EMBEDDING_MODEL, EMBEDDING_DIM, OPENAI_BASE_URL};
use crate::memory::store::COLLECTION_NAME;
use crate::memory::window::DEFAULT_WINDOW_CAPACITY;
use crate::retry::RetryConfig;
use crate::types::{MemoryError, MemoryResult};

pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// Where profiles and the turn log live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Redb,
    Memory,
}

/// Which semantic index implementation to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    Qdrant,
    Memory,
    /// Keyword fallback only
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    OpenAi,
    Hashing,
}

impl FromStr for StorageBackend {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redb" => Ok(StorageBackend::Redb),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(MemoryError::Configuration(format!(
                "Unknown COACH_STORAGE '{}'. Valid values: redb, memory",
                other
            ))),
        }
    }
}

impl FromStr for IndexBackend {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "qdrant" => Ok(IndexBackend::Qdrant),
            "memory" => Ok(IndexBackend::Memory),
            "none" | "off" | "disabled" => Ok(IndexBackend::None),
            other => Err(MemoryError::Configuration(format!(
                "Unknown COACH_INDEX '{}'. Valid values: qdrant, memory, none",
                other
            ))),
        }
    }
}

impl FromStr for EmbeddingBackend {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(EmbeddingBackend::OpenAi),
            "hashing" | "local" => Ok(EmbeddingBackend::Hashing),
            other => Err(MemoryError::Configuration(format!(
                "Unknown COACH_EMBEDDINGS '{}'. Valid values: openai, hashing",
                other
            ))),
        }
    }
}

impl EmbeddingBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingBackend::OpenAi => "openai",
            EmbeddingBackend::Hashing => "hashing",
        }
    }
}

/// Runtime configuration for the memory subsystem
#[derive(Debug, Clone)]
pub struct CoachConfig {
    pub storage: StorageBackend,
    /// None means ~/.coach/memory.redb
    pub db_path: Option<PathBuf>,
    pub index: IndexBackend,
    pub qdrant_url: String,
    pub collection: String,
    pub embeddings: EmbeddingBackend,
    pub openai_api_key: Option<String>,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub llm_base_url: String,
    pub llm_model: String,
    pub window_capacity: usize,
    /// Memories included per context
    pub memory_k: usize,
    /// Recent turns scanned by the keyword fallback
    pub fallback_candidates: usize,
    pub backend_timeout_ms: u64,
    pub max_retries: u32,
    pub llm_timeout_ms: u64,
    pub turn_deadline_ms: u64,
    pub defer_index_writes: bool,
    pub max_sessions: usize,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Redb,
            db_path: None,
            index: IndexBackend::Memory,
            qdrant_url: DEFAULT_QDRANT_URL.to_string(),
            collection: COLLECTION_NAME.to_string(),
            embeddings: EmbeddingBackend::Hashing,
            openai_api_key: None,
            embedding_base_url: OPENAI_BASE_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dim: EMBEDDING_DIM,
            llm_base_url: OPENAI_BASE_URL.to_string(),
            llm_model: DEFAULT_CHAT_MODEL.to_string(),
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            memory_k: 3,
            fallback_candidates: 50,
            backend_timeout_ms: 5000,
            max_retries: 3,
            llm_timeout_ms: 30_000,
            turn_deadline_ms: 45_000,
            defer_index_writes: true,
            max_sessions: 10_000,
        }
    }
}

impl CoachConfig {
    /// Read configuration from process environment variables
    pub fn from_env() -> MemoryResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> MemoryResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let openai_api_key = get("OPENAI_API_KEY");
        let qdrant_url = get("QDRANT_URL");

        let index = match get("COACH_INDEX") {
            Some(raw) => raw.parse()?,
            None if qdrant_url.is_some() => IndexBackend::Qdrant,
            None => IndexBackend::Memory,
        };
        let embeddings = match get("COACH_EMBEDDINGS") {
            Some(raw) => raw.parse()?,
            None if openai_api_key.is_some() => EmbeddingBackend::OpenAi,
            None => EmbeddingBackend::Hashing,
        };

        let config = Self {
            storage: get("COACH_STORAGE")
                .map(|raw| raw.parse())
                .transpose()?
                .unwrap_or(defaults.storage),
            db_path: get("COACH_DB_PATH").map(PathBuf::from),
            index,
            qdrant_url: qdrant_url.unwrap_or(defaults.qdrant_url),
            collection: get("COACH_COLLECTION").unwrap_or(defaults.collection),
            embeddings,
            openai_api_key,
            embedding_base_url: get("COACH_EMBEDDING_BASE_URL").unwrap_or(defaults.embedding_base_url),
            embedding_model: get("COACH_EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            embedding_dim: parse_or(&get, "COACH_EMBEDDING_DIM", defaults.embedding_dim)?,
            llm_base_url: get("COACH_LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_model: get("COACH_LLM_MODEL").unwrap_or(defaults.llm_model),
            window_capacity: parse_or(&get, "COACH_WINDOW_CAPACITY", defaults.window_capacity)?,
            memory_k: parse_or(&get, "COACH_MEMORY_K", defaults.memory_k)?,
            fallback_candidates: parse_or(&get, "COACH_FALLBACK_CANDIDATES", defaults.fallback_candidates)?,
            backend_timeout_ms: parse_or(&get, "COACH_BACKEND_TIMEOUT_MS", defaults.backend_timeout_ms)?,
            max_retries: parse_or(&get, "COACH_MAX_RETRIES", defaults.max_retries)?,
            llm_timeout_ms: parse_or(&get, "COACH_LLM_TIMEOUT_MS", defaults.llm_timeout_ms)?,
            turn_deadline_ms: parse_or(&get, "COACH_TURN_DEADLINE_MS", defaults.turn_deadline_ms)?,
            defer_index_writes: parse_bool_or(&get, "COACH_DEFER_INDEX_WRITES", defaults.defer_index_writes)?,
            max_sessions: parse_or(&get, "COACH_MAX_SESSIONS", defaults.max_sessions)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject zero capacities and missing credentials for selected backends
    pub fn validate(&self) -> MemoryResult<()> {
        let positive = [
            ("COACH_EMBEDDING_DIM", self.embedding_dim as u64),
            ("COACH_WINDOW_CAPACITY", self.window_capacity as u64),
            ("COACH_MEMORY_K", self.memory_k as u64),
            ("COACH_BACKEND_TIMEOUT_MS", self.backend_timeout_ms),
            ("COACH_MAX_RETRIES", self.max_retries as u64),
            ("COACH_LLM_TIMEOUT_MS", self.llm_timeout_ms),
            ("COACH_TURN_DEADLINE_MS", self.turn_deadline_ms),
            ("COACH_MAX_SESSIONS", self.max_sessions as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(MemoryError::Configuration(format!("{} must be greater than 0", key)));
            }
        }

        if self.embeddings == EmbeddingBackend::OpenAi && self.openai_api_key.is_none() {
            return Err(MemoryError::Configuration(
                "COACH_EMBEDDINGS=openai requires OPENAI_API_KEY".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry policy for embedding, index and storage calls
    pub fn backend_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries,
            attempt_timeout_ms: self.backend_timeout_ms,
            ..Default::default()
        }
    }

    /// Retry policy for the language model
    pub fn llm_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries,
            attempt_timeout_ms: self.llm_timeout_ms,
            base_delay_ms: 500,
            max_delay_ms: 5000,
            ..Default::default()
        }
    }

    pub fn turn_deadline(&self) -> Duration {
        Duration::from_millis(self.turn_deadline_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> MemoryResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| MemoryError::Configuration(format!("Invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> MemoryResult<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(MemoryError::Configuration(format!(
            "Invalid {} '{}': expected true or false",
            key, v
        ))),
        None => Ok(default),
    }
}
