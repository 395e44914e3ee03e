// ============================================================================
// CoachDb - Embedded Database (redb)
// ============================================================================
// Durable profiles and the append-only turn log.
// Default path: ~/.coach/memory.redb (override via COACH_DB_PATH env var)
// ============================================================================

pub mod memory;
pub mod types;

pub use memory::InMemoryStore;
pub use types::{DbStats, ProfilePatch, UserProfile, DEFAULT_PROFILE_NAME, PROFILE_FIELDS};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::memory::types::ConversationTurn;
use crate::types::{MemoryError, MemoryResult};

// Table definitions
const PROFILES: TableDefinition<&str, &[u8]> = TableDefinition::new("profiles");
const TURNS: TableDefinition<&str, &[u8]> = TableDefinition::new("turns");

/// Durable key-value store of structured profiles
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, user_id: &str) -> MemoryResult<Option<UserProfile>>;

    /// Create-or-merge in one atomic step. Sets
    /// `last_interaction = max(previous, now)`.
    async fn upsert(&self, user_id: &str, patch: &ProfilePatch) -> MemoryResult<UserProfile>;
}

/// Durable append-only store of every turn, keyed by user then timestamp
#[async_trait]
pub trait TurnLog: Send + Sync {
    async fn append(&self, turn: &ConversationTurn) -> MemoryResult<()>;

    /// Turns of `user_id` at or after `since`, oldest first
    async fn query(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> MemoryResult<Vec<ConversationTurn>>;

    /// The newest `limit` turns of `user_id`, oldest first
    async fn recent(&self, user_id: &str, limit: usize) -> MemoryResult<Vec<ConversationTurn>>;
}

/// Reject ids that would break the turn key layout
pub(crate) fn validate_user_id(user_id: &str) -> MemoryResult<()> {
    if user_id.trim().is_empty() {
        return Err(MemoryError::Validation("user_id cannot be empty".to_string()));
    }
    if user_id.contains('\0') {
        return Err(MemoryError::Validation(
            "user_id cannot contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}

fn timestamp_key(timestamp: &DateTime<Utc>) -> String {
    format!("{:020}", timestamp.timestamp_micros().max(0))
}

/// Keys are `{user_id}\0{micros:020}\0{seq:010}`: sorted by user, then
/// time, then arrival. Returns the bounds of one user's microsecond.
fn turn_slot(turn: &ConversationTurn) -> (String, String) {
    let micros = timestamp_key(&turn.timestamp);
    (
        format!("{}\0{}\0", turn.user_id, micros),
        format!("{}\0{}\u{1}", turn.user_id, micros),
    )
}

fn user_range(user_id: &str, since: Option<DateTime<Utc>>) -> (String, String) {
    let start = match since {
        Some(ts) => format!("{}\0{}", user_id, timestamp_key(&ts)),
        None => format!("{}\0", user_id),
    };
    (start, format!("{}\u{1}", user_id))
}

/// Default database location, creating `~/.coach` if needed
pub fn default_db_path() -> MemoryResult<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        MemoryError::Configuration("Cannot determine home directory".to_string())
    })?;
    let coach_dir = home.join(".coach");
    std::fs::create_dir_all(&coach_dir).map_err(|e| {
        MemoryError::Configuration(format!("Failed to create .coach directory: {}", e))
    })?;
    Ok(coach_dir.join("memory.redb"))
}

fn decode_profile(bytes: &[u8]) -> MemoryResult<UserProfile> {
    bincode::deserialize(bytes)
        .map_err(|e| MemoryError::Serialization(format!("Failed to deserialize profile: {}", e)))
}

fn decode_turn(bytes: &[u8]) -> MemoryResult<ConversationTurn> {
    bincode::deserialize(bytes)
        .map_err(|e| MemoryError::Serialization(format!("Failed to deserialize turn: {}", e)))
}

/// Embedded database for profiles and the turn log
#[derive(Clone)]
pub struct CoachDb {
    db: Arc<Database>,
    path: PathBuf,
}

impl CoachDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses ~/.coach/memory.redb
    pub fn open(path: Option<&Path>) -> MemoryResult<Self> {
        let db_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_db_path()?,
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| MemoryError::storage("Failed to open database", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| MemoryError::storage("Failed to begin write", e))?;
        {
            let _ = write_txn
                .open_table(PROFILES)
                .map_err(|e| MemoryError::storage("Failed to create profiles table", e))?;
            let _ = write_txn
                .open_table(TURNS)
                .map_err(|e| MemoryError::storage("Failed to create turns table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| MemoryError::storage("Failed to commit init", e))?;

        info!("Database ready");

        Ok(Self {
            db: Arc::new(db),
            path: db_path,
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Profile Operations
    // ========================================================================

    pub fn get_profile(&self, user_id: &str) -> MemoryResult<Option<UserProfile>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| MemoryError::storage("Failed to begin read", e))?;
        let table = read_txn
            .open_table(PROFILES)
            .map_err(|e| MemoryError::storage("Failed to open profiles table", e))?;

        match table
            .get(user_id)
            .map_err(|e| MemoryError::storage("Failed to get profile", e))?
        {
            Some(value) => Ok(Some(decode_profile(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn upsert_profile(
        &self,
        user_id: &str,
        patch: &ProfilePatch,
        now: DateTime<Utc>,
    ) -> MemoryResult<UserProfile> {
        validate_user_id(user_id)?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| MemoryError::storage("Failed to begin write", e))?;
        let profile;
        {
            let mut table = write_txn
                .open_table(PROFILES)
                .map_err(|e| MemoryError::storage("Failed to open profiles table", e))?;

            let existing = match table
                .get(user_id)
                .map_err(|e| MemoryError::storage("Failed to get profile", e))?
            {
                Some(value) => Some(decode_profile(value.value())?),
                None => None,
            };

            let created = existing.is_none();
            let mut merged = existing.unwrap_or_else(|| UserProfile::new(user_id, now));
            patch.apply_to(&mut merged);
            merged.last_interaction = merged.last_interaction.max(now);

            let value = bincode::serialize(&merged).map_err(|e| {
                MemoryError::Serialization(format!("Failed to serialize profile: {}", e))
            })?;
            table
                .insert(user_id, value.as_slice())
                .map_err(|e| MemoryError::storage("Failed to insert profile", e))?;

            if created {
                debug!("Created profile for user: {}", user_id);
            }
            profile = merged;
        }
        write_txn
            .commit()
            .map_err(|e| MemoryError::storage("Failed to commit", e))?;

        debug!("Upserted profile: {}", user_id);
        Ok(profile)
    }

    pub fn list_profiles(&self) -> MemoryResult<Vec<UserProfile>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| MemoryError::storage("Failed to begin read", e))?;
        let table = read_txn
            .open_table(PROFILES)
            .map_err(|e| MemoryError::storage("Failed to open profiles table", e))?;

        let mut results = Vec::new();
        let iter = table
            .range::<&str>(..)
            .map_err(|e| MemoryError::storage("Failed to iterate profiles", e))?;
        for entry in iter {
            let (_key, value) =
                entry.map_err(|e| MemoryError::storage("Failed to read entry", e))?;
            results.push(decode_profile(value.value())?);
        }
        Ok(results)
    }

    // ========================================================================
    // Turn Log Operations
    // ========================================================================

    pub fn append_turn(&self, turn: &ConversationTurn) -> MemoryResult<()> {
        validate_user_id(&turn.user_id)?;

        let (slot_start, slot_end) = turn_slot(turn);
        let value = bincode::serialize(turn)
            .map_err(|e| MemoryError::Serialization(format!("Failed to serialize turn: {}", e)))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| MemoryError::storage("Failed to begin write", e))?;
        {
            let mut table = write_txn
                .open_table(TURNS)
                .map_err(|e| MemoryError::storage("Failed to open turns table", e))?;

            // next sequence number within this microsecond
            let seq = {
                let mut slot = table
                    .range::<&str>(slot_start.as_str()..slot_end.as_str())
                    .map_err(|e| MemoryError::storage("Failed to iterate turns", e))?;
                match slot.next_back() {
                    Some(entry) => {
                        let (key, _value) =
                            entry.map_err(|e| MemoryError::storage("Failed to read entry", e))?;
                        key.value()
                            .rsplit('\0')
                            .next()
                            .and_then(|seq| seq.parse::<u64>().ok())
                            .map_or(0, |seq| seq + 1)
                    }
                    None => 0,
                }
            };

            let key = format!("{}{:010}", slot_start, seq);
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(|e| MemoryError::storage("Failed to insert turn", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| MemoryError::storage("Failed to commit", e))?;

        debug!("Logged {} turn for user: {}", turn.memory_type, turn.user_id);
        Ok(())
    }

    pub fn query_turns(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> MemoryResult<Vec<ConversationTurn>> {
        let (start, end) = user_range(user_id, since);

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| MemoryError::storage("Failed to begin read", e))?;
        let table = read_txn
            .open_table(TURNS)
            .map_err(|e| MemoryError::storage("Failed to open turns table", e))?;

        let mut results = Vec::new();
        let iter = table
            .range::<&str>(start.as_str()..end.as_str())
            .map_err(|e| MemoryError::storage("Failed to iterate turns", e))?;
        for entry in iter {
            let (_key, value) =
                entry.map_err(|e| MemoryError::storage("Failed to read entry", e))?;
            results.push(decode_turn(value.value())?);
        }
        Ok(results)
    }

    pub fn recent_turns(&self, user_id: &str, limit: usize) -> MemoryResult<Vec<ConversationTurn>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let (start, end) = user_range(user_id, None);

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| MemoryError::storage("Failed to begin read", e))?;
        let table = read_txn
            .open_table(TURNS)
            .map_err(|e| MemoryError::storage("Failed to open turns table", e))?;

        let mut results = Vec::with_capacity(limit);
        let iter = table
            .range::<&str>(start.as_str()..end.as_str())
            .map_err(|e| MemoryError::storage("Failed to iterate turns", e))?;
        for entry in iter.rev().take(limit) {
            let (_key, value) =
                entry.map_err(|e| MemoryError::storage("Failed to read entry", e))?;
            results.push(decode_turn(value.value())?);
        }
        results.reverse();
        Ok(results)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> MemoryResult<DbStats> {
        let total_profiles = self.list_profiles()?.len();

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| MemoryError::storage("Failed to begin read", e))?;
        let table = read_txn
            .open_table(TURNS)
            .map_err(|e| MemoryError::storage("Failed to open turns table", e))?;

        let mut stats = DbStats {
            total_profiles,
            ..Default::default()
        };
        let mut users = HashSet::new();
        let iter = table
            .range::<&str>(..)
            .map_err(|e| MemoryError::storage("Failed to iterate turns", e))?;
        for entry in iter {
            let (_key, value) =
                entry.map_err(|e| MemoryError::storage("Failed to read entry", e))?;
            let turn = decode_turn(value.value())?;
            stats.total_turns += 1;
            *stats
                .turn_counts
                .entry(turn.memory_type.as_str().to_string())
                .or_insert(0) += 1;
            users.insert(turn.user_id);
        }
        stats.users_with_turns = users.len();
        Ok(stats)
    }

    /// Run blocking database work on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> MemoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(CoachDb) -> MemoryResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| MemoryError::storage("Database task failed", e))?
    }
}

#[async_trait]
impl ProfileStore for CoachDb {
    async fn get(&self, user_id: &str) -> MemoryResult<Option<UserProfile>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.get_profile(&user_id)).await
    }

    async fn upsert(&self, user_id: &str, patch: &ProfilePatch) -> MemoryResult<UserProfile> {
        let user_id = user_id.to_string();
        let patch = patch.clone();
        self.blocking(move |db| db.upsert_profile(&user_id, &patch, Utc::now()))
            .await
    }
}

#[async_trait]
impl TurnLog for CoachDb {
    async fn append(&self, turn: &ConversationTurn) -> MemoryResult<()> {
        let turn = turn.clone();
        self.blocking(move |db| db.append_turn(&turn)).await
    }

    async fn query(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> MemoryResult<Vec<ConversationTurn>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.query_turns(&user_id, since)).await
    }

    async fn recent(&self, user_id: &str, limit: usize) -> MemoryResult<Vec<ConversationTurn>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.recent_turns(&user_id, limit)).await
    }
}
