pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use memory::MemoryState;
pub use redis::RedisState;

/// Id the state store assigned to one stream entry.
/// A uuid in the in-process backend, an XADD id ("1526919030474-0")
/// against Redis. Opaque either way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateId(pub String);

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    None,
    String,
    Stream,
    Set,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The key exists but holds a different kind of value
    #[error("key {0} holds a different kind of value")]
    WrongKind(String),

    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Typed key/value capability shared by both roles.
///
/// All operations are asynchronous and may suspend. Batched variants
/// must minimize round-trips; where an operation is per-element the
/// batch result is a parallel array so individual failures can be told
/// apart without aborting the whole call.
#[async_trait]
pub trait State: Send + Sync + 'static {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StateError>;

    /// `None` value removes the key. `ttl` of `None` means no expiry.
    async fn set_string(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<(), StateError>;

    async fn stream_add(&self, key: &str, data: Bytes) -> Result<StateId, StateError>;

    /// Parallel result array: `None` marks an entry that failed to land
    async fn stream_add_batch(
        &self,
        key: &str,
        datas: &[Bytes],
    ) -> Result<Vec<Option<StateId>>, StateError>;

    /// Oldest first. `max_count` of `None` reads the whole stream.
    async fn stream_read(
        &self,
        key: &str,
        max_count: Option<usize>,
    ) -> Result<Vec<(StateId, Bytes)>, StateError>;

    async fn stream_delete(&self, key: &str) -> Result<(), StateError>;

    /// Returns how many of the given entries were actually removed
    async fn stream_delete_messages(
        &self,
        key: &str,
        ids: &[StateId],
    ) -> Result<usize, StateError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StateError>;

    async fn set_add_batch(&self, key: &str, members: &[String])
        -> Result<Vec<bool>, StateError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StateError>;

    async fn set_remove_batch(
        &self,
        key: &str,
        members: &[String],
    ) -> Result<Vec<bool>, StateError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StateError>;

    async fn set_contains_batch(
        &self,
        key: &str,
        members: &[String],
    ) -> Result<Vec<bool>, StateError>;

    async fn get_set_values(&self, key: &str) -> Result<Vec<String>, StateError>;

    async fn key_delete(&self, key: &str) -> Result<(), StateError>;

    async fn key_type(&self, key: &str) -> Result<KeyKind, StateError>;
}

/// Well-known keys of the director/matchmaker protocol
pub mod keys {
    /// Stream of serialized `TicketMatch`
    pub const MATCHES: &str = "matches";

    /// Stream of serialized `Ticket` awaiting assignment
    pub const TICKETS_UNASSIGNED: &str = "tickets_unassigned";

    /// Stream where matchmakers park used tickets
    pub const CONSUMED_TICKETS: &str = "consumed_tickets";

    /// Set of active matchmaker ids
    pub const MATCHMAKERS: &str = "matchmakers";

    /// Set of ticket global ids currently live in the system
    pub const TICKETS_SUBMITTED: &str = "tickets_submitted";

    /// Leader lease string, TTL = max downtime
    pub const DIRECTOR_IS_ACTIVE: &str = "director_is_active";

    /// Per-matchmaker assigned stream, written by the director only
    pub fn assigned_stream(matchmaker_id: &str) -> String {
        format!("tickets_{matchmaker_id}")
    }

    /// Optional per-pool match size configuration string
    pub fn pool_match_size(pool_id: &str) -> String {
        format!("pool_match_size_{pool_id}")
    }
}
