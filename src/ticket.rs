use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use serde::{Deserialize, Serialize};

/// A matchmaking ticket as it travels through the system.
///
/// Clients submit the state/requirements/affinities part; the director
/// decorates the rest (`global_id` at submit, `timestamp_expiry_matchmaker`
/// at assignment) and the matchmaker advances `matching_failure_count`.
///
/// Serialized as protobuf when written to a stream. `state_id` is
/// whatever id the state store handed out for the *current* stream entry,
/// so it changes on every move and is rewritten after every read.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Ticket {
    #[prost(string, tag = "1")]
    pub state_id: String,

    /// Immutable once assigned by the director at submit
    #[prost(string, tag = "2")]
    pub global_id: String,

    /// Creation time, UTC microseconds
    #[prost(int64, tag = "3")]
    pub timestamp: i64,

    /// 0 = never expires
    #[prost(uint32, tag = "4")]
    pub max_age_seconds: u32,

    /// Empty string = default pool
    #[prost(string, tag = "5")]
    pub matchmaking_pool_id: String,

    /// Ordered float arrays, indexed by position from requirements
    #[prost(message, repeated, tag = "6")]
    pub state: Vec<FloatArray>,

    /// Every group must be satisfied; a group passes if any entry does
    #[prost(message, repeated, tag = "7")]
    pub requirements: Vec<RequirementGroup>,

    /// Compared pairwise by position against the other ticket's list
    #[prost(message, repeated, tag = "8")]
    pub affinities: Vec<Affinity>,

    #[prost(int32, tag = "9")]
    pub priority_base: i32,

    #[prost(float, tag = "10")]
    pub age_priority_factor: f32,

    /// Expiry in the *assigned matchmaker's* clock, UTC microseconds.
    /// Set by the director using clock compensation; 0 = never expires.
    #[prost(int64, tag = "11")]
    pub timestamp_expiry_matchmaker: i64,

    #[prost(uint32, tag = "12")]
    pub matching_failure_count: u32,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct FloatArray {
    #[prost(float, repeated, tag = "1")]
    pub values: Vec<f32>,
}

/// "Any-of" group of individual requirements
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementGroup {
    #[prost(message, repeated, tag = "1")]
    pub any: Vec<Requirement>,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirement {
    /// Index into the other ticket's state vector
    #[prost(int32, tag = "1")]
    pub key: i32,

    /// Ranged: values = [lo, hi], state[key][0] must fall inside.
    /// Discreet: any value equal to any state[key][j] passes.
    #[prost(bool, tag = "2")]
    pub ranged: bool,

    #[prost(float, repeated, tag = "3")]
    pub values: Vec<f32>,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Affinity {
    #[prost(float, tag = "1")]
    pub value: f32,

    /// Normalization span for the pairwise difference
    #[prost(float, tag = "2")]
    pub max_margin: f32,

    #[prost(bool, tag = "3")]
    pub prefer_disimilar: bool,

    /// false + fully-out-of-margin difference = hard veto on the pair
    #[prost(bool, tag = "4")]
    pub soft_margin: bool,

    #[prost(float, tag = "5")]
    pub priority_factor: f32,
}

/// A completed match: the owning ticket first, then its picked candidates
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketMatch {
    #[prost(string, tag = "1")]
    pub state_id: String,

    #[prost(string, tag = "2")]
    pub global_id: String,

    #[prost(string, repeated, tag = "3")]
    pub matched_ticket_global_ids: Vec<String>,
}

impl Ticket {
    pub fn encode_to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    pub fn decode_from(data: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(data)
    }

    /// Pool this ticket belongs to (empty string is the default pool,
    /// kept as-is so pool ids round-trip through status blobs)
    pub fn pool_id(&self) -> &str {
        &self.matchmaking_pool_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.timestamp)
            .single()
            .unwrap_or_default()
    }

    /// Age check against the *submitting* clock, used before assignment
    pub fn is_past_max_age(&self, now: DateTime<Utc>) -> bool {
        if self.max_age_seconds == 0 {
            return false;
        }
        let age_micros = now.timestamp_micros() - self.timestamp;
        age_micros > i64::from(self.max_age_seconds) * 1_000_000
    }

    /// Expiry check against the assigned matchmaker's clock, with the
    /// given tolerance (one matchmaker update delay in practice)
    pub fn is_expired_on_matchmaker(&self, now_micros: i64, tolerance_micros: i64) -> bool {
        if self.max_age_seconds == 0 || self.timestamp_expiry_matchmaker == 0 {
            return false;
        }
        now_micros > self.timestamp_expiry_matchmaker + tolerance_micros
    }
}

impl TicketMatch {
    pub fn encode_to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    pub fn decode_from(data: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(data)
    }
}
