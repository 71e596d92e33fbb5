use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

use super::{KeyKind, State, StateError, StateId};

/// Cadence of the expired-string sweeper
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Tagged value for one key
enum Entry {
    String {
        value: String,
        expires_at: Option<Instant>,
    },
    Stream(VecDeque<(StateId, Bytes)>),
    Set(HashSet<String>),
}

impl Entry {
    fn kind(&self) -> KeyKind {
        match self {
            Entry::String { .. } => KeyKind::String,
            Entry::Stream(_) => KeyKind::Stream,
            Entry::Set(_) => KeyKind::Set,
        }
    }

    /// Strings with a TTL count as gone once the deadline passes
    fn is_expired(&self, now: Instant) -> bool {
        matches!(
            self,
            Entry::String {
                expires_at: Some(at),
                ..
            } if *at <= now
        )
    }
}

/// In-process backend: one concurrent map of tagged entries.
///
/// TTL is enforced twice over: reads treat an expired string as absent
/// and drop it on sight, and a sweeper task clears entries nobody reads
/// again (a crashed matchmaker's status key, a stale lease). Streams
/// preserve insertion order; sets auto-remove on last member removal.
pub struct MemoryState {
    entries: Arc<DashMap<String, Entry>>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl MemoryState {
    /// Must be created inside a tokio runtime (the sweeper is spawned
    /// right away)
    pub fn new() -> Self {
        let entries: Arc<DashMap<String, Entry>> = Arc::default();
        let sweeper = tokio::spawn({
            let entries = entries.clone();
            async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    let now = Instant::now();
                    entries.retain(|_, entry| !entry.is_expired(now));
                }
            }
        });
        Self { entries, sweeper }
    }

    /// Drop the entry if it is an expired string, then hand back whether
    /// anything is (still) there
    fn purge_expired(&self, key: &str) -> bool {
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .map(|e| e.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
        }
        self.entries.contains_key(key)
    }

    #[cfg(test)]
    fn holds_entry(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl Default for MemoryState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryState {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[async_trait]
impl State for MemoryState {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StateError> {
        if !self.purge_expired(key) {
            return Ok(None);
        }
        match self.entries.get(key).as_deref() {
            Some(Entry::String { value, .. }) => Ok(Some(value.clone())),
            Some(_) => Err(StateError::WrongKind(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set_string(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        match value {
            None => {
                self.entries.remove(key);
            }
            Some(value) => {
                self.entries.insert(
                    key.to_string(),
                    Entry::String {
                        value: value.to_string(),
                        expires_at: ttl.map(|ttl| Instant::now() + ttl),
                    },
                );
            }
        }
        Ok(())
    }

    async fn stream_add(&self, key: &str, data: Bytes) -> Result<StateId, StateError> {
        let id = StateId(Uuid::new_v4().to_string());
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Stream(VecDeque::new()));
        match entry.value_mut() {
            Entry::Stream(messages) => {
                messages.push_back((id.clone(), data));
                Ok(id)
            }
            _ => Err(StateError::WrongKind(key.to_string())),
        }
    }

    async fn stream_add_batch(
        &self,
        key: &str,
        datas: &[Bytes],
    ) -> Result<Vec<Option<StateId>>, StateError> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Stream(VecDeque::new()));
        match entry.value_mut() {
            Entry::Stream(messages) => Ok(datas
                .iter()
                .map(|data| {
                    let id = StateId(Uuid::new_v4().to_string());
                    messages.push_back((id.clone(), data.clone()));
                    Some(id)
                })
                .collect()),
            _ => Err(StateError::WrongKind(key.to_string())),
        }
    }

    async fn stream_read(
        &self,
        key: &str,
        max_count: Option<usize>,
    ) -> Result<Vec<(StateId, Bytes)>, StateError> {
        match self.entries.get(key).as_deref() {
            Some(Entry::Stream(messages)) => {
                let take = max_count.unwrap_or(messages.len());
                Ok(messages.iter().take(take).cloned().collect())
            }
            Some(_) => Err(StateError::WrongKind(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn stream_delete(&self, key: &str) -> Result<(), StateError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn stream_delete_messages(
        &self,
        key: &str,
        ids: &[StateId],
    ) -> Result<usize, StateError> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(0);
        };
        match entry.value_mut() {
            Entry::Stream(messages) => {
                let before = messages.len();
                let remove: HashSet<&StateId> = ids.iter().collect();
                messages.retain(|(id, _)| !remove.contains(id));
                Ok(before - messages.len())
            }
            _ => Err(StateError::WrongKind(key.to_string())),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StateError> {
        Ok(self.set_add_batch(key, &[member.to_string()]).await?[0])
    }

    async fn set_add_batch(
        &self,
        key: &str,
        members: &[String],
    ) -> Result<Vec<bool>, StateError> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(HashSet::new()));
        match entry.value_mut() {
            Entry::Set(set) => Ok(members.iter().map(|m| set.insert(m.clone())).collect()),
            _ => Err(StateError::WrongKind(key.to_string())),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StateError> {
        Ok(self.set_remove_batch(key, &[member.to_string()]).await?[0])
    }

    async fn set_remove_batch(
        &self,
        key: &str,
        members: &[String],
    ) -> Result<Vec<bool>, StateError> {
        let removed;
        let now_empty;
        match self.entries.get_mut(key).as_deref_mut() {
            Some(Entry::Set(set)) => {
                removed = members.iter().map(|m| set.remove(m)).collect();
                now_empty = set.is_empty();
            }
            Some(_) => return Err(StateError::WrongKind(key.to_string())),
            None => return Ok(vec![false; members.len()]),
        }
        // Empty set is auto-removed on last remove
        if now_empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StateError> {
        Ok(self.set_contains_batch(key, &[member.to_string()]).await?[0])
    }

    async fn set_contains_batch(
        &self,
        key: &str,
        members: &[String],
    ) -> Result<Vec<bool>, StateError> {
        match self.entries.get(key).as_deref() {
            Some(Entry::Set(set)) => Ok(members.iter().map(|m| set.contains(m)).collect()),
            Some(_) => Err(StateError::WrongKind(key.to_string())),
            None => Ok(vec![false; members.len()]),
        }
    }

    async fn get_set_values(&self, key: &str) -> Result<Vec<String>, StateError> {
        match self.entries.get(key).as_deref() {
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StateError::WrongKind(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn key_delete(&self, key: &str) -> Result<(), StateError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn key_type(&self, key: &str) -> Result<KeyKind, StateError> {
        if !self.purge_expired(key) {
            return Ok(KeyKind::None);
        }
        Ok(self
            .entries
            .get(key)
            .map(|e| e.kind())
            .unwrap_or(KeyKind::None))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn string_ttl_expires() {
        let state = MemoryState::new();
        state
            .set_string("lease", Some("Active"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(
            state.get_string("lease").await.unwrap().as_deref(),
            Some("Active")
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(state.get_string("lease").await.unwrap(), None);
        assert_eq!(state.key_type("lease").await.unwrap(), KeyKind::None);
    }

    #[tokio::test]
    async fn sweeper_drops_expired_strings_without_access() {
        let state = MemoryState::new();
        state
            .set_string("ghost", Some("v"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(state.holds_entry("ghost"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        // Gone without anyone ever reading the key back
        assert!(!state.holds_entry("ghost"));
    }

    #[tokio::test]
    async fn set_string_none_removes() {
        let state = MemoryState::new();
        state.set_string("k", Some("v"), None).await.unwrap();
        state.set_string("k", None, None).await.unwrap();
        assert_eq!(state.get_string("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_preserves_order_and_deletes_by_id() {
        let state = MemoryState::new();
        let a = state.stream_add("s", Bytes::from_static(b"a")).await.unwrap();
        let _b = state.stream_add("s", Bytes::from_static(b"b")).await.unwrap();
        let c = state.stream_add("s", Bytes::from_static(b"c")).await.unwrap();

        let read = state.stream_read("s", None).await.unwrap();
        assert_eq!(
            read.iter().map(|(_, d)| d.as_ref()).collect::<Vec<_>>(),
            vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]
        );

        let removed = state
            .stream_delete_messages("s", &[a, c.clone()])
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let read = state.stream_read("s", Some(10)).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].1.as_ref(), b"b");

        // Deleting already-deleted ids removes nothing
        assert_eq!(state.stream_delete_messages("s", &[c]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stream_read_caps_at_max_count() {
        let state = MemoryState::new();
        for i in 0..5u8 {
            state.stream_add("s", Bytes::from(vec![i])).await.unwrap();
        }
        assert_eq!(state.stream_read("s", Some(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_set_is_removed_on_last_member() {
        let state = MemoryState::new();
        assert!(state.set_add("set", "m").await.unwrap());
        assert!(!state.set_add("set", "m").await.unwrap());
        assert!(state.set_contains("set", "m").await.unwrap());
        assert!(state.set_remove("set", "m").await.unwrap());
        assert_eq!(state.key_type("set").await.unwrap(), KeyKind::None);
    }

    #[tokio::test]
    async fn batch_results_are_parallel_arrays() {
        let state = MemoryState::new();
        let members = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(
            state.set_add_batch("set", &members).await.unwrap(),
            vec![true, true, false]
        );
        assert_eq!(
            state
                .set_contains_batch("set", &["a".to_string(), "x".to_string()])
                .await
                .unwrap(),
            vec![true, false]
        );
    }

    #[tokio::test]
    async fn wrong_kind_is_an_error() {
        let state = MemoryState::new();
        state.set_string("k", Some("v"), None).await.unwrap();
        assert!(matches!(
            state.stream_add("k", Bytes::new()).await,
            Err(StateError::WrongKind(_))
        ));
        assert!(matches!(
            state.set_add("k", "m").await,
            Err(StateError::WrongKind(_))
        ));
    }
}
