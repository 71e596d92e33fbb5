use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::Value;

use super::{KeyKind, State, StateError, StateId};

/// Field name under which payload bytes live in a stream entry
const DATA_FIELD: &str = "d";

/// Redis backend.
///
/// Strings map to STRING (SET with PX for TTL), sets to SET, streams to
/// XADD/XRANGE/XDEL. No consumer groups: the director owns all
/// assignment logic, so there is nothing to ack or claim. Every batched
/// call is a single pipeline round-trip.
pub struct RedisState {
    conn: ConnectionManager,
}

impl RedisState {
    pub async fn connect(connection_string: &str) -> Result<Self, StateError> {
        let client = redis::Client::open(connection_string)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

/// XRANGE reply: array of `[id, [field, value, ...]]` entries
fn parse_stream_entries(value: Value) -> Vec<(StateId, Bytes)> {
    let mut out = Vec::new();
    let Value::Array(entries) = value else {
        return out;
    };
    for entry in entries {
        let Value::Array(mut parts) = entry else {
            continue;
        };
        if parts.len() != 2 {
            continue;
        }
        let fields = parts.pop().expect("len checked");
        let id = match parts.pop().expect("len checked") {
            Value::BulkString(raw) => String::from_utf8_lossy(&raw).into_owned(),
            Value::SimpleString(s) => s,
            _ => continue,
        };
        let Value::Array(kvs) = fields else {
            continue;
        };
        let mut i = 0;
        while i + 1 < kvs.len() {
            let is_data = matches!(&kvs[i], Value::BulkString(name) if name == DATA_FIELD.as_bytes());
            if is_data {
                if let Value::BulkString(data) = &kvs[i + 1] {
                    out.push((StateId(id.clone()), Bytes::copy_from_slice(data)));
                }
            }
            i += 2;
        }
    }
    out
}

#[async_trait]
impl State for RedisState {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StateError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await?)
    }

    async fn set_string(
        &self,
        key: &str,
        value: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        match value {
            None => {
                redis::cmd("DEL")
                    .arg(key)
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            Some(value) => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key).arg(value);
                if let Some(ttl) = ttl {
                    cmd.arg("PX").arg(ttl.as_millis() as u64);
                }
                cmd.query_async::<()>(&mut conn).await?;
            }
        }
        Ok(())
    }

    async fn stream_add(&self, key: &str, data: Bytes) -> Result<StateId, StateError> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(key)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(data.as_ref())
            .query_async(&mut conn)
            .await?;
        Ok(StateId(id))
    }

    async fn stream_add_batch(
        &self,
        key: &str,
        datas: &[Bytes],
    ) -> Result<Vec<Option<StateId>>, StateError> {
        if datas.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for data in datas {
            pipe.cmd("XADD")
                .arg(key)
                .arg("*")
                .arg(DATA_FIELD)
                .arg(data.as_ref());
        }
        // Per-entry outcome: XADD replies with the new id, or an error
        // value for that entry alone
        let replies: Vec<Value> = pipe.query_async(&mut conn).await?;
        Ok(replies
            .into_iter()
            .map(|reply| match reply {
                Value::BulkString(raw) => {
                    Some(StateId(String::from_utf8_lossy(&raw).into_owned()))
                }
                Value::SimpleString(s) => Some(StateId(s)),
                _ => None,
            })
            .collect())
    }

    async fn stream_read(
        &self,
        key: &str,
        max_count: Option<usize>,
    ) -> Result<Vec<(StateId, Bytes)>, StateError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(key).arg("-").arg("+");
        if let Some(count) = max_count {
            cmd.arg("COUNT").arg(count);
        }
        let value: Value = cmd.query_async(&mut conn).await?;
        Ok(parse_stream_entries(value))
    }

    async fn stream_delete(&self, key: &str) -> Result<(), StateError> {
        self.key_delete(key).await
    }

    async fn stream_delete_messages(
        &self,
        key: &str,
        ids: &[StateId],
    ) -> Result<usize, StateError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XDEL");
        cmd.arg(key);
        for id in ids {
            cmd.arg(&id.0);
        }
        let removed: usize = cmd.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StateError> {
        let mut conn = self.conn.clone();
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added != 0)
    }

    async fn set_add_batch(
        &self,
        key: &str,
        members: &[String],
    ) -> Result<Vec<bool>, StateError> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for member in members {
            pipe.cmd("SADD").arg(key).arg(member);
        }
        let replies: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(replies.into_iter().map(|n| n != 0).collect())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StateError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed != 0)
    }

    async fn set_remove_batch(
        &self,
        key: &str,
        members: &[String],
    ) -> Result<Vec<bool>, StateError> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for member in members {
            pipe.cmd("SREM").arg(key).arg(member);
        }
        let replies: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(replies.into_iter().map(|n| n != 0).collect())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StateError> {
        let mut conn = self.conn.clone();
        let contained: i64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(contained != 0)
    }

    async fn set_contains_batch(
        &self,
        key: &str,
        members: &[String],
    ) -> Result<Vec<bool>, StateError> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SMISMEMBER");
        cmd.arg(key);
        for member in members {
            cmd.arg(member);
        }
        let replies: Vec<i64> = cmd.query_async(&mut conn).await?;
        Ok(replies.into_iter().map(|n| n != 0).collect())
    }

    async fn get_set_values(&self, key: &str) -> Result<Vec<String>, StateError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("SMEMBERS")
            .arg(key)
            .query_async::<Vec<String>>(&mut conn)
            .await?)
    }

    async fn key_delete(&self, key: &str) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn key_type(&self, key: &str) -> Result<KeyKind, StateError> {
        let mut conn = self.conn.clone();
        let kind: String = redis::cmd("TYPE").arg(key).query_async(&mut conn).await?;
        Ok(match kind.as_str() {
            "string" => KeyKind::String,
            "stream" => KeyKind::Stream,
            "set" => KeyKind::Set,
            _ => KeyKind::None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_xrange_reply_shape() {
        let value = Value::Array(vec![Value::Array(vec![
            Value::BulkString(b"1526919030474-0".to_vec()),
            Value::Array(vec![
                Value::BulkString(b"d".to_vec()),
                Value::BulkString(b"payload".to_vec()),
            ]),
        ])]);
        let entries = parse_stream_entries(value);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0 .0, "1526919030474-0");
        assert_eq!(entries[0].1.as_ref(), b"payload");
    }

    #[test]
    fn skips_malformed_entries() {
        let value = Value::Array(vec![
            Value::Int(3),
            Value::Array(vec![Value::BulkString(b"id-only".to_vec())]),
        ]);
        assert!(parse_stream_entries(value).is_empty());
    }
}
