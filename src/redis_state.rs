//! Cluster-shared cursors and registrations in the coordination Redis.
//!
//! Leadership moves between nodes, so the state a leader resumes from has
//! to live where every node can read it.
//!
//! # Keys
//!
//! ```text
//! {prefix}cursors:keys       HASH  name → content key URL
//! {prefix}cursors:sequences  HASH  name → sequence, zero-padded to 20 digits
//! {prefix}registry:groups    HASH  group name → group JSON
//! {prefix}registry:domains   HASH  domain → replication domain JSON
//! ```
//!
//! Both cursor forms sort bytewise in position order, so one script
//! advances either hash. The comparison is done byte by byte in Lua because
//! string `<` there follows the server locale.

use crate::content_key::ContentKey;
use crate::cursor::CursorBackend;
use crate::error::{BoxFuture, HubError, Result};
use crate::leadership::RedisCoordination;
use crate::registry::{Collection, RegistrationStore};
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use tracing::warn;

const ADVANCE_SCRIPT: &str = r#"
local function greater(a, b)
    local n = math.min(#a, #b)
    for i = 1, n do
        local x, y = string.byte(a, i), string.byte(b, i)
        if x ~= y then
            return x > y
        end
    end
    return #a > #b
end

local current = redis.call('HGET', KEYS[1], ARGV[1])
if (not current) or greater(ARGV[2], current) then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
    return 1
end
return 0
"#;

fn sequence_field(sequence: u64) -> String {
    format!("{:020}", sequence)
}

/// [`CursorBackend`] over two Redis hashes.
pub struct RedisCursors {
    conn: ConnectionManager,
    keys: String,
    sequences: String,
}

impl RedisCursors {
    pub fn new(coordination: &RedisCoordination) -> Self {
        Self::with_connection(coordination.connection(), coordination.key_prefix())
    }

    pub fn with_connection(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            keys: format!("{}cursors:keys", key_prefix),
            sequences: format!("{}cursors:sequences", key_prefix),
        }
    }

    async fn advance(&self, hash: &str, name: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(ADVANCE_SCRIPT)
            .key(hash)
            .arg(name)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| HubError::coordination("cursor advance", e))?;
        Ok(())
    }
}

impl CursorBackend for RedisCursors {
    fn load_keys(&self) -> BoxFuture<'_, HashMap<String, ContentKey>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(&self.keys)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HGETALL", e))?;
            let mut keys = HashMap::with_capacity(raw.len());
            for (name, url) in raw {
                match ContentKey::from_url(&url) {
                    Some(key) => {
                        keys.insert(name, key);
                    }
                    None => warn!(name = %name, value = %url, "Ignoring unparseable key cursor"),
                }
            }
            Ok(keys)
        })
    }

    fn load_sequences(&self) -> BoxFuture<'_, HashMap<String, u64>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(&self.sequences)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HGETALL", e))?;
            let mut sequences = HashMap::with_capacity(raw.len());
            for (name, value) in raw {
                match value.parse::<u64>() {
                    Ok(sequence) => {
                        sequences.insert(name, sequence);
                    }
                    Err(_) => warn!(name = %name, value = %value, "Ignoring unparseable sequence cursor"),
                }
            }
            Ok(sequences)
        })
    }

    fn load_key(&self, name: &str) -> BoxFuture<'_, Option<ContentKey>> {
        let name = name.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let url: Option<String> = redis::cmd("HGET")
                .arg(&self.keys)
                .arg(&name)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HGET", e))?;
            Ok(url.and_then(|url| ContentKey::from_url(&url)))
        })
    }

    fn load_sequence(&self, name: &str) -> BoxFuture<'_, Option<u64>> {
        let name = name.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: Option<String> = redis::cmd("HGET")
                .arg(&self.sequences)
                .arg(&name)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HGET", e))?;
            Ok(value.and_then(|v| v.parse().ok()))
        })
    }

    fn store_key(&self, name: &str, key: &ContentKey) -> BoxFuture<'_, ()> {
        let name = name.to_string();
        let url = key.to_url();
        Box::pin(async move { self.advance(&self.keys, &name, &url).await })
    }

    fn store_sequence(&self, name: &str, sequence: u64) -> BoxFuture<'_, ()> {
        let name = name.to_string();
        let value = sequence_field(sequence);
        Box::pin(async move { self.advance(&self.sequences, &name, &value).await })
    }

    fn delete(&self, name: &str) -> BoxFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = redis::pipe()
                .atomic()
                .cmd("HDEL")
                .arg(&self.keys)
                .arg(&name)
                .ignore()
                .cmd("HDEL")
                .arg(&self.sequences)
                .arg(&name)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HDEL", e))?;
            Ok(())
        })
    }
}

/// [`RegistrationStore`] with one Redis hash per collection.
pub struct RedisRegistrations {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisRegistrations {
    pub fn new(coordination: &RedisCoordination) -> Self {
        Self::with_connection(coordination.connection(), coordination.key_prefix())
    }

    pub fn with_connection(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.to_string(),
        }
    }

    fn hash(&self, collection: Collection) -> String {
        format!("{}registry:{}", self.key_prefix, collection.as_str())
    }
}

impl RegistrationStore for RedisRegistrations {
    fn insert(&self, collection: Collection, name: &str, body: &str) -> BoxFuture<'_, bool> {
        let hash = self.hash(collection);
        let name = name.to_string();
        let body = body.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let added: i64 = redis::cmd("HSETNX")
                .arg(&hash)
                .arg(&name)
                .arg(&body)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HSETNX", e))?;
            Ok(added == 1)
        })
    }

    fn upsert(&self, collection: Collection, name: &str, body: &str) -> BoxFuture<'_, ()> {
        let hash = self.hash(collection);
        let name = name.to_string();
        let body = body.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = redis::cmd("HSET")
                .arg(&hash)
                .arg(&name)
                .arg(&body)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HSET", e))?;
            Ok(())
        })
    }

    fn get(&self, collection: Collection, name: &str) -> BoxFuture<'_, Option<String>> {
        let hash = self.hash(collection);
        let name = name.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let body: Option<String> = redis::cmd("HGET")
                .arg(&hash)
                .arg(&name)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HGET", e))?;
            Ok(body)
        })
    }

    fn list(&self, collection: Collection) -> BoxFuture<'_, Vec<String>> {
        let hash = self.hash(collection);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let docs: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(&hash)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HGETALL", e))?;
            let mut docs: Vec<(String, String)> = docs.into_iter().collect();
            docs.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(docs.into_iter().map(|(_, body)| body).collect())
        })
    }

    fn remove(&self, collection: Collection, name: &str) -> BoxFuture<'_, bool> {
        let hash = self.hash(collection);
        let name = name.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let removed: i64 = redis::cmd("HDEL")
                .arg(&hash)
                .arg(&name)
                .query_async(&mut conn)
                .await
                .map_err(|e| HubError::coordination("HDEL", e))?;
            Ok(removed > 0)
        })
    }
}
