//! Redis-backed coordination store (feature `redis-store`)
//!
//! The composite claim/release operations run as Lua scripts so each is
//! a single atomic round trip, matching the in-memory reference
//! implementation's semantics.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{EvalError, EvalResult};

use super::coordination::{CoordinationStore, SlotRelease};

/// Pop a slot from the pool tail and set its busy marker, atomically.
/// KEYS[1] = pool list, ARGV[1] = marker prefix, ARGV[2] = owner,
/// ARGV[3] = ttl seconds. Returns the slot or false.
const CLAIM_SCRIPT: &str = r#"
local slot = redis.call('RPOP', KEYS[1])
if not slot then
    return false
end
redis.call('SET', ARGV[1] .. slot, ARGV[2], 'EX', tonumber(ARGV[3]))
return slot
"#;

/// Idempotent release. KEYS[1] = pool list, ARGV[1] = marker prefix,
/// ARGV[2] = slot. Returns 0 = released, 1 = double release,
/// 2 = unknown slot.
const RELEASE_SCRIPT: &str = r#"
local marker = ARGV[1] .. ARGV[2]
local existed = redis.call('DEL', marker)
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, entry in ipairs(entries) do
    if entry == ARGV[2] then
        return 1
    end
end
if existed == 1 then
    redis.call('LPUSH', KEYS[1], ARGV[2])
    return 0
end
return 2
"#;

fn coord_err(err: redis::RedisError) -> EvalError {
    EvalError::Coordination(err.to_string())
}

/// Coordination store over a shared Redis instance
#[derive(Clone)]
pub struct RedisCoordinationStore {
    conn: ConnectionManager,
    claim_script: Script,
    release_script: Script,
}

impl RedisCoordinationStore {
    /// Connect to the Redis instance at `url`
    pub async fn connect(url: &str) -> EvalResult<Self> {
        let client = redis::Client::open(url).map_err(coord_err)?;
        let conn = client.get_connection_manager().await.map_err(coord_err)?;
        Ok(Self {
            conn,
            claim_script: Script::new(CLAIM_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn push_front(&self, key: &str, value: &str) -> EvalResult<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, value).await.map_err(coord_err)
    }

    async fn pop_back(&self, key: &str) -> EvalResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.rpop::<_, Option<String>>(key, None)
            .await
            .map_err(coord_err)
    }

    async fn list_len(&self, key: &str) -> EvalResult<usize> {
        let mut conn = self.conn.clone();
        conn.llen::<_, usize>(key).await.map_err(coord_err)
    }

    async fn list_range(&self, key: &str) -> EvalResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange::<_, Vec<String>>(key, 0, -1)
            .await
            .map_err(coord_err)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> EvalResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(coord_err)
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> EvalResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> EvalResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key).await.map_err(coord_err)
    }

    async fn delete(&self, key: &str) -> EvalResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(coord_err)?;
        Ok(removed > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> EvalResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.keys::<_, Vec<String>>(format!("{}*", prefix))
            .await
            .map_err(coord_err)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> EvalResult<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(coord_err)
    }

    async fn hash_get_all(&self, key: &str) -> EvalResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall::<_, HashMap<String, String>>(key)
            .await
            .map_err(coord_err)
    }

    async fn counter_incr(&self, key: &str) -> EvalResult<u64> {
        let mut conn = self.conn.clone();
        conn.incr::<_, _, u64>(key, 1u64).await.map_err(coord_err)
    }

    async fn claim_slot(
        &self,
        pool_key: &str,
        marker_prefix: &str,
        owner: &str,
        ttl: Duration,
    ) -> EvalResult<Option<String>> {
        let mut conn = self.conn.clone();
        let slot: Option<String> = self
            .claim_script
            .key(pool_key)
            .arg(marker_prefix)
            .arg(owner)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(coord_err)?;
        Ok(slot)
    }

    async fn release_slot(
        &self,
        pool_key: &str,
        marker_prefix: &str,
        slot: &str,
    ) -> EvalResult<SlotRelease> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .release_script
            .key(pool_key)
            .arg(marker_prefix)
            .arg(slot)
            .invoke_async(&mut conn)
            .await
            .map_err(coord_err)?;
        match code {
            0 => Ok(SlotRelease::Released),
            1 => Ok(SlotRelease::DoubleRelease),
            2 => Ok(SlotRelease::UnknownSlot),
            other => Err(EvalError::Coordination(format!(
                "unexpected release script result: {}",
                other
            ))),
        }
    }
}
