//! Redis-backed store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Pipeline, Script, Value};
use tracing::{debug, info};

use super::{Backend, BackendError, Batch, Decremented, Op};

/// Decrements `ARGV[1]` of hash `KEYS[1]` when it is a positive integer and
/// returns `{taken, HMGET(ARGV[2..])}`, or `false` when the hash is missing.
const DECREMENT_FLOORED: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1]))
local taken = 0
if current and current > 0 and current == math.floor(current) then
  redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
  taken = 1
end
return {taken, redis.call('HMGET', KEYS[1], unpack(ARGV, 2))}
"#;

/// A [`Backend`] on a shared Redis server.
///
/// The connection manager multiplexes one connection and reconnects on
/// failure; cloning the backend shares it.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    decrement: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        info!(url = %url, "Connecting to Redis");
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::with_connection(conn))
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            decrement: Script::new(DECREMENT_FLOORED),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// Queue the commands for one batch operation and return how many replies
/// it will produce.
fn queue(pipe: &mut Pipeline, op: &Op) -> usize {
    match op {
        Op::SetFields { key, fields } => {
            let cmd = pipe.cmd("HSET").arg(key);
            for (name, value) in fields {
                cmd.arg(name).arg(value);
            }
            1
        }
        Op::SetFieldsIfAbsent { key, fields } => {
            for (name, value) in fields {
                pipe.cmd("HSETNX").arg(key).arg(name).arg(value);
            }
            fields.len()
        }
        Op::Expire { key, ttl } => {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl));
            1
        }
        // NX covers keys without an expiry, GT only ever lengthens one.
        Op::ExtendExpiry { key, ttl } => {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl)).arg("NX");
            pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl)).arg("GT");
            2
        }
        Op::ExpireIfUnset { key, ttl } => {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl)).arg("NX");
            1
        }
        Op::AddMember { set, member } => {
            pipe.cmd("SADD").arg(set).arg(member);
            1
        }
        Op::Delete { keys } if keys.is_empty() => 0,
        Op::Delete { keys } => {
            pipe.cmd("DEL").arg(keys);
            1
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, BackendError> {
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn set_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (name, value) in fields {
            cmd.arg(name).arg(value);
        }
        let _: i64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let added: i64 = redis::cmd("SADD")
            .arg(set)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn members(&self, set: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(set)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, BackendError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let deleted: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(deleted)
    }

    async fn decrement_floored(
        &self,
        key: &str,
        counter: &str,
        fields: &[&str],
    ) -> Result<Option<Decremented>, BackendError> {
        let mut conn = self.conn.clone();
        let reply: Option<(i64, Vec<Option<String>>)> = self
            .decrement
            .key(key)
            .arg(counter)
            .arg(fields)
            .invoke_async(&mut conn)
            .await?;
        Ok(reply.map(|(taken, values)| Decremented {
            taken: taken == 1,
            values,
        }))
    }

    async fn exec(&self, batch: Batch) -> Result<Vec<i64>, BackendError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        let spans: Vec<usize> = batch.ops().iter().map(|op| queue(&mut pipe, op)).collect();

        let mut conn = self.conn.clone();
        let replies: Vec<Value> = pipe.query_async(&mut conn).await?;
        debug!(ops = batch.len(), replies = replies.len(), "Executed Redis transaction");

        // Fold per-command replies back into one integer per operation.
        let mut replies = replies.iter();
        let mut out = Vec::with_capacity(spans.len());
        for span in spans {
            let mut total = 0;
            for value in replies.by_ref().take(span) {
                total += redis::from_redis_value::<i64>(value)?;
            }
            out.push(total);
        }
        Ok(out)
    }
}
