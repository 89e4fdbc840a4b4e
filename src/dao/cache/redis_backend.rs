use std::{collections::HashMap, time::Duration};

use futures::future::BoxFuture;
use redis::{
    AsyncCommands, Script,
    aio::ConnectionManager,
    streams::{StreamReadOptions, StreamReadReply},
};
use tracing::debug;

use super::{CacheBackend, CacheError, CacheResult, ReadStart, StreamEntry, StreamRead};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Redis-backed cache. Clones share one multiplexed, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisCacheBackend {
    manager: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisCacheBackend {
    /// Open a managed connection to `redis_url`.
    pub async fn connect(redis_url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        debug!("redis connection manager ready");
        Ok(Self {
            manager,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }

    fn ttl_ms(ttl: Duration) -> i64 {
        let ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        if ms == 0 { 1 } else { ms }
    }
}

fn decode_entry(id: String, map: HashMap<String, redis::Value>) -> CacheResult<StreamEntry> {
    let mut fields = HashMap::with_capacity(map.len());
    for (field, value) in map {
        let value: String = redis::from_redis_value(&value).map_err(|err| CacheError::Decode {
            key: id.clone(),
            reason: err.to_string(),
        })?;
        fields.insert(field, value);
    }
    Ok(StreamEntry { id, fields })
}

impl CacheBackend for RedisCacheBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn ping(&self) -> BoxFuture<'static, CacheResult<()>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|err| CacheError::Unavailable(err.to_string()))?;
            Ok(())
        })
    }

    fn hash_get_all(&self, key: String) -> BoxFuture<'static, CacheResult<HashMap<String, String>>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            conn.hgetall(&key)
                .await
                .map_err(|err| CacheError::command("HGETALL", err))
        })
    }

    fn hash_set(
        &self,
        key: String,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<()>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            if fields.is_empty() {
                let _: bool = conn
                    .pexpire(&key, Self::ttl_ms(ttl))
                    .await
                    .map_err(|err| CacheError::command("PEXPIRE", err))?;
                return Ok(());
            }
            let _: () = redis::pipe()
                .atomic()
                .hset_multiple(&key, &fields)
                .ignore()
                .pexpire(&key, Self::ttl_ms(ttl))
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|err| CacheError::command("HSET", err))?;
            Ok(())
        })
    }

    fn delete(&self, key: String) -> BoxFuture<'static, CacheResult<bool>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let removed: i64 = conn
                .del(&key)
                .await
                .map_err(|err| CacheError::command("DEL", err))?;
            Ok(removed > 0)
        })
    }

    fn get(&self, key: String) -> BoxFuture<'static, CacheResult<Option<String>>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            conn.get(&key)
                .await
                .map_err(|err| CacheError::command("GET", err))
        })
    }

    fn set_with_ttl(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<()>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("PX")
                .arg(Self::ttl_ms(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|err| CacheError::command("SET", err))?;
            Ok(())
        })
    }

    fn set_if_absent(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<bool>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let result: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(Self::ttl_ms(ttl))
                .query_async(&mut conn)
                .await
                .map_err(|err| CacheError::command("SET NX", err))?;
            Ok(result.is_some())
        })
    }

    fn compare_and_delete(
        &self,
        key: String,
        expected: String,
    ) -> BoxFuture<'static, CacheResult<bool>> {
        let mut conn = self.manager.clone();
        let script = self.compare_and_delete.clone();
        Box::pin(async move {
            let removed: i64 = script
                .key(&key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await
                .map_err(|err| CacheError::command("EVALSHA", err))?;
            Ok(removed > 0)
        })
    }

    fn add_member(
        &self,
        key: String,
        member: String,
        ttl: Duration,
    ) -> BoxFuture<'static, CacheResult<bool>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let (added,): (i64,) = redis::pipe()
                .atomic()
                .sadd(&key, member)
                .pexpire(&key, Self::ttl_ms(ttl))
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|err| CacheError::command("SADD", err))?;
            Ok(added > 0)
        })
    }

    fn stream_append(
        &self,
        key: String,
        fields: Vec<(String, String)>,
    ) -> BoxFuture<'static, CacheResult<String>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            conn.xadd(&key, "*", &fields)
                .await
                .map_err(|err| CacheError::command("XADD", err))
        })
    }

    fn stream_create_group(
        &self,
        key: String,
        group: String,
    ) -> BoxFuture<'static, CacheResult<()>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let result: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(&key, &group, "0").await;
            match result {
                Ok(()) => Ok(()),
                Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
                Err(err) => Err(CacheError::command("XGROUP CREATE", err)),
            }
        })
    }

    fn stream_read_group(
        &self,
        read: StreamRead,
    ) -> BoxFuture<'static, CacheResult<Vec<StreamEntry>>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let mut options = StreamReadOptions::default()
                .group(&read.group, &read.consumer)
                .count(read.count);
            let start = match read.start {
                ReadStart::Pending(after) => after,
                ReadStart::New => {
                    let block_ms = usize::try_from(read.block.as_millis()).unwrap_or(usize::MAX);
                    options = options.block(block_ms);
                    ">".to_owned()
                }
            };

            let reply: Option<StreamReadReply> = conn
                .xread_options(&[&read.key], &[&start], &options)
                .await
                .map_err(|err| CacheError::command("XREADGROUP", err))?;

            let Some(reply) = reply else {
                return Ok(Vec::new());
            };
            reply
                .keys
                .into_iter()
                .flat_map(|stream| stream.ids)
                .map(|entry| decode_entry(entry.id, entry.map))
                .collect()
        })
    }

    fn stream_remove(
        &self,
        key: String,
        group: String,
        id: String,
    ) -> BoxFuture<'static, CacheResult<()>> {
        let mut conn = self.manager.clone();
        Box::pin(async move {
            let _: () = redis::pipe()
                .atomic()
                .xack(&key, &group, &[&id])
                .ignore()
                .xdel(&key, &[&id])
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|err| CacheError::command("XACK", err))?;
            Ok(())
        })
    }
}
