use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use fred::interfaces::{HashesInterface, LuaInterface, SetsInterface, SortedSetsInterface};
use fred::prelude::{
    ClientLike, EventInterface, KeysInterface, Pool, ReconnectPolicy, Server, ServerConfig,
    TcpConfig,
};
use fred::types::config::UnresponsiveConfig;
use fred::types::{Builder, Expiration, SetOptions};
use tokio::sync::broadcast::error::RecvError;
use url::Url;

use crate::error::{PoolError, Result};
use crate::store::{KvStore, Transaction};

const DEFAULT_PORT: u16 = 6379;
const SCAN_PAGE: u32 = 100;

const EXPIRE_SCRIPT: &str = "return redis.call('PEXPIRE', KEYS[1], ARGV[1])";

// Guards are checked, then every op is type-checked against the keys it
// touches, and only then is anything written. ARGV[1] is the JSON-encoded
// Transaction.
const COMMIT_SCRIPT: &str = r#"
local txn = cjson.decode(ARGV[1])

local function glob(prefix)
  return (string.gsub(prefix, '[%*%?%[%]\\]', '\\%0')) .. '*'
end

for _, g in ipairs(txn.guards) do
  if g.guard == 'exists' then
    if redis.call('EXISTS', g.key) == 0 then return 0 end
  elseif g.guard == 'equals' then
    if redis.call('GET', g.key) ~= g.value then return 0 end
  elseif g.guard == 'not_member' then
    if redis.call('SISMEMBER', g.key, g.member) == 1 then return 0 end
  elseif g.guard == 'scored' then
    if not redis.call('ZSCORE', g.key, g.member) then return 0 end
  else
    return redis.error_reply('unknown guard ' .. tostring(g.guard))
  end
end

local wants = { h_set = 'hash', h_incr = 'hash', z_add = 'zset', z_incr = 'zset', s_add = 'set' }
local kinds = {}
for _, o in ipairs(txn.ops) do
  if o.op == 'set' then
    kinds[o.key] = 'string'
  elseif o.op == 'del' then
    kinds[o.key] = 'none'
  elseif o.op == 'del_prefix' then
    for _, k in ipairs(redis.call('KEYS', glob(o.prefix))) do kinds[k] = 'none' end
    for k, _ in pairs(kinds) do
      if string.sub(k, 1, #o.prefix) == o.prefix then kinds[k] = 'none' end
    end
  elseif wants[o.op] then
    local found = kinds[o.key]
    if found == nil then found = redis.call('TYPE', o.key).ok end
    if found ~= 'none' and found ~= wants[o.op] then
      return redis.error_reply('WRONGTYPE key ' .. o.key .. ' holds a ' .. found .. ', expected a ' .. wants[o.op])
    end
    kinds[o.key] = wants[o.op]
  else
    return redis.error_reply('unknown op ' .. tostring(o.op))
  end
end

for _, o in ipairs(txn.ops) do
  if o.op == 'set' then
    redis.call('SET', o.key, o.value)
  elseif o.op == 'del' then
    redis.call('DEL', o.key)
  elseif o.op == 'del_prefix' then
    local doomed = redis.call('KEYS', glob(o.prefix))
    for i = 1, #doomed, 1000 do
      redis.call('DEL', unpack(doomed, i, math.min(i + 999, #doomed)))
    end
  elseif o.op == 'h_set' then
    for _, f in ipairs(o.fields) do redis.call('HSET', o.key, f[1], f[2]) end
  elseif o.op == 'h_incr' then
    redis.call('HINCRBY', o.key, o.field, o.by)
  elseif o.op == 'z_add' then
    redis.call('ZADD', o.key, o.score, o.member)
  elseif o.op == 'z_incr' then
    redis.call('ZINCRBY', o.key, o.by, o.member)
  elseif o.op == 's_add' then
    redis.call('SADD', o.key, o.member)
  end
end
return 1
"#;

/// Connection settings of a [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<u8>,
}

impl RedisConfig {
    /// Parses `redis://[user[:password]@]host[:port][/db]`.
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| PoolError::Store(format!("bad redis url: {e}")))?;
        if url.scheme() != "redis" {
            return Err(PoolError::Store(format!(
                "unsupported redis url scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PoolError::Store("redis url has no host".to_string()))?
            .to_string();

        let database = match url.path().trim_start_matches('/') {
            "" => None,
            db => Some(
                db.parse::<u8>()
                    .map_err(|_| PoolError::Store(format!("bad redis database {db}")))?,
            ),
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username: Some(url.username())
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            password: url.password().map(str::to_string),
            database,
        })
    }
}

/// [`KvStore`] on a single Redis server (not cluster), shared by every
/// process serving the job.
///
/// Transactions run as one Lua script, so guards and writes are atomic with
/// respect to every other client.
#[derive(Clone)]
pub struct RedisStore {
    client: Pool,
}

impl RedisStore {
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let pool = Builder::default_centralized()
            .with_config(|redis_config| {
                redis_config.username = config.username.clone();
                redis_config.password = config.password.clone();
                redis_config.database = config.database;
                redis_config.server = ServerConfig::Centralized {
                    server: Server::new(config.host.clone(), config.port),
                };
            })
            .with_connection_config(|connection| {
                connection.internal_command_timeout = Duration::from_secs(5);
                connection.reconnect_on_auth_error = true;
                connection.tcp = TcpConfig {
                    #[cfg(target_os = "linux")]
                    user_timeout: Some(Duration::from_secs(5)),
                    ..Default::default()
                };
                connection.unresponsive = UnresponsiveConfig {
                    max_timeout: Some(Duration::from_secs(10)),
                    interval: Duration::from_secs(3),
                };
            })
            .with_performance_config(|performance| {
                performance.default_command_timeout = Duration::from_secs(5);
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 1, 2000, 5))
            .build_pool(5)?;

        for client in pool.clients() {
            let mut error_rx = client.error_rx();
            tokio::spawn(async move {
                loop {
                    match error_rx.recv().await {
                        Ok((error, server)) => {
                            tracing::error!(?server, error = %error, "Redis client error");
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            });
        }

        let handles = pool.connect_pool();
        pool.wait_for_connect().await?;
        tracing::info!(host = %config.host, port = config.port, "Connected to Redis");

        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
        });

        Ok(Self { client: pool })
    }

    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::connect(RedisConfig::from_url(url)?).await
    }
}

/// Escapes glob metacharacters so `prefix` matches literally in SCAN/KEYS.
fn glob_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.client.get::<Option<String>, _>(key).await?)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = self
            .client
            .set(
                key,
                value,
                Some(Expiration::PX(millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let updated: i64 = self
            .client
            .eval(EXPIRE_SCRIPT, vec![key.to_string()], vec![millis(ttl).to_string()])
            .await?;
        Ok(updated == 1)
    }

    // Not safe against a cluster; SCAN covers one node.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = glob_prefix(prefix);
        let mut cursor = "0".to_string();
        let mut keys = BTreeSet::new();

        loop {
            let (next_cursor, page): (String, Vec<String>) = self
                .client
                .scan_page(cursor, pattern.clone(), Some(SCAN_PAGE), None)
                .await?;
            keys.extend(page);

            cursor = next_cursor;
            if cursor == "0" {
                break;
            }
        }

        Ok(keys.into_iter().collect())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.client.hgetall::<HashMap<String, String>, _>(key).await?)
    }

    async fn zrevrange(&self, key: &str, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(count).unwrap_or(i64::MAX) - 1;
        Ok(self
            .client
            .zrevrange::<Vec<String>, _>(key, 0, stop, false)
            .await?)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self.client.zscore::<Option<f64>, _, _>(key, member).await?)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.client.sismember::<bool, _, _>(key, member).await?)
    }

    async fn commit(&self, txn: Transaction) -> Result<bool> {
        let payload = serde_json::to_string(&txn)?;
        let applied: i64 = self
            .client
            .eval(COMMIT_SCRIPT, Vec::<String>::new(), vec![payload])
            .await?;
        Ok(applied == 1)
    }
}
