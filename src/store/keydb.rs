//! KeyDB / Redis backed [`CartStore`].
//!
//! Builds a [`fred::clients::Pool`] from [`crate::config::KeyDbConfig`],
//! optionally enabling TLS via `rustls` and reading the auth token from an
//! environment variable.  [`KeyDbStore::connect`] bounds connecting and the
//! startup PING by the configured connect timeout so a dead endpoint fails
//! startup instead of hanging it.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::clients::{Client, Pool};
use fred::interfaces::{
    ClientLike, KeysInterface, ListInterface, LuaInterface, TransactionInterface,
};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration, SetOptions, Value};
use tracing::{debug, trace};

use super::{BatchOp, BatchResults, CartStore};
use crate::config::KeyDbConfig;
use crate::error::StoreError;

/// Extra time a blocking pop is given beyond its server-side timeout before
/// the client gives up on the reply.
const BLOCKING_POP_GRACE: Duration = Duration::from_millis(250);

/// Runs the encoded ops only while `KEYS[1]` still holds `ARGV[1]`.  Op `i`
/// targets `KEYS[i + 1]`; its command name and arguments follow in `ARGV`.
const GUARDED_BATCH_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) ~= ARGV[1] then
        return 0
    end
    local arg = 2
    for i = 2, #KEYS do
        local cmd = ARGV[arg]
        if cmd == 'SET' then
            redis.call('SET', KEYS[i], ARGV[arg + 1], 'PX', ARGV[arg + 2])
            arg = arg + 3
        elseif cmd == 'DEL' then
            redis.call('DEL', KEYS[i])
            arg = arg + 1
        elseif cmd == 'LPUSH' then
            redis.call('LPUSH', KEYS[i], ARGV[arg + 1])
            arg = arg + 2
        elseif cmd == 'PEXPIRE' then
            redis.call('PEXPIRE', KEYS[i], ARGV[arg + 1])
            arg = arg + 2
        else
            return redis.error_reply('unknown guarded op ' .. tostring(cmd))
        end
    end
    return 1
"#;

/// Create a KeyDB connection pool from the application configuration.
///
/// The pool is connected before being returned, within
/// `config.connect_timeout_ms`.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    // The endpoint may carry a `rediss://` or `redis://` scheme prefix.
    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");

    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(ref token) = auth_token {
        fred_config.password = Some(token.clone());
    }

    let mut builder = Builder::from_config(fred_config);

    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build KeyDB connection pool")?;

    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
    tokio::time::timeout(connect_timeout, pool.init())
        .await
        .with_context(|| format!("KeyDB at {host}:{port} did not answer within {connect_timeout:?}"))?
        .context("failed to connect to KeyDB")?;

    tracing::info!(
        host = host,
        port = port,
        tls = config.tls,
        pool_size = config.pool_size,
        "KeyDB pool created"
    );

    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a `/0` database suffix).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

/// Redis rejects `PX 0`, so sub-millisecond TTLs round up.
fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Flatten a guarded batch into the `KEYS`/`ARGV` layout
/// [`GUARDED_BATCH_SCRIPT`] expects.
fn guarded_batch_args(guard_key: &str, expected: &str, ops: Vec<BatchOp>) -> (Vec<String>, Vec<Value>) {
    let mut keys = vec![guard_key.to_string()];
    let mut args = vec![Value::from(expected.to_string())];
    for op in ops {
        match op {
            BatchOp::Set { key, value, ttl } => {
                keys.push(key);
                args.push(Value::from("SET".to_string()));
                args.push(Value::Bytes(value.into()));
                args.push(Value::from(millis(ttl)));
            }
            BatchOp::Delete { key } => {
                keys.push(key);
                args.push(Value::from("DEL".to_string()));
            }
            BatchOp::Push { key, value } => {
                keys.push(key);
                args.push(Value::from("LPUSH".to_string()));
                args.push(Value::from(value));
            }
            BatchOp::Expire { key, ttl } => {
                keys.push(key);
                args.push(Value::from("PEXPIRE".to_string()));
                args.push(Value::from(millis(ttl)));
            }
        }
    }
    (keys, args)
}

/// Closes a per-wait client however the wait ends, including when the
/// caller drops the future at its deadline.
struct QuitOnDrop(Client);

impl Drop for QuitOnDrop {
    fn drop(&mut self) {
        let client = self.0.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = client.quit().await;
            });
        }
    }
}

/// [`CartStore`] over a shared fred pool.
#[derive(Clone)]
pub struct KeyDbStore {
    pool: Pool,
}

impl KeyDbStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build the pool from `config` and PING it through the store, all
    /// bounded by `config.connect_timeout_ms`.
    pub async fn connect(config: &KeyDbConfig) -> Result<Self> {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let started = tokio::time::Instant::now();
        let store = Self::new(create_keydb_pool(config).await?);

        let remaining = connect_timeout.saturating_sub(started.elapsed());
        tokio::time::timeout(remaining, store.ping())
            .await
            .with_context(|| format!("KeyDB PING did not answer within {connect_timeout:?}"))?
            .context("KeyDB PING failed after connect")?;

        tracing::info!("KeyDB connection verified");
        Ok(store)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl CartStore for KeyDbStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value: Option<Vec<u8>> = self.pool.get(key).await.context("GET")?;
        trace!(%key, found = value.is_some(), "GET");
        Ok(value)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let _: () = self
            .pool
            .set(key, value.to_vec(), Some(Expiration::PX(millis(ttl))), None, false)
            .await
            .context("SET PX")?;
        Ok(())
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result: Option<String> = self
            .pool
            .set(
                key,
                value,
                Some(Expiration::PX(millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await
            .context("SET NX PX")?;
        // SET … NX returns "OK" when the key was set, nil otherwise.
        Ok(result.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = self.pool.del(key).await.context("DEL")?;
        Ok(())
    }

    /// BLPOP holds its connection for the whole wait, so it runs on a
    /// dedicated client cloned from the pool's config rather than tying up a
    /// pooled connection other commands are queued behind.  One client per
    /// wait: concurrent BLPOPs on a shared connection would queue behind
    /// each other.  Connecting counts against `timeout` too.
    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let client = self.pool.next().clone_new();
        let _quit = QuitOnDrop(client.clone());

        // BLPOP treats 0 as "forever"; never send anything that rounds to it.
        let timeout_secs = timeout.as_secs_f64().max(0.01);
        let popped = tokio::time::timeout(timeout + BLOCKING_POP_GRACE, async {
            client
                .init()
                .await
                .context("failed to connect blocking-pop client")?;
            client
                .blpop::<Option<(String, String)>, _>(key, timeout_secs)
                .await
                .context("BLPOP")
        })
        .await;

        match popped {
            Ok(reply) => {
                let reply = reply?;
                debug!(%key, woken = reply.is_some(), "BLPOP returned");
                Ok(reply.map(|(_, token)| token))
            }
            Err(_) => Ok(None),
        }
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _: i64 = self.pool.lpush(key, value).await.context("LPUSH")?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let set: bool = self
            .pool
            .pexpire(key, millis(ttl), None)
            .await
            .context("PEXPIRE")?;
        Ok(set)
    }

    async fn execute_batch(&self, ops: Vec<BatchOp>) -> Result<BatchResults, StoreError> {
        let trx = self.pool.next().multi();
        for op in &ops {
            match op {
                BatchOp::Set { key, value, ttl } => {
                    let _: () = trx
                        .set(
                            key.as_str(),
                            value.clone(),
                            Some(Expiration::PX(millis(*ttl))),
                            None,
                            false,
                        )
                        .await
                        .context("queue SET")?;
                }
                BatchOp::Delete { key } => {
                    let _: () = trx.del(key.as_str()).await.context("queue DEL")?;
                }
                BatchOp::Push { key, value } => {
                    let _: () = trx
                        .lpush(key.as_str(), value.as_str())
                        .await
                        .context("queue LPUSH")?;
                }
                BatchOp::Expire { key, ttl } => {
                    let _: () = trx
                        .pexpire(key.as_str(), millis(*ttl), None)
                        .await
                        .context("queue PEXPIRE")?;
                }
            }
        }

        // With abort_on_error, an error reply for any queued command fails
        // the whole EXEC, so a successful reply means every op succeeded.
        let replies: Vec<Value> = trx.exec(true).await.context("EXEC")?;
        if replies.len() != ops.len() {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "EXEC returned {} replies for {} commands",
                replies.len(),
                ops.len()
            )));
        }
        debug!(commands = ops.len(), "batch committed");
        Ok(ops.iter().map(|_| Ok(())).collect())
    }

    async fn execute_if_equals(
        &self,
        guard_key: &str,
        expected: &str,
        ops: Vec<BatchOp>,
    ) -> Result<bool, StoreError> {
        let (keys, args) = guarded_batch_args(guard_key, expected, ops);
        let applied: i64 = self
            .pool
            .eval(GUARDED_BATCH_SCRIPT, keys, args)
            .await
            .context("guarded batch script")?;
        trace!(%guard_key, applied, "guarded batch");
        Ok(applied == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self.pool.ping(None).await.context("PING")?;
        Ok(())
    }
}
