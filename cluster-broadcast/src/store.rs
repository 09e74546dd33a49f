use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, RedisError, Script};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{BroadcastConfig, Error};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);
const LEASE_KEY: &str = "broadcast_lock";
const HEARTBEAT_KEY_PREFIX: &str = "active_clients";

// Extends the lease only while this instance still holds it.
const RENEW_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Names of the shared keys and channel, optionally namespaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: Option<String>,
    channel: String,
    process_id: String,
}

impl KeySpace {
    pub fn new(prefix: Option<&str>, channel: &str) -> Self {
        Self {
            prefix: prefix.map(str::to_string),
            channel: channel.to_string(),
            process_id: std::process::id().to_string(),
        }
    }

    pub fn from_config(config: &BroadcastConfig) -> Self {
        Self::new(config.key_prefix.as_deref(), &config.channel)
    }

    /// Override the process identity used in the heartbeat key.
    ///
    /// Several coordinators inside one test process need distinct keys.
    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = process_id.into();
        self
    }

    fn namespaced(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, name),
            None => name.to_string(),
        }
    }

    pub fn lease_key(&self) -> String {
        self.namespaced(LEASE_KEY)
    }

    pub fn heartbeat_key(&self) -> String {
        self.namespaced(&format!("{}:{}", HEARTBEAT_KEY_PREFIX, self.process_id))
    }

    pub fn heartbeat_pattern(&self) -> String {
        self.namespaced(&format!("{}:*", HEARTBEAT_KEY_PREFIX))
    }

    pub fn channel(&self) -> String {
        self.namespaced(&self.channel)
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }
}

/// Redis operations behind leader election, heartbeats and publication.
///
/// The multiplexed connection is opened on first use and shared by the
/// leadership and heartbeat tasks. A call that fails because the connection
/// broke discards it, so the next call (normally the next loop cycle) dials
/// Redis again.
pub struct CoordinationStore {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    instance_id: String,
    keys: KeySpace,
    ttl_secs: u64,
    call_timeout: Duration,
}

impl Drop for CoordinationStore {
    fn drop(&mut self) {
        tracing::debug!(
            instance_id = %self.instance_id,
            "CoordinationStore dropped (lease expires on its own if still held)"
        );
    }
}

impl CoordinationStore {
    /// Build a store without touching the network.
    ///
    /// # Errors
    ///
    /// Returns an error only if the URL is invalid.
    pub fn new(redis_url: &str, keys: KeySpace, ttl: Duration) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let instance_id = Uuid::new_v4().to_string();
        tracing::debug!(
            %instance_id,
            process_id = keys.process_id(),
            "Created coordination store"
        );

        Ok(Self {
            client,
            conn: Mutex::new(None),
            instance_id,
            keys,
            ttl_secs: ttl.as_secs().max(1),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Bound on connecting and on each command round trip.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Current connection, dialling Redis if there is none.
    async fn connection(&self) -> Result<MultiplexedConnection, Error> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(
            self.call_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Connection("timed out connecting to Redis".to_string()))??;
        tracing::debug!(instance_id = %self.instance_id, "Opened Redis connection");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the current connection so the next call reconnects.
    async fn discard_connection(&self) {
        if self.conn.lock().await.take().is_some() {
            tracing::warn!(instance_id = %self.instance_id, "Dropped broken Redis connection");
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, Error> {
        let mut conn = self.connection().await?;
        let result = tokio::time::timeout(self.call_timeout, cmd.query_async(&mut conn)).await;
        self.settle(result).await
    }

    async fn invoke<T: FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T, Error> {
        let mut conn = self.connection().await?;
        let result =
            tokio::time::timeout(self.call_timeout, invocation.invoke_async(&mut conn)).await;
        self.settle(result).await
    }

    async fn settle<T>(
        &self,
        result: Result<redis::RedisResult<T>, tokio::time::error::Elapsed>,
    ) -> Result<T, Error> {
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if connection_broken(&e) {
                    self.discard_connection().await;
                }
                Err(e.into())
            }
            Err(_) => {
                self.discard_connection().await;
                Err(Error::Connection("Redis command timed out".to_string()))
            }
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Try to become leader.
    ///
    /// `SET broadcast_lock <instance_id> NX EX <ttl>`; true if the key was
    /// absent and is now ours.
    pub async fn try_acquire_lease(&self) -> Result<bool, Error> {
        let reply: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(self.keys.lease_key())
                    .arg(&self.instance_id)
                    .arg("NX")
                    .arg("EX")
                    .arg(self.ttl_secs),
            )
            .await?;
        Ok(reply.is_some())
    }

    /// Extend the lease TTL. Returns false if the lease expired or was taken
    /// by another instance in the meantime.
    pub async fn renew_lease(&self) -> Result<bool, Error> {
        let script = Script::new(RENEW_LEASE_SCRIPT);
        let renewed: i64 = self
            .invoke(
                script
                    .key(self.keys.lease_key())
                    .arg(&self.instance_id)
                    .arg(self.ttl_secs),
            )
            .await?;
        Ok(renewed == 1)
    }

    /// Delete the lease if this instance holds it.
    pub async fn release_lease(&self) -> Result<bool, Error> {
        let script = Script::new(RELEASE_LEASE_SCRIPT);
        let released: i64 = self
            .invoke(script.key(self.keys.lease_key()).arg(&self.instance_id))
            .await?;
        if released == 1 {
            tracing::info!(instance_id = %self.instance_id, "Released broadcast lease");
        }
        Ok(released == 1)
    }

    pub async fn lease_holder(&self) -> Result<Option<String>, Error> {
        let holder: Option<String> = self
            .query(redis::cmd("GET").arg(self.keys.lease_key()))
            .await?;
        Ok(holder)
    }

    /// `SET active_clients:<pid> 1 EX <ttl>`
    pub async fn write_heartbeat(&self) -> Result<(), Error> {
        let _: () = self
            .query(
                redis::cmd("SET")
                    .arg(self.keys.heartbeat_key())
                    .arg(1)
                    .arg("EX")
                    .arg(self.ttl_secs),
            )
            .await?;
        Ok(())
    }

    pub async fn clear_heartbeat(&self) -> Result<(), Error> {
        let _: () = self
            .query(redis::cmd("DEL").arg(self.keys.heartbeat_key()))
            .await?;
        Ok(())
    }

    /// Heartbeat keys of every process that currently owns connections.
    pub async fn active_heartbeats(&self) -> Result<Vec<String>, Error> {
        let keys: Vec<String> = self
            .query(redis::cmd("KEYS").arg(self.keys.heartbeat_pattern()))
            .await?;
        Ok(keys)
    }

    /// Publish to the broadcast channel, returning the subscriber count.
    pub async fn publish(&self, payload: &str) -> Result<u64, Error> {
        let channel = self.keys.channel();
        let receivers: u64 = self
            .query(redis::cmd("PUBLISH").arg(&channel).arg(payload))
            .await?;

        tracing::debug!(%channel, receivers, "Published broadcast");
        Ok(receivers)
    }
}

/// Whether an error means the connection itself is unusable, as opposed to
/// Redis rejecting one command.
fn connection_broken(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_unrecoverable_error()
}
