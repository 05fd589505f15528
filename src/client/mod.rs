//! Sharded client façade
//!
//! Routes each key through the ketama ring, runs single-key commands with a
//! bounded retry on connection errors, and fans `MGET` out to every shard in
//! one executor pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fnv::FnvHashMap;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::config::Config;
use crate::core::{ConnectionPool, ServerAddress};
use crate::error::{RedshardError, RedshardResult};
use crate::executor::Executor;
use crate::protocol::{Reply, WireCodec};
use crate::ring::HashRing;

/// Client-wide defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Deadline for an operation that does not pass its own
    pub default_timeout: Duration,
    /// Extra attempts after a connection error on single-key operations
    pub retry_count_on_connection_error: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(3000),
            retry_count_on_connection_error: 1,
        }
    }
}

/// Options for [`ShardedClient::set_with`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Expiry in seconds; a non-zero value sends `SETEX` instead of `SET`
    pub expire: Option<u64>,
    /// Route by this key instead of the stored key
    pub server_key: Option<Bytes>,
    pub timeout: Option<Duration>,
}

/// Options for [`ShardedClient::get_with`]
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Route by this key instead of the requested key
    pub server_key: Option<Bytes>,
    pub timeout: Option<Duration>,
}

/// Client for a statically configured set of servers
///
/// Cheap to clone; clones share the ring and the pool.
#[derive(Clone)]
pub struct ShardedClient {
    ring: Arc<HashRing>,
    pool: Arc<ConnectionPool>,
    options: ClientOptions,
}

impl ShardedClient {
    pub fn new(ring: Arc<HashRing>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            ring,
            pool,
            options: ClientOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the ring, pool and options described by a configuration
    pub fn from_config(config: &Config) -> RedshardResult<Self> {
        let ring = config.build_ring()?;
        let pool = ConnectionPool::new(config.client.connect_timeout());
        Ok(Self::new(Arc::new(ring), Arc::new(pool)).with_options(config.client_options()))
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub async fn set<K, V>(&self, key: K, value: V) -> RedshardResult<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.set_with(key, value, SetOptions::default()).await
    }

    pub async fn set_ex<K, V>(&self, key: K, value: V, expire_secs: u64) -> RedshardResult<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let options = SetOptions {
            expire: Some(expire_secs),
            ..Default::default()
        };
        self.set_with(key, value, options).await
    }

    /// `SETEX key seconds value`, in the server's argument order
    pub async fn setex<K, V>(&self, key: K, expire_secs: u64, value: V) -> RedshardResult<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.set_ex(key, value, expire_secs).await
    }

    pub async fn set_with<K, V>(&self, key: K, value: V, options: SetOptions) -> RedshardResult<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let key = key.as_ref();
        let (command, request) = match options.expire.filter(|&secs| secs > 0) {
            Some(secs) => {
                let secs = secs.to_string();
                let args = [key, secs.as_bytes(), value.as_ref()];
                ("SETEX", WireCodec::encode("SETEX", &args))
            }
            None => ("SET", WireCodec::encode("SET", &[key, value.as_ref()])),
        };
        let routing_key = options.server_key.as_deref().unwrap_or(key);
        let timeout = options.timeout.unwrap_or(self.options.default_timeout);

        match self
            .execute_single(command, routing_key, &request, timeout)
            .await?
        {
            Reply::Status(_) => Ok(()),
            other => Err(unexpected_reply(command, &other)),
        }
    }

    pub async fn get<K: AsRef<[u8]>>(&self, key: K) -> RedshardResult<Option<Bytes>> {
        self.get_with(key, GetOptions::default()).await
    }

    pub async fn get_with<K: AsRef<[u8]>>(
        &self,
        key: K,
        options: GetOptions,
    ) -> RedshardResult<Option<Bytes>> {
        let key = key.as_ref();
        let request = WireCodec::encode("GET", &[key]);
        let routing_key = options.server_key.as_deref().unwrap_or(key);
        let timeout = options.timeout.unwrap_or(self.options.default_timeout);

        match self
            .execute_single("GET", routing_key, &request, timeout)
            .await?
        {
            Reply::Bulk(value) => Ok(Some(value)),
            Reply::BulkNil => Ok(None),
            other => Err(unexpected_reply("GET", &other)),
        }
    }

    pub async fn mget<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
    ) -> RedshardResult<HashMap<Bytes, Option<Bytes>>> {
        self.mget_with_timeout(keys, self.options.default_timeout)
            .await
    }

    /// Fetch many keys with one `MGET` per shard, all under one deadline
    ///
    /// Shards that miss the deadline turn the result into
    /// [`RedshardError::PartialTimeout`] carrying the values that did arrive.
    /// There is no retry: a shard connection failure fails the whole call.
    pub async fn mget_with_timeout<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
        timeout: Duration,
    ) -> RedshardResult<HashMap<Bytes, Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let shards = self.partition(keys);
        debug!("MGET of {} keys across {} shards", keys.len(), shards.len());

        let mut connections = Vec::with_capacity(shards.len());
        for (address, _) in &shards {
            connections.push(self.pool.get_connection(address).await?);
        }
        let mut batches: Vec<Batch> = shards
            .iter()
            .map(|(_, shard_keys)| {
                let mut batch = Batch::new();
                batch.mget(shard_keys);
                batch
            })
            .collect();

        let mut executor = Executor::new();
        for (conn, batch) in connections.iter_mut().zip(batches.iter_mut()) {
            executor.add(&mut **conn, batch);
        }
        executor.execute(timeout).await;
        executor.free();

        let mut resolved = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        let mut failure = None;

        let shards_with_io = connections.into_iter().zip(batches.iter_mut());
        for ((conn, batch), (address, shard_keys)) in shards_with_io.zip(shards) {
            match collect_mget(batch, &shard_keys, &mut resolved) {
                Ok(()) => {}
                Err(RedshardError::Timeout { .. }) => {
                    debug!("MGET on {} missed the deadline", address);
                    missing.extend(shard_keys);
                }
                Err(e) => {
                    if !matches!(e, RedshardError::Remote(_)) {
                        conn.discard();
                    }
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if !missing.is_empty() {
            return Err(RedshardError::PartialTimeout { resolved, missing });
        }
        Ok(resolved)
    }

    /// Group keys by owning server, keeping submission order within a group
    fn partition<K: AsRef<[u8]>>(&self, keys: &[K]) -> Vec<(ServerAddress, Vec<Bytes>)> {
        let mut shards: Vec<(ServerAddress, Vec<Bytes>)> = Vec::new();
        let mut index: FnvHashMap<usize, usize> = FnvHashMap::default();

        for key in keys {
            let key = key.as_ref();
            let ordinal = self.ring.get_server_ordinal(key);
            let slot = *index.entry(ordinal).or_insert_with(|| {
                shards.push((self.ring.server_for(key).clone(), Vec::new()));
                shards.len() - 1
            });
            shards[slot].1.push(Bytes::copy_from_slice(key));
        }
        shards
    }

    /// Send one pre-encoded command to the server owning `routing_key`
    ///
    /// Connection errors, including failed connects, discard the connection
    /// and retry the whole command. Every other error is returned as is.
    async fn execute_single(
        &self,
        command: &str,
        routing_key: &[u8],
        request: &[u8],
        timeout: Duration,
    ) -> RedshardResult<Reply> {
        let address = self.ring.server_for(routing_key);
        let retries = self.options.retry_count_on_connection_error;
        let mut attempt = 0;

        loop {
            match self.attempt_single(command, address, request, timeout).await {
                Err(e) if e.is_connection_error() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        "Retrying {} on {} ({}/{}): {}",
                        command, address, attempt, retries, e
                    );
                }
                result => return result,
            }
        }
    }

    async fn attempt_single(
        &self,
        command: &str,
        address: &ServerAddress,
        request: &[u8],
        timeout: Duration,
    ) -> RedshardResult<Reply> {
        let mut conn = self.pool.get_connection(address).await?;
        let mut batch = Batch::new();
        batch.write_raw(request, 1);

        let mut executor = Executor::new();
        executor.add(&mut conn, &mut batch);
        executor.execute(timeout).await;
        executor.free();

        match batch.next_reply() {
            Ok(reply) => Ok(reply),
            Err(RedshardError::Timeout { .. }) => Err(RedshardError::timeout(format!(
                "{} on {} after {}ms",
                command,
                address,
                timeout.as_millis()
            ))),
            Err(e) => {
                if e.is_connection_error() {
                    conn.discard();
                }
                Err(e)
            }
        }
    }
}

/// Pull one shard's `MGET` reply into `out`
fn collect_mget(
    batch: &mut Batch,
    keys: &[Bytes],
    out: &mut HashMap<Bytes, Option<Bytes>>,
) -> RedshardResult<()> {
    match batch.next_reply()? {
        Reply::Multibulk(count) if count == keys.len() => {}
        Reply::Multibulk(count) => {
            return Err(RedshardError::protocol(format!(
                "MGET returned {} values for {} keys",
                count,
                keys.len()
            )))
        }
        other => return Err(unexpected_reply("MGET", &other)),
    }

    for key in keys {
        let value = match batch.next_reply()? {
            Reply::Bulk(value) => Some(value),
            Reply::BulkNil => None,
            other => return Err(unexpected_reply("MGET", &other)),
        };
        out.insert(key.clone(), value);
    }
    Ok(())
}

fn unexpected_reply(command: &str, reply: &Reply) -> RedshardError {
    RedshardError::protocol(format!(
        "unexpected {} reply to {}",
        reply.type_name(),
        command
    ))
}
