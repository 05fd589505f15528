//! Per-context connection pool
//!
//! Connections are cached per `(context, address)` pair and checked out
//! exclusively: while a caller holds a [`PooledConnection`] nobody else can
//! see that socket, so two pipelines never interleave on it.

use std::collections::hash_map::Entry;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use fnv::FnvHashMap;
use tracing::debug;

use super::{Connection, ServerAddress};
use crate::error::RedshardResult;

/// Identity of the execution context a connection is cached for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    /// The OS thread that requested the connection
    Thread(ThreadId),
    /// A caller-chosen id, e.g. one per worker task
    Explicit(u64),
}

impl ContextId {
    /// Context of the calling thread
    pub fn current() -> Self {
        ContextId::Thread(thread::current().id())
    }
}

type SlotKey = (ContextId, ServerAddress);

/// Connection cache keyed by execution context and server address
pub struct ConnectionPool {
    slots: Mutex<FnvHashMap<SlotKey, Connection>>,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(FnvHashMap::default()),
            connect_timeout,
        }
    }

    /// Check out the calling thread's connection to `address`
    pub async fn get_connection(
        &self,
        address: &ServerAddress,
    ) -> RedshardResult<PooledConnection<'_>> {
        self.get_connection_in(ContextId::current(), address).await
    }

    /// Check out the connection to `address` cached for `context`
    ///
    /// Connects lazily on first use, and replaces a cached connection that is
    /// no longer usable.
    pub async fn get_connection_in(
        &self,
        context: ContextId,
        address: &ServerAddress,
    ) -> RedshardResult<PooledConnection<'_>> {
        let key = (context, address.clone());
        let cached = self.lock().remove(&key);

        let conn = match cached {
            Some(conn) if conn.is_usable() => conn,
            Some(mut stale) => {
                debug!("Replacing {} connection to {}", stale.state(), address);
                stale.free();
                Connection::connect(address, self.connect_timeout).await?
            }
            None => Connection::connect(address, self.connect_timeout).await?,
        };

        Ok(PooledConnection {
            pool: self,
            key,
            conn,
        })
    }

    /// Number of connections currently parked in the pool
    pub fn idle_count(&self) -> usize {
        self.lock().len()
    }

    /// Close every parked connection
    ///
    /// Checked-out connections are unaffected and are cached again on release.
    pub fn close_all(&self) {
        let drained: Vec<Connection> = self.lock().drain().map(|(_, conn)| conn).collect();
        for mut conn in drained {
            conn.free();
        }
    }

    fn release(&self, key: SlotKey, mut conn: Connection) {
        if !conn.is_usable() {
            conn.free();
            return;
        }

        let surplus = match self.lock().entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(conn);
                None
            }
            // Another checkout for the same context refilled the slot first
            Entry::Occupied(_) => Some(conn),
        };

        if let Some(mut conn) = surplus {
            conn.free();
        }
    }

    fn lock(&self) -> MutexGuard<'_, FnvHashMap<SlotKey, Connection>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Exclusive checkout of a pooled connection
///
/// Returned to its slot on drop if still connected, freed otherwise.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    key: SlotKey,
    conn: Connection,
}

impl PooledConnection<'_> {
    /// Free the connection instead of returning it to the pool
    pub fn discard(mut self) {
        self.conn.free();
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        let conn = std::mem::replace(&mut self.conn, Connection::closed(self.key.1.clone()));
        self.pool.release(self.key.clone(), conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConnectionState;
    use crate::testing::FakeServer;

    #[tokio::test]
    async fn test_connection_is_reused_within_context() {
        let server = FakeServer::start().await;
        let pool = ConnectionPool::default();

        {
            let conn = pool.get_connection(server.address()).await.unwrap();
            assert!(conn.is_usable());
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);

        let _again = pool.get_connection(server.address()).await.unwrap();
        server.wait_for_accepted(1).await;
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_contexts_get_independent_connections() {
        let server = FakeServer::start().await;
        let pool = ConnectionPool::default();

        let a = pool
            .get_connection_in(ContextId::Explicit(1), server.address())
            .await
            .unwrap();
        let b = pool
            .get_connection_in(ContextId::Explicit(2), server.address())
            .await
            .unwrap();
        drop(a);
        drop(b);

        assert_eq!(pool.idle_count(), 2);
        server.wait_for_accepted(2).await;
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_never_share() {
        let server = FakeServer::start().await;
        let pool = ConnectionPool::default();

        let first = pool.get_connection(server.address()).await.unwrap();
        // Same context, first checkout still held: a second socket is opened
        let second = pool.get_connection(server.address()).await.unwrap();
        server.wait_for_accepted(2).await;

        drop(first);
        drop(second);
        // Only one connection per slot survives
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_unusable_connection_is_not_cached() {
        let server = FakeServer::start().await;
        let pool = ConnectionPool::default();

        let mut conn = pool.get_connection(server.address()).await.unwrap();
        conn.abort();
        assert_eq!(conn.state(), ConnectionState::Aborted);
        drop(conn);
        assert_eq!(pool.idle_count(), 0);

        let conn = pool.get_connection(server.address()).await.unwrap();
        conn.discard();
        assert_eq!(pool.idle_count(), 0);
        server.wait_for_accepted(2).await;
    }

    #[tokio::test]
    async fn test_close_all() {
        let server = FakeServer::start().await;
        let pool = ConnectionPool::default();
        drop(pool.get_connection(server.address()).await.unwrap());
        assert_eq!(pool.idle_count(), 1);
        pool.close_all();
        assert_eq!(pool.idle_count(), 0);
    }
}
