//! Redshard - pipelining client for Redis-protocol key-value clusters
//!
//! Keys are spread over a static list of servers with ketama consistent
//! hashing. Commands for one server are pipelined in a [`Batch`], and an
//! [`Executor`] drives the batches of many servers at once under a single
//! deadline. [`ShardedClient`] builds single-key and multi-key operations on
//! top of that with a per-context [`ConnectionPool`].

pub mod batch;
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod ring;

#[cfg(test)]
mod testing;

pub use crate::batch::Batch;
pub use crate::client::{ClientOptions, GetOptions, SetOptions, ShardedClient};
pub use crate::config::Config;
pub use crate::core::{Connection, ConnectionPool, ContextId, PooledConnection, ServerAddress};
pub use crate::error::{ErrorKind, RedshardError, RedshardResult};
pub use crate::executor::{ExecutionSummary, Executor};
pub use crate::protocol::{Reply, WireCodec};
pub use crate::ring::{HashRing, KetamaBuilder};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_manual_pipeline_over_routed_connections() {
        let a = FakeServer::start().await;
        let b = FakeServer::start().await;
        let ring = HashRing::with_servers([a.address().clone(), b.address().clone()]).unwrap();
        let pool = ConnectionPool::default();

        let keys: Vec<String> = (0..8).map(|i| format!("item:{}", i)).collect();
        let mut per_server: Vec<(ServerAddress, Batch)> = Vec::new();
        for key in &keys {
            let address = ring.server_for(key.as_bytes()).clone();
            match per_server.iter_mut().find(|(addr, _)| *addr == address) {
                Some((_, batch)) => {
                    batch.set(key, "1", None);
                }
                None => {
                    let mut batch = Batch::new();
                    batch.set(key, "1", None);
                    per_server.push((address, batch));
                }
            }
        }

        let mut connections = Vec::new();
        for (address, _) in &per_server {
            connections.push(pool.get_connection(address).await.unwrap());
        }

        let mut executor = Executor::new();
        for (conn, (_, batch)) in connections.iter_mut().zip(per_server.iter_mut()) {
            executor.add(&mut **conn, batch);
        }
        let summary = executor.execute(Duration::from_secs(2)).await;
        executor.free();
        assert!(summary.all_completed());

        for (_, batch) in per_server.iter_mut() {
            for _ in 0..batch.commands_written() {
                assert!(matches!(batch.next_reply().unwrap(), Reply::Status(_)));
            }
        }
        drop(connections);

        let client = ShardedClient::new(Arc::new(ring), Arc::new(pool));
        let values = client.mget(&keys).await.unwrap();
        assert!(values
            .values()
            .all(|v| v.as_deref() == Some(&b"1"[..])));
    }
}
