//! A single TCP connection to one server
//!
//! The connection only knows how to flush a batch's pending commands and
//! read until the batch holds a reply for each of them. Deadlines, retries
//! and reconnects belong to the executor and the client.
use std::fmt;
use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::ServerAddress;
use crate::batch::Batch;
use crate::error::{RedshardError, RedshardResult};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Connection state machine
///
/// `Closed --connect--> Connected --I/O error--> Aborted`, and
/// `Connected | Aborted --free--> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Aborted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Aborted => write!(f, "aborted"),
        }
    }
}

/// One socket to one server address
#[derive(Debug)]
pub struct Connection {
    address: ServerAddress,
    stream: Option<TcpStream>,
    state: ConnectionState,
}

impl Connection {
    /// Resolve `address` and establish a socket to it
    pub async fn connect(
        address: &ServerAddress,
        connect_timeout: Duration,
    ) -> RedshardResult<Connection> {
        address.validate()?;

        let mut conn = Connection::closed(address.clone());
        conn.state = ConnectionState::Connecting;
        debug!("Connecting to {}", address);

        let attempt = TcpStream::connect((address.host(), address.port()));
        match timeout(connect_timeout, attempt).await {
            Ok(Ok(stream)) => {
                if let Err(e) = configure_stream(&stream) {
                    warn!("Failed to configure stream to {}: {}", address, e);
                }
                conn.stream = Some(stream);
                conn.state = ConnectionState::Connected;
                debug!("Connected to {}", address);
                Ok(conn)
            }
            Ok(Err(e)) => {
                debug!("Failed to connect to {}: {}", address, e);
                Err(RedshardError::connection(address, e))
            }
            Err(_) => {
                debug!("Timeout connecting to {}", address);
                Err(RedshardError::connection(
                    address,
                    format!("connect timed out after {}ms", connect_timeout.as_millis()),
                ))
            }
        }
    }

    /// A connection object with no socket
    pub(crate) fn closed(address: ServerAddress) -> Connection {
        Connection {
            address,
            stream: None,
            state: ConnectionState::Closed,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the socket can carry another pipeline
    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Drop the socket after a transport or protocol failure
    ///
    /// Replies that were still in flight would desynchronise the next
    /// pipeline, so an aborted connection is never reused.
    pub fn abort(&mut self) {
        if self.state == ConnectionState::Connected {
            warn!("Aborting connection to {}", self.address);
        }
        self.stream = None;
        self.state = ConnectionState::Aborted;
    }

    /// Close the socket; the connection cannot be used afterwards
    pub fn free(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed connection to {}", self.address);
        }
        self.state = ConnectionState::Closed;
    }

    /// Flush the batch's pending commands and read until every command has
    /// a complete reply
    pub(crate) async fn execute_batch(&mut self, batch: &mut Batch) -> RedshardResult<()> {
        let address = &self.address;
        let stream = match (self.state, self.stream.as_mut()) {
            (ConnectionState::Connected, Some(stream)) => stream,
            (state, _) => {
                return Err(RedshardError::connection(
                    address,
                    format!("connection is {}", state),
                ))
            }
        };

        if !batch.pending_bytes().is_empty() {
            stream
                .write_all(batch.pending_bytes())
                .await
                .map_err(|e| RedshardError::connection(address, e))?;
            batch.mark_flushed();
        }

        while !batch.is_complete() {
            let n = stream
                .read_buf(batch.receive_buffer())
                .await
                .map_err(|e| RedshardError::connection(address, e))?;
            if n == 0 {
                return Err(RedshardError::connection(
                    address,
                    "connection closed by server",
                ));
            }
            batch.scan_received()?;
        }

        Ok(())
    }
}

/// Latency-oriented socket options
fn configure_stream(stream: &TcpStream) -> Result<(), io::Error> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let address = ServerAddress::new("127.0.0.1", port);
        let conn = Connection::connect(&address, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.is_usable());
        assert_eq!(conn.address(), &address);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let address = ServerAddress::new("127.0.0.1", port);
        let result = Connection::connect(&address, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RedshardError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_address() {
        let address = ServerAddress::new("", 6379);
        let result = Connection::connect(&address, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RedshardError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let mut conn = Connection::closed(ServerAddress::new("127.0.0.1", 6379));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_usable());

        conn.abort();
        assert_eq!(conn.state(), ConnectionState::Aborted);
        conn.free();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_execute_on_closed_connection_fails() {
        let mut conn = Connection::closed(ServerAddress::new("127.0.0.1", 6379));
        let mut batch = Batch::new();
        batch.get("key");
        let result = conn.execute_batch(&mut batch).await;
        assert!(matches!(result, Err(RedshardError::Connection { .. })));
    }
}
