//! Core networking abstractions: server addresses, connections and the
//! per-context connection pool
pub mod connection;
pub mod pool;

pub use connection::{Connection, ConnectionState};
pub use pool::{ConnectionPool, ContextId, PooledConnection};

use std::fmt;
use std::str::FromStr;

use crate::error::RedshardError;

/// Identifies a backend node
///
/// Immutable value used as the pool key and as the ketama identity of a
/// server (its `host:port` rendering).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check the address can be used for a connection attempt
    pub fn validate(&self) -> Result<(), RedshardError> {
        if self.host.trim().is_empty() {
            return Err(RedshardError::InvalidAddress(format!(
                "empty host in {}",
                self
            )));
        }
        if self.port == 0 {
            return Err(RedshardError::InvalidAddress(format!(
                "port 0 in {}",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = RedshardError;

    /// Parse `host:port`, with IPv6 hosts in brackets (`[::1]:6379`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RedshardError::InvalidAddress(format!("missing port in {:?}", s)))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let port: u16 = port
            .parse()
            .map_err(|_| RedshardError::InvalidAddress(format!("invalid port in {:?}", s)))?;

        let address = ServerAddress::new(host, port);
        address.validate()?;
        Ok(address)
    }
}
