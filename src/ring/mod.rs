//! Ketama consistent hash ring
//!
//! Compatible with libketama: each server contributes points derived from
//! MD5 digests of `"<host:port>-<k>"`, and a key lands on the first point at
//! or after the little-endian prefix of its own MD5 digest. Adding a server
//! moves roughly `1/N` of the keys.

use crate::core::ServerAddress;
use crate::error::{RedshardError, RedshardResult};

/// Digests per server for an even share of the ring; each digest yields
/// four points.
const DIGESTS_PER_SERVER: u64 = 40;
const POINTS_PER_DIGEST: usize = 4;

#[derive(Debug, Clone)]
struct ServerEntry {
    address: ServerAddress,
    weight: u32,
}

/// Collects servers before the continuum is computed
#[derive(Debug, Default)]
pub struct KetamaBuilder {
    servers: Vec<ServerEntry>,
}

impl KetamaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server; its ordinal is the number of servers added before it
    pub fn add_server(&mut self, address: ServerAddress, weight: u32) -> RedshardResult<()> {
        address.validate()?;
        if weight == 0 {
            return Err(RedshardError::InvalidAddress(format!(
                "weight of {} must be greater than zero",
                address
            )));
        }
        self.servers.push(ServerEntry { address, weight });
        Ok(())
    }

    /// Chained form of [`add_server`](Self::add_server)
    pub fn server(mut self, address: ServerAddress, weight: u32) -> RedshardResult<Self> {
        self.add_server(address, weight)?;
        Ok(self)
    }

    /// Compute the continuum and freeze the ring
    pub fn create_continuum(self) -> RedshardResult<HashRing> {
        if self.servers.is_empty() {
            return Err(RedshardError::EmptyRing);
        }

        let server_count = self.servers.len() as u64;
        let total_weight: u64 = self.servers.iter().map(|s| u64::from(s.weight)).sum();

        let mut points = Vec::new();
        for (ordinal, server) in self.servers.iter().enumerate() {
            // floor(weight / total * 40 * count), kept in integers
            let digests =
                u64::from(server.weight) * DIGESTS_PER_SERVER * server_count / total_weight;
            let identity = server.address.to_string();

            for k in 0..digests {
                let digest = md5::compute(format!("{}-{}", identity, k)).0;
                for chunk in digest.chunks_exact(POINTS_PER_DIGEST) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    points.push((point, ordinal));
                }
            }
        }

        // Ties resolve to the lowest ordinal
        points.sort_unstable();

        Ok(HashRing {
            points: points.into_boxed_slice(),
            servers: self.servers,
        })
    }
}

/// Immutable key → server mapping
///
/// Only obtainable from [`KetamaBuilder::create_continuum`], so every ring
/// has at least one server and lookups cannot fail.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// `(point, ordinal)` sorted ascending
    points: Box<[(u32, usize)]>,
    servers: Vec<ServerEntry>,
}

impl HashRing {
    pub fn builder() -> KetamaBuilder {
        KetamaBuilder::new()
    }

    /// Build a ring of equally weighted servers
    pub fn with_servers<I>(addresses: I) -> RedshardResult<HashRing>
    where
        I: IntoIterator<Item = ServerAddress>,
    {
        let mut builder = KetamaBuilder::new();
        for address in addresses {
            builder.add_server(address, 1)?;
        }
        builder.create_continuum()
    }

    /// Ordinal of the server owning `key`
    pub fn get_server_ordinal(&self, key: &[u8]) -> usize {
        let hash = key_hash(key);
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        // Past the last point wraps to the first; a finalized continuum is
        // never empty
        self.points
            .get(idx)
            .or_else(|| self.points.first())
            .map_or(0, |&(_, ordinal)| ordinal)
    }

    pub fn get_server_address(&self, ordinal: usize) -> Option<&ServerAddress> {
        self.servers.get(ordinal).map(|s| &s.address)
    }

    /// Address of the server owning `key`
    pub fn server_for(&self, key: &[u8]) -> &ServerAddress {
        &self.servers[self.get_server_ordinal(key)].address
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Servers in ordinal order with their weight and number of points
    pub fn distribution(&self) -> Vec<(&ServerAddress, u32, usize)> {
        let mut counts = vec![0usize; self.servers.len()];
        for &(_, ordinal) in self.points.iter() {
            counts[ordinal] += 1;
        }
        self.servers
            .iter()
            .zip(counts)
            .map(|(server, count)| (&server.address, server.weight, count))
            .collect()
    }
}

/// First four bytes of the key's MD5 digest, little-endian
fn key_hash(key: &[u8]) -> u32 {
    let digest = md5::compute(key).0;
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
