//! DNS seed resolution for bootstrapping the address book.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

/// Resolves a seed hostname into candidate addresses.
#[async_trait]
pub trait SeedResolver: Send + Sync + 'static {
    async fn resolve(&self, seed: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// System resolver with a per-lookup deadline.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    timeout: Duration,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SeedResolver for DnsResolver {
    async fn resolve(&self, seed: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        match tokio::time::timeout(self.timeout, tokio::net::lookup_host((seed, port))).await {
            Ok(addrs) => Ok(addrs?.collect()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("resolving {seed} timed out"),
            )),
        }
    }
}

/// Fixed seed table. Unknown seeds fail like an NXDOMAIN.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: impl Into<String>, addrs: Vec<SocketAddr>) -> Self {
        self.entries.insert(seed.into(), addrs);
        self
    }
}

#[async_trait]
impl SeedResolver for StaticResolver {
    async fn resolve(&self, seed: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
        self.entries
            .get(seed)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such seed: {seed}")))
    }
}
