//! Client pool.
//!
//! A bounded set of clients over one target. Creation is gated by a CAS
//! on an atomic size so at most `max_clients` ever exist; once the pool
//! is full, leases pick a client round-robin from an atomic ticket.
//! The client vector is append-only, so indices handed out in leases
//! stay valid for the life of the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use weft_transport::{StreamFactory, StreamOptions, TcpFactory};

use crate::client::{RpcClient, RpcClientConfig};

#[derive(Clone)]
pub struct ClientPoolConfig {
    pub host: String,
    pub port: u16,
    pub factory: Arc<dyn StreamFactory>,
    pub stream_options: StreamOptions,
    pub ping_interval: Option<Duration>,
    pub encrypt_bodies: bool,
    /// Upper bound on pool size. 0 is treated as 1.
    pub max_clients: usize,
}

impl std::fmt::Debug for ClientPoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPoolConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_clients", &self.max_clients)
            .field("ping_interval", &self.ping_interval)
            .finish_non_exhaustive()
    }
}

impl ClientPoolConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            factory: Arc::new(TcpFactory::new()),
            stream_options: StreamOptions::default(),
            ping_interval: None,
            encrypt_bodies: false,
            max_clients: usize::MAX,
        }
    }

    fn client_config(&self) -> RpcClientConfig {
        RpcClientConfig {
            host: self.host.clone(),
            port: self.port,
            factory: self.factory.clone(),
            stream_options: self.stream_options,
            ping_interval: self.ping_interval,
            encrypt_bodies: self.encrypt_bodies,
        }
    }
}

/// A pool-owned client plus its stable index.
#[derive(Debug, Clone)]
pub struct ClientLease {
    pub client: Arc<RpcClient>,
    pub index: usize,
}

impl ClientLease {
    pub fn get(&self) -> &Arc<RpcClient> {
        &self.client
    }
}

pub struct RpcClientPool {
    config: ClientPoolConfig,
    size: AtomicUsize,
    rr: AtomicUsize,
    clients: RwLock<Vec<Arc<RpcClient>>>,
}

impl std::fmt::Debug for RpcClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientPool")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl RpcClientPool {
    pub fn new(mut config: ClientPoolConfig) -> Self {
        if config.max_clients == 0 {
            warn!("max_clients of 0 treated as 1");
            config.max_clients = 1;
        }
        Self {
            config,
            size: AtomicUsize::new(0),
            rr: AtomicUsize::new(0),
            clients: RwLock::new(Vec::new()),
        }
    }

    /// Lease a client. Creates one while under capacity, otherwise
    /// round-robins across the existing set; since clients multiplex,
    /// any number of leases may share one client.
    pub fn acquire(&self) -> ClientLease {
        if let Some(index) = self.try_create_one() {
            let clients = self.clients.read();
            return ClientLease {
                client: clients[index].clone(),
                index,
            };
        }

        let ticket = self.rr.fetch_add(1, Ordering::AcqRel);
        loop {
            {
                let clients = self.clients.read();
                let size = clients.len();
                if size > 0 {
                    let index = if size.is_power_of_two() {
                        ticket & (size - 1)
                    } else {
                        ticket % size
                    };
                    return ClientLease {
                        client: clients[index].clone(),
                        index,
                    };
                }
            }
            // Another task won the creation race but has not pushed yet.
            std::thread::yield_now();
        }
    }

    /// Reserve a creation slot with a CAS on `size`; `None` once full.
    fn try_create_one(&self) -> Option<usize> {
        loop {
            let current = self.size.load(Ordering::Acquire);
            if current >= self.config.max_clients {
                return None;
            }
            if self
                .size
                .compare_exchange_weak(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            let client = RpcClient::with_config(self.config.client_config());
            let mut clients = self.clients.write();
            let index = clients.len();
            clients.push(client);
            debug!(index, "created pool client");
            return Some(index);
        }
    }

    /// Number of clients created so far.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.config.max_clients
    }

    pub fn config(&self) -> &ClientPoolConfig {
        &self.config
    }

    /// Close every client. Pending calls observe teardown fan-out.
    pub async fn close(&self) {
        let clients: Vec<Arc<RpcClient>> = self.clients.read().clone();
        for client in clients {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize) -> RpcClientPool {
        let mut config = ClientPoolConfig::new("127.0.0.1", 1);
        config.max_clients = max;
        RpcClientPool::new(config)
    }

    #[test]
    fn grows_to_capacity_then_round_robins() {
        let pool = pool(4);

        let first: Vec<usize> = (0..4).map(|_| pool.acquire().index).collect();
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(pool.size(), 4);

        // Past capacity, leases cycle through existing clients.
        let next: Vec<usize> = (0..8).map(|_| pool.acquire().index).collect();
        assert_eq!(pool.size(), 4);
        for index in &next {
            assert!(*index < 4);
        }
        // Round-robin touches every client over a full cycle.
        let mut seen = next.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let pool = pool(0);
        assert_eq!(pool.capacity(), 1);
        let lease = pool.acquire();
        assert_eq!(lease.index, 0);
        assert_eq!(pool.acquire().index, 0);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn leases_share_clients_by_pointer() {
        let pool = pool(1);
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(Arc::ptr_eq(&a.client, &b.client));
    }

    #[test]
    fn non_power_of_two_sizes_use_modulo() {
        let pool = pool(3);
        for _ in 0..3 {
            pool.acquire();
        }
        let indices: Vec<usize> = (0..6).map(|_| pool.acquire().index).collect();
        for index in &indices {
            assert!(*index < 3);
        }
    }

    #[test]
    fn concurrent_acquire_never_exceeds_capacity() {
        let pool = Arc::new(pool(4));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let lease = pool.acquire();
                    assert!(lease.index < 4);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.size() <= 4);
    }
}
