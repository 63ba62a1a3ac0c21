use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use tokio::{
    net::TcpStream,
    sync::{Mutex, MutexGuard, Notify, futures::Notified},
};

use crate::etunnel::net;

pub type ConnectionId = u64;

/// Which way a chunk travels through a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound client to destination.
    Upstream,
    /// Destination back to the inbound client.
    Downstream,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upstream => write!(f, "upstream"),
            Direction::Downstream => write!(f, "downstream"),
        }
    }
}

/// A tunneled pair: the accepted inbound socket and the outbound socket dialed
/// for it.
///
/// Both sockets are moved in together and only ever closed together, by
/// [`RegistryGuard::remove`] or [`Registry::clear`].
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    local: TcpStream,
    remote: TcpStream,
    client: Option<SocketAddr>,
    upstream: Option<SocketAddr>,
    opened_at: Instant,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, local: TcpStream, remote: TcpStream) -> Self {
        let client = local.peer_addr().ok();
        let upstream = remote.peer_addr().ok();
        Self {
            id,
            local,
            remote,
            client,
            upstream,
            opened_at: Instant::now(),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local(&self) -> &TcpStream {
        &self.local
    }

    pub fn remote(&self) -> &TcpStream {
        &self.remote
    }

    /// Returns `(source, destination)` for a direction.
    pub fn endpoints(&self, dir: Direction) -> (&TcpStream, &TcpStream) {
        match dir {
            Direction::Upstream => (&self.local, &self.remote),
            Direction::Downstream => (&self.remote, &self.local),
        }
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client
    }

    pub fn upstream_addr(&self) -> Option<SocketAddr> {
        self.upstream
    }

    pub fn record(&self, dir: Direction, n: usize) {
        let counter = match dir {
            Direction::Upstream => &self.bytes_upstream,
            Direction::Downstream => &self.bytes_downstream,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes(&self, dir: Direction) -> u64 {
        match dir {
            Direction::Upstream => self.bytes_upstream.load(Ordering::Relaxed),
            Direction::Downstream => self.bytes_downstream.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        net::close_stream(&self.local);
        net::close_stream(&self.remote);

        tracing::debug!(
            conn = self.id,
            client = ?self.client,
            upstream = ?self.upstream,
            bytes_upstream = self.bytes(Direction::Upstream),
            bytes_downstream = self.bytes(Direction::Downstream),
            duration_ms = self.opened_at.elapsed().as_millis() as u64,
            "registry: connection closed"
        );
    }
}

/// Shared table of live connections.
///
/// One mutex covers add, snapshot and removal. Removal is only reachable
/// through [`RegistryGuard`], so a connection can never be torn down while a
/// snapshot is being built.
#[derive(Debug)]
pub struct Registry {
    id_seq: AtomicU64,
    conns: Mutex<BTreeMap<ConnectionId, Arc<Connection>>>,
    changed: Notify,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            id_seq: AtomicU64::new(1),
            conns: Mutex::new(BTreeMap::new()),
            changed: Notify::new(),
        }
    }

    /// Registers an established pair and wakes the multiplexer.
    pub async fn add(&self, local: TcpStream, remote: TcpStream) -> ConnectionId {
        let id = self.id_seq.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, local, remote));

        tracing::debug!(
            conn = id,
            client = ?conn.client_addr(),
            upstream = ?conn.upstream_addr(),
            "registry: connection added"
        );

        self.conns.lock().await.insert(id, conn);
        self.changed.notify_one();
        id
    }

    /// Current connections in id order.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns.lock().await.values().cloned().collect()
    }

    /// Takes the exclusive section used for teardown during a scan.
    pub async fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            conns: self.conns.lock().await,
        }
    }

    /// Resolves once a connection has been added since the last wakeup.
    ///
    /// A notification issued while nobody is waiting is kept, so an add that
    /// lands between a snapshot and the wait is not lost.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.conns.lock().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    #[cfg(test)]
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.conns.lock().await.contains_key(&id)
    }

    /// Tears down every connection. Returns how many were closed.
    pub async fn clear(&self) -> usize {
        let mut conns = self.conns.lock().await;
        let n = conns.len();
        for (_, conn) in std::mem::take(&mut *conns) {
            conn.close();
        }
        n
    }
}

/// Exclusive access to the registry for the duration of a scan.
pub struct RegistryGuard<'a> {
    conns: MutexGuard<'a, BTreeMap<ConnectionId, Arc<Connection>>>,
}

impl RegistryGuard<'_> {
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.conns.contains_key(&id)
    }

    /// Removes a connection and shuts down both of its sockets.
    ///
    /// Returns `None` if it was already removed; nothing is closed twice.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        let conn = self.conns.remove(&id)?;
        conn.close();
        Some(conn)
    }
}
