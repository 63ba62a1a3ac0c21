//! Relay multiplexer.
//!
//! A single task owns all data movement. Each cycle it snapshots the
//! registry, waits until any endpoint is readable (or the poll interval
//! lapses), then services ready connections in snapshot order while holding
//! the registry lock.

use std::{
    io,
    sync::Arc,
    task::Poll,
    time::Duration,
};

use tokio::{net::TcpStream, sync::watch, time};

use crate::etunnel::registry::{Connection, Direction, Registry};

/// Tracing target for the `-d` payload echo.
pub const PAYLOAD_TARGET: &str = "etunnel::payload";

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_ECHO_LIMIT: usize = 1024;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub chunk_size: usize,
    pub poll_interval: Duration,
    /// When set, up to this many bytes of every chunk are echoed, along with
    /// every dead read or write.
    pub echo_limit: Option<usize>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            echo_limit: None,
        }
    }
}

/// Outcome of one read/write step.
#[derive(Debug)]
pub enum Forward {
    /// `n` bytes moved. Zero means the readiness was spurious.
    Alive(usize),
    Dead(DeadReason),
}

#[derive(Debug)]
pub enum DeadReason {
    Eof,
    Read(io::Error),
    Write(io::Error),
}

impl std::fmt::Display for DeadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadReason::Eof => write!(f, "end of stream"),
            DeadReason::Read(e) => write!(f, "read: {e}"),
            DeadReason::Write(e) => write!(f, "write: {e}"),
        }
    }
}

/// Moves one chunk from `source` to `destination`.
///
/// Exactly one read is issued. Whatever it returned is written out before
/// returning; nothing is carried over to the next call.
pub async fn forward(source: &TcpStream, destination: &TcpStream, buf: &mut [u8]) -> Forward {
    let n = match source.try_read(buf) {
        Ok(0) => return Forward::Dead(DeadReason::Eof),
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Forward::Alive(0),
        Err(e) => return Forward::Dead(DeadReason::Read(e)),
    };

    match write_chunk(destination, &buf[..n]).await {
        Ok(()) => Forward::Alive(n),
        Err(e) => Forward::Dead(DeadReason::Write(e)),
    }
}

async fn write_chunk(dst: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        dst.writable().await?;
        match dst.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
struct Readiness {
    local: bool,
    remote: bool,
}

impl Readiness {
    fn any(&self) -> bool {
        self.local || self.remote
    }
}

/// Waits until at least one endpoint in `snapshot` is readable.
///
/// Returns an empty vector when `timeout` lapses first.
async fn wait_readable(snapshot: &[Arc<Connection>], timeout: Duration) -> Vec<Readiness> {
    let poll = std::future::poll_fn(|cx| {
        let mut ready = vec![Readiness::default(); snapshot.len()];
        for (r, conn) in ready.iter_mut().zip(snapshot) {
            // Errors count as readable; the following read reports them.
            r.local = conn.local().poll_read_ready(cx).is_ready();
            r.remote = conn.remote().poll_read_ready(cx).is_ready();
        }
        if ready.iter().any(Readiness::any) {
            Poll::Ready(ready)
        } else {
            Poll::Pending
        }
    });

    time::timeout(timeout, poll).await.unwrap_or_default()
}

pub struct Multiplexer {
    registry: Arc<Registry>,
    opts: RelayOptions,
}

impl Multiplexer {
    pub fn new(registry: Arc<Registry>, opts: RelayOptions) -> Self {
        Self { registry, opts }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.opts.chunk_size.max(1)];

        loop {
            if *shutdown.borrow() {
                break;
            }

            let snapshot = self.registry.snapshot().await;

            let ready = if snapshot.is_empty() {
                // Nothing to watch: sleep until the acceptor adds something.
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = self.registry.changed() => continue,
                }
            } else {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = self.registry.changed() => continue,
                    ready = wait_readable(&snapshot, self.opts.poll_interval) => ready,
                }
            };

            if ready.is_empty() {
                continue;
            }

            self.service(&snapshot, &ready, &mut buf).await;
        }

        let closed = self.registry.clear().await;
        tracing::info!(closed, "relay: stopped");
        Ok(())
    }

    /// Services every ready connection once per direction.
    async fn service(&self, snapshot: &[Arc<Connection>], ready: &[Readiness], buf: &mut [u8]) {
        let mut guard = self.registry.lock().await;

        for (conn, r) in snapshot.iter().zip(ready) {
            if !r.any() || !guard.contains(conn.id()) {
                continue;
            }

            let mut dead = None;
            if r.local {
                if let Some(reason) = self.step(conn, Direction::Upstream, buf).await {
                    dead = Some(reason);
                }
            }
            if r.remote {
                if let Some(reason) = self.step(conn, Direction::Downstream, buf).await {
                    dead.get_or_insert(reason);
                }
            }

            if let Some(reason) = dead {
                if let Some(conn) = guard.remove(conn.id()) {
                    tracing::info!(
                        conn = conn.id(),
                        client = ?conn.client_addr(),
                        reason = %reason,
                        bytes_upstream = conn.bytes(Direction::Upstream),
                        bytes_downstream = conn.bytes(Direction::Downstream),
                        "relay: connection torn down"
                    );
                }
            }
        }
    }

    /// Runs one forward and returns why the connection died, if it did.
    async fn step(&self, conn: &Connection, dir: Direction, buf: &mut [u8]) -> Option<DeadReason> {
        let (src, dst) = conn.endpoints(dir);
        match forward(src, dst, buf).await {
            Forward::Alive(0) => None,
            Forward::Alive(n) => {
                conn.record(dir, n);
                if let Some(limit) = self.opts.echo_limit {
                    tracing::debug!(
                        target: PAYLOAD_TARGET,
                        conn = conn.id(),
                        dir = %dir,
                        len = n,
                        payload = %String::from_utf8_lossy(&buf[..n.min(limit)]),
                        "relay: chunk"
                    );
                }
                None
            }
            Forward::Dead(reason) => {
                if self.opts.echo_limit.is_some() {
                    tracing::debug!(
                        target: PAYLOAD_TARGET,
                        conn = conn.id(),
                        dir = %dir,
                        reason = %reason,
                        "relay: dead"
                    );
                } else {
                    tracing::debug!(conn = conn.id(), dir = %dir, reason = %reason, "relay: dead");
                }
                Some(reason)
            }
        }
    }
}
