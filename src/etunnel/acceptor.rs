use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::watch,
    time,
};

use crate::etunnel::{
    net,
    registry::{ConnectionId, Registry},
};

pub const DEFAULT_BACKLOG: u32 = 32;

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("open outbound socket: {0}")]
    Socket(#[source] io::Error),

    #[error("bind outbound socket to {addr}: {source}")]
    OutboundBind {
        addr: IpAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {0}: timed out")]
    DialTimeout(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    /// Local address the outbound socket binds to before connecting.
    pub bind_addr: Option<IpAddr>,
    pub backlog: u32,
    /// Zero means wait for the OS connect timeout.
    pub dial_timeout: Duration,
}

pub struct Acceptor {
    listener: TcpListener,
    opts: AcceptorOptions,
    registry: Arc<Registry>,
}

impl Acceptor {
    /// Binds the listening socket. Must be called inside a Tokio runtime.
    pub fn bind(opts: AcceptorOptions, registry: Arc<Registry>) -> Result<Self, AcceptorError> {
        let addr = opts.listen_addr;
        let listen = || -> io::Result<TcpListener> {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(opts.backlog)
        };
        let listener = listen().map_err(|source| AcceptorError::Listen { addr, source })?;

        Ok(Self {
            listener,
            opts,
            registry,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            listen_addr = %self.local_addr()?,
            upstream = %self.opts.upstream_addr,
            bind_addr = ?self.opts.bind_addr,
            backlog = self.opts.backlog,
            "acceptor: listening"
        );

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = self.listener.accept() => {
                    let (inbound, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "acceptor: accept failed");
                            continue;
                        }
                    };

                    tracing::debug!(client = %peer, "acceptor: accepted");

                    if let Err(err) = self.establish(inbound).await {
                        tracing::warn!(client = %peer, err = %err, "acceptor: dropping client");
                    }
                }
            }
        }

        tracing::info!("acceptor: stopped");
        Ok(())
    }

    /// Dials the destination for an accepted client and registers the pair.
    ///
    /// On failure the inbound socket is closed before returning.
    async fn establish(&self, inbound: TcpStream) -> Result<ConnectionId, AcceptorError> {
        match self.dial().await {
            Ok(outbound) => Ok(self.registry.add(inbound, outbound).await),
            Err(err) => {
                net::close_stream(&inbound);
                Err(err)
            }
        }
    }

    async fn dial(&self) -> Result<TcpStream, AcceptorError> {
        let addr = self.opts.upstream_addr;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(AcceptorError::Socket)?;

        if let Some(ip) = self.opts.bind_addr {
            socket
                .bind(SocketAddr::new(ip, 0))
                .map_err(|source| AcceptorError::OutboundBind { addr: ip, source })?;
        }

        let connect = socket.connect(addr);
        let res = if self.opts.dial_timeout > Duration::ZERO {
            time::timeout(self.opts.dial_timeout, connect)
                .await
                .map_err(|_| AcceptorError::DialTimeout(addr))?
        } else {
            connect.await
        };

        res.map_err(|source| AcceptorError::Dial { addr, source })
    }
}
