//! Plaintext DNS listeners relaying every query to the DoT upstream.
//!
//! Each datagram or accepted connection is served by its own task, so a slow
//! upstream round trip never holds up the receive/accept loop. Cancelling the
//! token stops the loop. In-flight UDP queries are abandoned too, so no task
//! keeps the socket open after cancellation; TCP connections already accepted
//! finish (or not) on their own.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::framing;
use crate::proto_utils::{peek_question, peek_rcode};
use crate::upstream::Upstream;

/// Largest datagram accepted from a UDP client.
pub const MAX_UDP_QUERY: usize = 1024;
/// Largest framed query taken from a TCP client in its single read.
pub const MAX_TCP_QUERY: usize = 4096;

const UDP_SOCKET_BUFFER: usize = 1024 * 1024;

/// Entry point shared by both listeners. Cloning is cheap and the upstream
/// description is never mutated after construction.
#[derive(Clone)]
pub struct DnsProxy {
    upstream: Arc<Upstream>,
}

impl DnsProxy {
    pub fn new(upstream: Upstream) -> Self {
        Self {
            upstream: Arc::new(upstream),
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Bind and serve UDP until `shutdown` fires. Only bind failures are returned.
    pub async fn listen_udp(
        &self,
        shutdown: CancellationToken,
        host: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        let server = self.bind_udp(host, port).await?;
        info!(bind_udp = %server.local_addr(), upstream = %self.upstream.addr(), "udp listener started");
        server.serve(shutdown).await;
        Ok(())
    }

    /// Bind and serve TCP until `shutdown` fires. Only bind failures are returned.
    pub async fn listen_tcp(
        &self,
        shutdown: CancellationToken,
        host: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        let server = self.bind_tcp(host, port).await?;
        info!(bind_tcp = %server.local_addr(), upstream = %self.upstream.addr(), "tcp listener started");
        server.serve(shutdown).await;
        Ok(())
    }

    pub async fn bind_udp(&self, host: &str, port: u16) -> Result<UdpServer, ProxyError> {
        let addr = resolve_listen_addr(host, port).await?;
        let socket = create_udp_socket(addr).map_err(|e| ProxyError::bind(addr, e))?;
        let local_addr = socket.local_addr().map_err(|e| ProxyError::bind(addr, e))?;
        Ok(UdpServer {
            socket: Arc::new(socket),
            local_addr,
            upstream: Arc::clone(&self.upstream),
        })
    }

    pub async fn bind_tcp(&self, host: &str, port: u16) -> Result<TcpServer, ProxyError> {
        let addr = resolve_listen_addr(host, port).await?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::bind(addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::bind(addr, e))?;
        Ok(TcpServer {
            listener,
            local_addr,
            upstream: Arc::clone(&self.upstream),
        })
    }
}

/// A bound UDP socket waiting to be served.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    upstream: Arc<Upstream>,
}

impl UdpServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self, shutdown: CancellationToken) {
        let mut buf = [0u8; MAX_UDP_QUERY];

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => res,
            };

            let (len, peer) = match received {
                Ok(v) => v,
                Err(err) => {
                    warn!(error = %ProxyError::Read(err), "udp receive failed");
                    continue;
                }
            };
            debug!(peer = %peer, len, "accepted udp query");

            let query = match framing::frame(&buf[..len]) {
                Ok(q) => q,
                Err(err) => {
                    warn!(peer = %peer, error = %err, "dropping udp query");
                    continue;
                }
            };

            // tasks hold the socket too; they must let go of it once cancelled
            let socket = Arc::clone(&self.socket);
            let upstream = Arc::clone(&self.upstream);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(peer = %peer, "udp query dropped by shutdown");
                    }
                    res = relay_udp(&socket, &upstream, query, peer) => {
                        if let Err(err) = res {
                            warn!(peer = %peer, error = %err, "udp query abandoned");
                        }
                    }
                }
            });
        }

        info!(bind_udp = %self.local_addr, "udp listener stopped");
    }
}

/// A bound TCP listener waiting to be served.
pub struct TcpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    upstream: Arc<Upstream>,
}

impl TcpServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = self.listener.accept() => res,
            };

            let (stream, peer) = match accepted {
                Ok(v) => v,
                Err(err) => {
                    warn!(error = %ProxyError::Accept(err), "tcp accept failed");
                    continue;
                }
            };
            debug!(peer = %peer, "accepted tcp connection");

            let upstream = Arc::clone(&self.upstream);
            tokio::spawn(async move {
                if let Err(err) = relay_tcp(stream, peer, &upstream).await {
                    warn!(peer = %peer, error = %err, "tcp query abandoned");
                }
            });
        }

        info!(bind_tcp = %self.local_addr, "tcp listener stopped");
    }
}

async fn relay_udp(
    socket: &UdpSocket,
    upstream: &Upstream,
    query: Bytes,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    log_question(peer, &query);
    let response = upstream.forward(&query).await?;

    let Some(answer) = framing::unframe(&response) else {
        warn!(peer = %peer, len = response.len(), "upstream response too short, dropped");
        return Ok(());
    };
    log_answer(peer, answer);

    socket
        .send_to(answer, peer)
        .await
        .map_err(|source| ProxyError::Reply { peer, source })?;
    Ok(())
}

async fn relay_tcp(
    mut stream: TcpStream,
    peer: SocketAddr,
    upstream: &Upstream,
) -> Result<(), ProxyError> {
    let mut buf = vec![0u8; MAX_TCP_QUERY];
    let n = stream.read(&mut buf).await.map_err(ProxyError::Read)?;
    if n == 0 {
        return Err(ProxyError::Read(io::ErrorKind::UnexpectedEof.into()));
    }
    buf.truncate(n);
    log_question(peer, &buf);

    let response = upstream.forward(&buf).await?;
    if let Some(answer) = framing::unframe(&response) {
        log_answer(peer, answer);
    }

    stream
        .write_all(&response)
        .await
        .map_err(|source| ProxyError::Reply { peer, source })?;
    if let Err(err) = stream.shutdown().await {
        debug!(peer = %peer, error = %err, "tcp shutdown after reply failed");
    }
    Ok(())
}

fn log_question(peer: SocketAddr, framed: &[u8]) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    match framing::unframe(framed).and_then(peek_question) {
        Some(q) => {
            debug!(peer = %peer, tx_id = q.tx_id, qname = %q.qname, qtype = %q.qtype, "forwarding query")
        }
        None => debug!(peer = %peer, len = framed.len(), "forwarding unparsed query"),
    }
}

fn log_answer(peer: SocketAddr, answer: &[u8]) {
    if let Some(rcode) = peek_rcode(answer) {
        debug!(peer = %peer, rcode = %rcode, len = answer.len(), "relaying response");
    }
}

async fn resolve_listen_addr(host: &str, port: u16) -> Result<SocketAddr, ProxyError> {
    let target = format!("{host}:{port}");
    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProxyError::bind(&target, e))?
        .next()
        .ok_or_else(|| {
            ProxyError::bind(
                &target,
                io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"),
            )
        })
}

fn create_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    let _ = socket.set_recv_buffer_size(UDP_SOCKET_BUFFER);
    let _ = socket.set_send_buffer_size(UDP_SOCKET_BUFFER);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
