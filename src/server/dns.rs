// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Plain DNS over UDP and TCP. The TCP side implements RFC 7766 pipelining:
//! queries are read back-to-back, answered out of order, and writes to the
//! shared connection are serialized through a per-connection mutex. The same
//! loop also backs the DoT server, which layers a TLS acceptor on top.

use super::{ServerBase, ServerError};
use crate::{
    buf::BufPool,
    context::{QueryContext, RequestInfo, ServerInfo},
    handler::{
        writer::{self, ResponseWriter, WriterError},
        Handler,
    },
    message::{normalize, reflect_tcp_keepalive, MAX_MSG_SIZE},
    metrics::{EmptyMetricsListener, MetricsListener},
    proto::{Network, Protocol},
    Label,
};
use async_trait::async_trait;
use log::{debug, info};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::Semaphore,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use trust_dns_proto::op::Message;

/// Default idle deadline between pipelined queries on one TCP connection.
pub const DEFAULT_TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// The edns-tcp-keepalive value is a u16 counting 100 ms units, which caps
// the advertisable idle timeout (RFC 7828).
const MAX_TCP_IDLE_TIMEOUT: Duration = Duration::from_millis(u16::MAX as u64 * 100);

// Pause after a failed accept so a hot error (EMFILE and friends) does not
// spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for [`DnsServer`]. The same knobs feed the DoT server.
pub struct DnsConfig {
    /// Server name for logs and metrics.
    pub name: String,
    /// Address to listen on.
    pub addr: SocketAddr,
    /// Which transports to open.
    pub network: Network,
    /// The handler chain queries are dispatched to.
    pub handler: Arc<dyn Handler>,
    /// Observability hooks.
    pub metrics: Arc<dyn MetricsListener>,
    /// Deadline for the first read on a connection (and the TLS handshake).
    pub read_timeout: Duration,
    /// Deadline for writing one response.
    pub write_timeout: Duration,
    /// Idle deadline between queries on one TCP connection, capped at the
    /// largest value RFC 7828 can advertise.
    pub tcp_idle_timeout: Duration,
    /// Upper bound for UDP responses regardless of what the client
    /// advertises via EDNS(0).
    pub max_udp_resp_size: u16,
    /// Size of the pooled UDP read buffers; datagrams beyond it are cut off.
    pub udp_size: usize,
    /// Concurrent pipelined queries allowed per TCP connection; 0 disables
    /// the limit.
    pub max_pipeline_count: usize,
    /// Worker cap shared by all listeners of this server.
    pub max_workers: usize,
}

impl DnsConfig {
    /// Config with the defaults the other fields document.
    pub fn new(name: impl Into<String>, addr: SocketAddr, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            addr,
            network: Network::Any,
            handler,
            metrics: Arc::new(EmptyMetricsListener),
            read_timeout: super::DEFAULT_READ_TIMEOUT,
            write_timeout: super::DEFAULT_WRITE_TIMEOUT,
            tcp_idle_timeout: DEFAULT_TCP_IDLE_TIMEOUT,
            max_udp_resp_size: u16::MAX,
            udp_size: 512,
            max_pipeline_count: 100,
            max_workers: super::DEFAULT_MAX_WORKERS,
        }
    }
}

// Knobs the transport loops need, shared between plain TCP and DoT.
pub(crate) struct TransportOpts {
    pub(crate) proto: Protocol,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) tcp_idle_timeout: Duration,
    pub(crate) max_udp_resp_size: u16,
    pub(crate) udp_size: usize,
    pub(crate) max_pipeline_count: usize,
}

impl TransportOpts {
    pub(crate) fn from_config(cfg: &DnsConfig, proto: Protocol) -> Arc<Self> {
        Arc::new(Self {
            proto,
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
            tcp_idle_timeout: cfg.tcp_idle_timeout.min(MAX_TCP_IDLE_TIMEOUT),
            max_udp_resp_size: cfg.max_udp_resp_size,
            udp_size: cfg.udp_size,
            max_pipeline_count: cfg.max_pipeline_count,
        })
    }
}

/// Plain DNS server: a UDP datagram loop and/or a pipelined TCP loop.
pub struct DnsServer {
    base: Arc<ServerBase>,
    addr: SocketAddr,
    network: Network,
    opts: Arc<TransportOpts>,
    udp_addr: Mutex<Option<SocketAddr>>,
    tcp_addr: Mutex<Option<SocketAddr>>,
}

impl DnsServer {
    /// Create the server; no sockets are opened until [`start`](Self::start).
    pub fn new(cfg: DnsConfig) -> Self {
        let opts = TransportOpts::from_config(&cfg, Protocol::Dns);
        let info = ServerInfo::new(cfg.name.as_str(), cfg.addr, Protocol::Dns);
        Self {
            base: ServerBase::new(info, cfg.handler, cfg.metrics, cfg.max_workers),
            addr: cfg.addr,
            network: cfg.network,
            opts,
            udp_addr: Mutex::new(None),
            tcp_addr: Mutex::new(None),
        }
    }

    /// Open the listeners the configured network asks for and return. Fails
    /// if the server was started before.
    pub async fn start(&self) -> super::Result<()> {
        self.base.begin_start()?;

        if self.network.wants_udp() {
            let socket = Arc::new(bind_udp(self.addr)?);
            let local = socket.local_addr()?;
            *self.udp_addr.lock().expect("addr poisoned") = Some(local);
            info!("server {} is listening on udp://{}", self.base.info().name(), local);
            self.base
                .spawn_listener("udp", serve_udp(self.base.clone(), socket, self.opts.clone()));
        }

        if self.network.wants_tcp() {
            let listener = TcpListener::bind(self.addr).await?;
            let local = listener.local_addr()?;
            *self.tcp_addr.lock().expect("addr poisoned") = Some(local);
            info!("server {} is listening on tcp://{}", self.base.info().name(), local);
            self.base.spawn_listener(
                "tcp",
                serve_tcp(self.base.clone(), listener, None, self.opts.clone()),
            );
        }

        Ok(())
    }

    /// Stop accepting, unblock connection reads, and wait until in-flight
    /// queries drain or `deadline` passes.
    pub async fn shutdown(&self, deadline: Duration) -> super::Result<()> {
        self.base.begin_shutdown()?;
        self.base.wait_drained(deadline).await
    }

    /// Address of the UDP listener, once started.
    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.lock().expect("addr poisoned")
    }

    /// Address of the TCP listener, once started.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.lock().expect("addr poisoned")
    }
}

fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::DGRAM,
        Some(SockProtocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

async fn serve_udp(
    base: Arc<ServerBase>,
    socket: Arc<UdpSocket>,
    opts: Arc<TransportOpts>,
) -> super::Result<()> {
    let local = socket.local_addr()?;
    let bufs = Arc::new(BufPool::new(opts.udp_size));

    loop {
        let mut buf = bufs.get();
        let (len, peer) = tokio::select! {
            _ = base.token().cancelled() => return Ok(()),
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    debug!("udp read on {} failed: {}", base.info().name(), e);
                    continue;
                }
            },
        };
        buf.truncate(len);

        let job = {
            let base = base.clone();
            let socket = socket.clone();
            let bufs = bufs.clone();
            let opts = opts.clone();
            async move {
                serve_udp_msg(&base, socket, local, peer, &buf, &opts).await;
                bufs.put(buf);
            }
        };
        if let Err(e) = base.pool().try_submit_tracked(base.tracker(), job) {
            debug!("dropping udp query from {}: {}", peer, e);
        }
    }
}

async fn serve_udp_msg(
    base: &ServerBase,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peer: SocketAddr,
    wire: &[u8],
    opts: &TransportOpts,
) {
    let req = match Message::from_vec(wire) {
        Ok(m) => m,
        Err(e) => {
            debug!("dropping unparsable udp message from {}: {}", peer, e);
            base.metrics().on_invalid_msg(peer);
            return;
        }
    };

    let cx = QueryContext::new(base.info().clone(), RequestInfo::new());
    let mut rw = UdpResponseWriter {
        socket,
        local,
        remote: peer,
        max_udp_resp_size: opts.max_udp_resp_size,
        write_timeout: opts.write_timeout,
    };
    if let Err(e) = base.dispatch(&cx, &mut rw, &req).await {
        debug!("udp query from {} was not completed: {}", peer, e);
    }
}

/// Writer for UDP responses. Enforces the advertised-size/configured-cap/512
/// budget through the normalizer before the datagram goes out.
pub struct UdpResponseWriter {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    remote: SocketAddr,
    max_udp_resp_size: u16,
    write_timeout: Duration,
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_msg(
        &mut self,
        _cx: &QueryContext,
        req: &Message,
        mut resp: Message,
    ) -> writer::Result<()> {
        normalize(
            Network::Udp,
            Protocol::Dns,
            req,
            &mut resp,
            self.max_udp_resp_size,
        )?;
        let wire = resp.to_vec()?;
        timeout(self.write_timeout, self.socket.send_to(&wire, self.remote))
            .await
            .map_err(|_| write_timed_out())??;
        Ok(())
    }
}

fn write_timed_out() -> WriterError {
    WriterError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        "response write timed out",
    ))
}

// EOFs and resets are business as usual on a DNS TCP socket; anything else
// is worth a debug line.
fn is_quiet_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

pub(crate) async fn serve_tcp(
    base: Arc<ServerBase>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    opts: Arc<TransportOpts>,
) -> super::Result<()> {
    let local = listener.local_addr()?;
    let bufs = Arc::new(BufPool::new(MAX_MSG_SIZE));

    loop {
        let (stream, peer) = tokio::select! {
            _ = base.token().cancelled() => return Ok(()),
            r = listener.accept() => match r {
                Ok(v) => v,
                Err(e) => {
                    debug!("tcp accept on {} failed: {}", base.info().name(), e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let conn = serve_tcp_conn(
            base.clone(),
            stream,
            peer,
            local,
            tls.clone(),
            bufs.clone(),
            opts.clone(),
        );
        if let Err(e) = base.pool().try_submit_tracked(base.tracker(), conn) {
            debug!("dropping tcp connection from {}: {}", peer, e);
        }
    }
}

async fn serve_tcp_conn(
    base: Arc<ServerBase>,
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    tls: Option<TlsAcceptor>,
    bufs: Arc<BufPool>,
    opts: Arc<TransportOpts>,
) {
    match tls {
        Some(acceptor) => {
            let accepted = match timeout(opts.read_timeout, acceptor.accept(stream)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    debug!("tls handshake with {} failed: {}", peer, e);
                    return;
                }
                Err(_) => {
                    debug!("tls handshake with {} timed out", peer);
                    return;
                }
            };
            let sni: Option<Label> = accepted.get_ref().1.server_name().map(Arc::from);
            // Dropping the stream at the end closes the raw TCP socket
            // without the close-notify exchange; waiting for it hangs
            // against misbehaving clients.
            serve_tcp_stream(base, accepted, peer, local, sni, bufs, opts).await;
        }
        None => serve_tcp_stream(base, stream, peer, local, None, bufs, opts).await,
    }
}

async fn serve_tcp_stream<S>(
    base: Arc<ServerBase>,
    stream: S,
    peer: SocketAddr,
    local: SocketAddr,
    sni: Option<Label>,
    bufs: Arc<BufPool>,
    opts: Arc<TransportOpts>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_token = base.token().child_token();
    let (mut rd, wr) = tokio::io::split(stream);
    let wr: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>> =
        Arc::new(tokio::sync::Mutex::new(Box::new(wr)));
    let pipeline = (opts.max_pipeline_count > 0)
        .then(|| Arc::new(Semaphore::new(opts.max_pipeline_count)));

    let mut buf = bufs.get();
    let mut first = true;

    loop {
        let deadline = if first {
            opts.read_timeout
        } else {
            opts.tcp_idle_timeout
        };
        first = false;

        let len = tokio::select! {
            _ = conn_token.cancelled() => break,
            r = timeout(deadline, rd.read_u16()) => match r {
                Ok(Ok(n)) => usize::from(n),
                Ok(Err(e)) => {
                    if !is_quiet_close(&e) {
                        debug!("tcp read from {} failed: {}", peer, e);
                    }
                    break;
                }
                Err(_) => break,
            },
        };
        if len == 0 {
            continue;
        }

        let read = tokio::select! {
            _ = conn_token.cancelled() => break,
            r = timeout(opts.tcp_idle_timeout, rd.read_exact(&mut buf[..len])) => r,
        };
        match read {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if !is_quiet_close(&e) {
                    debug!("tcp read from {} failed: {}", peer, e);
                }
                break;
            }
            Err(_) => break,
        }

        let req = match Message::from_vec(&buf[..len]) {
            Ok(m) => m,
            Err(e) => {
                debug!("dropping unparsable tcp message from {}: {}", peer, e);
                base.metrics().on_invalid_msg(peer);
                continue;
            }
        };

        // One slot per in-flight query on this connection (RFC 7766 allows
        // out-of-order answers, the semaphore just bounds the fan-out).
        let permit = match &pipeline {
            Some(sem) => match sem.clone().acquire_owned().await {
                Ok(p) => Some(p),
                Err(_) => break,
            },
            None => None,
        };

        let job = {
            let base = base.clone();
            let conn_token = conn_token.clone();
            let mut rw = TcpResponseWriter {
                wr: wr.clone(),
                local,
                remote: peer,
                proto: opts.proto,
                idle_timeout: opts.tcp_idle_timeout,
                write_timeout: opts.write_timeout,
            };
            let cx = QueryContext::new(
                base.info().clone(),
                RequestInfo::new().with_tls_server_name(sni.clone()),
            );
            async move {
                if base.dispatch(&cx, &mut rw, &req).await.is_err() {
                    // Panicking handler or dead socket: no further queries
                    // can be answered on this connection.
                    conn_token.cancel();
                }
                drop(permit);
            }
        };
        if let Err(e) = base.pool().try_submit_tracked(base.tracker(), job) {
            debug!("dropping tcp query from {}: {}", peer, e);
        }
    }

    bufs.put(buf);
}

/// Writer for TCP and DoT responses: 2-byte length framing, writes
/// serialized under the per-connection mutex, keepalive echoed per RFC 7828.
pub struct TcpResponseWriter {
    wr: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    local: SocketAddr,
    remote: SocketAddr,
    proto: Protocol,
    idle_timeout: Duration,
    write_timeout: Duration,
}

#[async_trait]
impl ResponseWriter for TcpResponseWriter {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_msg(
        &mut self,
        _cx: &QueryContext,
        req: &Message,
        mut resp: Message,
    ) -> writer::Result<()> {
        normalize(Network::Tcp, self.proto, req, &mut resp, u16::MAX)?;
        reflect_tcp_keepalive(req, &mut resp, self.idle_timeout);

        let wire = resp.to_vec()?;
        let len =
            u16::try_from(wire.len()).map_err(|_| WriterError::ResponseTooLarge(wire.len()))?;
        let mut framed = Vec::with_capacity(2 + wire.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&wire);

        let mut wr = self.wr.lock().await;
        timeout(self.write_timeout, async {
            wr.write_all(&framed).await?;
            wr.flush().await
        })
        .await
        .map_err(|_| write_timed_out())??;
        Ok(())
    }
}
