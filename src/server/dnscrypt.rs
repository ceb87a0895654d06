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

//! DNSCrypt v2. The cryptographic framing (certificate exchange, nonces,
//! encryption) belongs to a codec collaborator behind [`DnsCryptCodec`]; this
//! server owns the sockets and bridges decrypted queries into the regular
//! dispatch path through a [`DnsCryptHandler`] adapter.

use super::{refusal, screen, ServerBase, ServerError, Verdict};
use crate::{
    context::{QueryContext, RequestInfo, ServerInfo},
    handler::{Handler, RecordingWriter, ResponseWriter},
    message::{normalize, MAX_MSG_SIZE},
    metrics::{EmptyMetricsListener, MetricsListener},
    proto::{Network, Protocol},
};
use async_trait::async_trait;
use log::{debug, info};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::net::{TcpListener, UdpSocket};
use trust_dns_proto::op::{Message, MessageType, ResponseCode};

/// The serve loops of a DNSCrypt codec implementation.
///
/// The codec owns the wire: it reads encrypted packets (and the certificate
/// handshake) from the socket it is handed, decrypts each query, passes the
/// plaintext to the [`DnsCryptHandler`], and encrypts whatever comes back.
/// The loops run until the socket fails or is shut down.
#[async_trait]
pub trait DnsCryptCodec: Send + Sync + 'static {
    /// Serve encrypted datagrams from `socket`.
    async fn serve_udp(
        &self,
        socket: Arc<UdpSocket>,
        handler: Arc<dyn DnsCryptHandler>,
    ) -> io::Result<()>;

    /// Serve encrypted streams accepted from `listener`.
    async fn serve_tcp(
        &self,
        listener: Arc<TcpListener>,
        handler: Arc<dyn DnsCryptHandler>,
    ) -> io::Result<()>;
}

/// What the codec calls with each decrypted query.
#[async_trait]
pub trait DnsCryptHandler: Send + Sync + 'static {
    /// Process the plaintext query in `packet` and return the serialized
    /// plaintext response for the codec to encrypt.
    async fn serve_decrypted(
        &self,
        network: Network,
        local: SocketAddr,
        remote: SocketAddr,
        packet: &[u8],
    ) -> io::Result<Vec<u8>>;
}

/// Configuration for [`DnsCryptServer`].
pub struct DnsCryptConfig {
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
    /// The framing collaborator.
    pub codec: Arc<dyn DnsCryptCodec>,
    /// The provider name clients are configured with; must be non-empty.
    pub provider_name: String,
    /// The serialized resolver certificate; must be non-empty.
    pub resolver_cert: Vec<u8>,
    /// Worker cap shared by the listeners.
    pub max_workers: usize,
}

impl DnsCryptConfig {
    /// Config with defaults for everything but the essentials.
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        codec: Arc<dyn DnsCryptCodec>,
        provider_name: impl Into<String>,
        resolver_cert: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            network: Network::Any,
            handler,
            metrics: Arc::new(EmptyMetricsListener),
            codec,
            provider_name: provider_name.into(),
            resolver_cert,
            max_workers: super::DEFAULT_MAX_WORKERS,
        }
    }
}

/// DNSCrypt server.
pub struct DnsCryptServer {
    base: Arc<ServerBase>,
    addr: SocketAddr,
    network: Network,
    codec: Arc<dyn DnsCryptCodec>,
    provider_name: String,
    resolver_cert: Vec<u8>,
    udp_addr: Mutex<Option<SocketAddr>>,
    tcp_addr: Mutex<Option<SocketAddr>>,
}

impl DnsCryptServer {
    /// Create the server. Fails when the provider name or the resolver
    /// certificate is empty: clients cannot bootstrap without either.
    pub fn new(cfg: DnsCryptConfig) -> super::Result<Self> {
        if cfg.provider_name.is_empty() {
            return Err(ServerError::InvalidConfig("dnscrypt provider name is empty"));
        }
        if cfg.resolver_cert.is_empty() {
            return Err(ServerError::InvalidConfig(
                "dnscrypt resolver certificate is empty",
            ));
        }
        let info = ServerInfo::new(cfg.name.as_str(), cfg.addr, Protocol::DnscryptUdp);
        Ok(Self {
            base: ServerBase::new(info, cfg.handler, cfg.metrics, cfg.max_workers),
            addr: cfg.addr,
            network: cfg.network,
            codec: cfg.codec,
            provider_name: cfg.provider_name,
            resolver_cert: cfg.resolver_cert,
            udp_addr: Mutex::new(None),
            tcp_addr: Mutex::new(None),
        })
    }

    /// The provider name clients are configured with.
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// The serialized resolver certificate the codec should serve.
    pub fn resolver_cert(&self) -> &[u8] {
        &self.resolver_cert
    }

    /// Open the sockets the configured network asks for and hand them to the
    /// codec. Fails if the server was started before.
    pub async fn start(&self) -> super::Result<()> {
        self.base.begin_start()?;

        let adapter = Arc::new(CryptAdapter {
            base: self.base.clone(),
        });

        if self.network.wants_udp() {
            let socket = Arc::new(UdpSocket::bind(self.addr).await?);
            let local = socket.local_addr()?;
            *self.udp_addr.lock().expect("addr poisoned") = Some(local);
            info!(
                "server {} is listening on dnscrypt+udp://{}",
                self.base.info().name(),
                local
            );
            let codec = self.codec.clone();
            let handler: Arc<dyn DnsCryptHandler> = adapter.clone();
            let token = self.base.token().clone();
            self.base.spawn_listener("dnscrypt-udp", async move {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    r = codec.serve_udp(socket, handler) => r.map_err(ServerError::from),
                }
            });
        }

        if self.network.wants_tcp() {
            let listener = Arc::new(TcpListener::bind(self.addr).await?);
            let local = listener.local_addr()?;
            *self.tcp_addr.lock().expect("addr poisoned") = Some(local);
            info!(
                "server {} is listening on dnscrypt+tcp://{}",
                self.base.info().name(),
                local
            );
            let codec = self.codec.clone();
            let handler: Arc<dyn DnsCryptHandler> = adapter;
            let token = self.base.token().clone();
            self.base.spawn_listener("dnscrypt-tcp", async move {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    r = codec.serve_tcp(listener, handler) => r.map_err(ServerError::from),
                }
            });
        }

        Ok(())
    }

    /// Stop the codec loops and wait until in-flight queries drain or
    /// `deadline` passes.
    pub async fn shutdown(&self, deadline: Duration) -> super::Result<()> {
        self.base.begin_shutdown()?;
        self.base.wait_drained(deadline).await
    }

    /// Address of the UDP socket, once started.
    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.lock().expect("addr poisoned")
    }

    /// Address of the TCP listener, once started.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.lock().expect("addr poisoned")
    }
}

// Bridges decrypted queries into the dispatch path. The codec's framing
// always needs a response, so an unanswered query becomes SERVFAIL here.
struct CryptAdapter {
    base: Arc<ServerBase>,
}

#[async_trait]
impl DnsCryptHandler for CryptAdapter {
    async fn serve_decrypted(
        &self,
        network: Network,
        local: SocketAddr,
        remote: SocketAddr,
        packet: &[u8],
    ) -> io::Result<Vec<u8>> {
        let req = match Message::from_vec(packet) {
            Ok(m) => m,
            Err(e) => {
                debug!("unparsable dnscrypt message from {}: {}", remote, e);
                self.base.metrics().on_invalid_msg(remote);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };

        if req.message_type() == MessageType::Response || screen(&req) == Verdict::Ignore {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response-flagged message",
            ));
        }

        let proto = match network {
            Network::Tcp => Protocol::DnscryptTcp,
            Network::Udp | Network::Any => Protocol::DnscryptUdp,
        };
        let cx = QueryContext::new(
            Arc::new(ServerInfo::new(
                self.base.info().name(),
                self.base.info().addr(),
                proto,
            )),
            RequestInfo::new(),
        );

        let mut rec = RecordingWriter::new(local, remote);
        if self.base.dispatch(&cx, &mut rec, &req).await.is_err() {
            return Err(io::Error::new(io::ErrorKind::Other, "handler panicked"));
        }

        let mut resp = rec
            .into_response()
            .unwrap_or_else(|| refusal(&req, ResponseCode::ServFail));
        // The encrypted envelope hides the payload size from the network, so
        // both transports get the full wire budget.
        normalize(network, proto, &req, &mut resp, MAX_MSG_SIZE as u16)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        resp.to_vec()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
