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

//! DNS-over-TLS (RFC 7858). DoT is the TCP pipeline from
//! [`dns`](super::dns) with a TLS acceptor in front: the handshake runs
//! under the read timeout, the client SNI lands in the request info, and the
//! connection is torn down by dropping the socket rather than waiting for a
//! close-notify round-trip.

use super::{
    dns::{serve_tcp, DnsConfig, TransportOpts},
    ServerBase,
};
use crate::{context::ServerInfo, proto::Protocol};
use log::info;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Configuration for [`TlsServer`].
pub struct TlsConfig {
    /// The plain-DNS knobs; the network is forced to TCP.
    pub dns: DnsConfig,
    /// TLS material. The server installs the `dot` ALPN token itself.
    pub tls: rustls::ServerConfig,
}

/// DNS-over-TLS server.
pub struct TlsServer {
    base: Arc<ServerBase>,
    addr: SocketAddr,
    opts: Arc<TransportOpts>,
    acceptor: TlsAcceptor,
    tcp_addr: Mutex<Option<SocketAddr>>,
}

impl TlsServer {
    /// Create the server; no sockets are opened until [`start`](Self::start).
    pub fn new(cfg: TlsConfig) -> Self {
        let TlsConfig { dns, mut tls } = cfg;
        tls.alpn_protocols = Protocol::Dot.alpn().iter().map(|p| p.to_vec()).collect();

        let opts = TransportOpts::from_config(&dns, Protocol::Dot);
        let info = ServerInfo::new(dns.name.as_str(), dns.addr, Protocol::Dot);
        Self {
            base: ServerBase::new(info, dns.handler, dns.metrics, dns.max_workers),
            addr: dns.addr,
            opts,
            acceptor: TlsAcceptor::from(Arc::new(tls)),
            tcp_addr: Mutex::new(None),
        }
    }

    /// Open the TCP listener and return. Fails if the server was started
    /// before.
    pub async fn start(&self) -> super::Result<()> {
        self.base.begin_start()?;

        let listener = TcpListener::bind(self.addr).await?;
        let local = listener.local_addr()?;
        *self.tcp_addr.lock().expect("addr poisoned") = Some(local);
        info!(
            "server {} is listening on tls://{}",
            self.base.info().name(),
            local
        );
        self.base.spawn_listener(
            "tls",
            serve_tcp(
                self.base.clone(),
                listener,
                Some(self.acceptor.clone()),
                self.opts.clone(),
            ),
        );
        Ok(())
    }

    /// Stop accepting, unblock connection reads, and wait until in-flight
    /// queries drain or `deadline` passes.
    pub async fn shutdown(&self, deadline: Duration) -> super::Result<()> {
        self.base.begin_shutdown()?;
        self.base.wait_drained(deadline).await
    }

    /// Address of the listener, once started.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.lock().expect("addr poisoned")
    }
}
