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

//! DNS-over-QUIC (RFC 9250). One query per client-initiated bidirectional
//! stream, 2-byte length prefix mandatory, response written on the same
//! stream before our half is closed. Address validation piggybacks on QUIC
//! Retry: an unknown client IP gets a Retry and is remembered, a known one
//! connects in one round trip. 0-RTT is always accepted.

use super::{refusal, screen, ServerBase, ServerError, Verdict};
use crate::{
    context::{QueryContext, RequestInfo, ServerInfo},
    handler::{Handler, RecordingWriter, ResponseWriter},
    message::{has_option, normalize, HEADER_LEN, MAX_MSG_SIZE},
    metrics::{EmptyMetricsListener, MetricsListener},
    proto::{Network, Protocol},
    Label,
};
use clru::CLruCache;
use log::{debug, info};
use quinn::{Endpoint, IdleTimeout, TransportConfig, VarInt};
use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::time::timeout;
use trust_dns_proto::{
    op::{Message, MessageType, ResponseCode},
    rr::rdata::opt::EdnsCode,
};

/// DOQ_NO_ERROR: graceful connection close (RFC 9250).
pub const DOQ_NO_ERROR: u32 = 0;
/// DOQ_PROTOCOL_ERROR: the peer violated the protocol (RFC 9250).
pub const DOQ_PROTOCOL_ERROR: u32 = 2;

/// Default cap on client-initiated bidirectional streams per connection.
pub const DEFAULT_MAX_STREAMS: u32 = 100;
/// Default QUIC idle timeout.
pub const DEFAULT_QUIC_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default size of the address-validator LRU.
pub const DEFAULT_VALIDATOR_CACHE_SIZE: usize = 10_000;
/// Default lifetime of an address-validator entry.
pub const DEFAULT_VALIDATOR_TTL: Duration = Duration::from_secs(30 * 60);

/// Configuration for [`QuicServer`].
pub struct QuicConfig {
    /// Server name for logs and metrics.
    pub name: String,
    /// Address to listen on.
    pub addr: SocketAddr,
    /// The handler chain queries are dispatched to.
    pub handler: Arc<dyn Handler>,
    /// Observability hooks.
    pub metrics: Arc<dyn MetricsListener>,
    /// TLS material. The server installs the DoQ ALPN set and enables early
    /// data itself.
    pub tls: rustls::ServerConfig,
    /// Deadline for reading one query stream.
    pub read_timeout: Duration,
    /// Deadline for writing one response.
    pub write_timeout: Duration,
    /// Connection idle timeout; also bounds how long we wait for the next
    /// stream.
    pub max_idle_timeout: Duration,
    /// Cap on concurrent query streams per connection.
    pub max_streams: u32,
    /// Entries kept by the address validator.
    pub validator_cache_size: usize,
    /// How long a validated client IP stays exempt from Retry.
    pub validator_ttl: Duration,
    /// Worker cap shared by the listener.
    pub max_workers: usize,
}

impl QuicConfig {
    /// Config with defaults for everything but the essentials.
    pub fn new(
        name: impl Into<String>,
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        tls: rustls::ServerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            handler,
            metrics: Arc::new(EmptyMetricsListener),
            tls,
            read_timeout: super::DEFAULT_READ_TIMEOUT,
            write_timeout: super::DEFAULT_WRITE_TIMEOUT,
            max_idle_timeout: DEFAULT_QUIC_IDLE_TIMEOUT,
            max_streams: DEFAULT_MAX_STREAMS,
            validator_cache_size: DEFAULT_VALIDATOR_CACHE_SIZE,
            validator_ttl: DEFAULT_VALIDATOR_TTL,
            max_workers: super::DEFAULT_MAX_WORKERS,
        }
    }
}

/// LRU of client IPs that recently completed address validation. Presence
/// (within TTL) means "no Retry needed"; absence means "send a Retry and
/// remember the address".
pub(crate) struct AddressValidator {
    cache: Mutex<CLruCache<String, Instant>>,
    ttl: Duration,
}

impl AddressValidator {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            cache: Mutex::new(CLruCache::new(capacity)),
            ttl,
        }
    }

    // True when `ip` was validated recently. Otherwise remembers it and
    // returns false, in which case the caller must require a Retry.
    pub(crate) fn check(&self, ip: &str) -> bool {
        let mut cache = self.cache.lock().expect("validator poisoned");
        if let Some(at) = cache.get(ip) {
            if at.elapsed() < self.ttl {
                return true;
            }
        }
        cache.put(ip.to_string(), Instant::now());
        false
    }
}

// Transport-level knobs threaded through the per-connection tasks.
pub(crate) struct QuicOpts {
    pub(crate) local: SocketAddr,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) max_idle_timeout: Duration,
}

/// Build a QUIC endpoint for `tls` with the given ALPN set. Shared by DoQ
/// and the DoH HTTP/3 listener.
pub(crate) fn build_endpoint(
    mut tls: rustls::ServerConfig,
    alpn: &[&[u8]],
    addr: SocketAddr,
    max_streams: u32,
    max_idle: Duration,
) -> super::Result<Endpoint> {
    tls.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    // 0-RTT: accept early data unconditionally; replayed DNS queries are
    // idempotent.
    tls.max_early_data_size = u32::MAX;

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = TransportConfig::default();
    transport
        .max_concurrent_bidi_streams(VarInt::from_u32(max_streams))
        // DoQ and HTTP/3 clients only open bidirectional streams toward us.
        .max_concurrent_uni_streams(VarInt::from_u32(0))
        .max_idle_timeout(Some(
            IdleTimeout::try_from(max_idle)
                .map_err(|_| ServerError::InvalidConfig("idle timeout out of range"))?,
        ));
    server_config.transport_config(Arc::new(transport));

    Ok(Endpoint::server(server_config, addr)?)
}

/// Accept the next connection attempt that passed address validation.
/// Returns `None` once the endpoint is closed or the server shuts down.
pub(crate) async fn accept_validated(
    base: &ServerBase,
    endpoint: &Endpoint,
    validator: &AddressValidator,
) -> Option<quinn::Connecting> {
    loop {
        let incoming = tokio::select! {
            _ = base.token().cancelled() => return None,
            a = endpoint.accept() => a?,
        };

        if !incoming.remote_address_validated() {
            let ip = incoming.remote_address().ip().to_string();
            if validator.check(&ip) {
                base.metrics().on_quic_address_validation(true);
            } else {
                base.metrics().on_quic_address_validation(false);
                if let Err(e) = incoming.retry() {
                    debug!("quic retry to {} failed: {}", ip, e);
                }
                continue;
            }
        }

        match incoming.accept() {
            Ok(connecting) => return Some(connecting),
            Err(e) => {
                debug!("quic accept on {} failed: {}", base.info().name(), e);
                continue;
            }
        }
    }
}

// Peer behavior we expect in the normal course of business: graceful close,
// idle expiry, our own shutdown. Not worth a log line, let alone a metric.
pub(crate) fn is_expected_conn_err(e: &quinn::ConnectionError) -> bool {
    match e {
        quinn::ConnectionError::ApplicationClosed(close) => {
            close.error_code == VarInt::from_u32(DOQ_NO_ERROR)
        }
        quinn::ConnectionError::TimedOut | quinn::ConnectionError::LocallyClosed => true,
        _ => false,
    }
}

pub(crate) fn connection_sni(conn: &quinn::Connection) -> Option<Label> {
    conn.handshake_data()
        .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
        .and_then(|data| data.server_name)
        .map(|name| Label::from(name.as_str()))
}

/// DNS-over-QUIC server.
pub struct QuicServer {
    base: Arc<ServerBase>,
    addr: SocketAddr,
    tls: Mutex<Option<rustls::ServerConfig>>,
    max_streams: u32,
    read_timeout: Duration,
    write_timeout: Duration,
    max_idle_timeout: Duration,
    validator: Arc<AddressValidator>,
    endpoint: Mutex<Option<Endpoint>>,
}

impl QuicServer {
    /// Create the server; the endpoint is opened by [`start`](Self::start).
    pub fn new(cfg: QuicConfig) -> Self {
        let info = ServerInfo::new(cfg.name.as_str(), cfg.addr, Protocol::Doq);
        Self {
            base: ServerBase::new(info, cfg.handler, cfg.metrics, cfg.max_workers),
            addr: cfg.addr,
            tls: Mutex::new(Some(cfg.tls)),
            max_streams: cfg.max_streams,
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
            max_idle_timeout: cfg.max_idle_timeout,
            validator: Arc::new(AddressValidator::new(
                cfg.validator_cache_size,
                cfg.validator_ttl,
            )),
            endpoint: Mutex::new(None),
        }
    }

    /// Open the QUIC endpoint and return. Fails if the server was started
    /// before.
    pub async fn start(&self) -> super::Result<()> {
        self.base.begin_start()?;

        let tls = self
            .tls
            .lock()
            .expect("tls config poisoned")
            .take()
            .ok_or(ServerError::InvalidConfig("tls config already consumed"))?;
        let endpoint = build_endpoint(
            tls,
            Protocol::Doq.alpn(),
            self.addr,
            self.max_streams,
            self.max_idle_timeout,
        )?;
        let local = endpoint.local_addr()?;
        info!(
            "server {} is listening on quic://{}",
            self.base.info().name(),
            local
        );
        *self.endpoint.lock().expect("endpoint poisoned") = Some(endpoint.clone());

        let opts = Arc::new(QuicOpts {
            local,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            max_idle_timeout: self.max_idle_timeout,
        });
        let validator = self.validator.clone();
        self.base.spawn_listener(
            "quic",
            serve_quic(self.base.clone(), endpoint, validator, opts),
        );
        Ok(())
    }

    /// Close the endpoint and wait until in-flight queries drain or
    /// `deadline` passes.
    pub async fn shutdown(&self, deadline: Duration) -> super::Result<()> {
        self.base.begin_shutdown()?;
        if let Some(endpoint) = self.endpoint.lock().expect("endpoint poisoned").take() {
            endpoint.close(VarInt::from_u32(DOQ_NO_ERROR), b"server shutdown");
        }
        self.base.wait_drained(deadline).await
    }

    /// Address of the endpoint, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .lock()
            .expect("endpoint poisoned")
            .as_ref()
            .and_then(|e| e.local_addr().ok())
    }
}

async fn serve_quic(
    base: Arc<ServerBase>,
    endpoint: Endpoint,
    validator: Arc<AddressValidator>,
    opts: Arc<QuicOpts>,
) -> super::Result<()> {
    while let Some(connecting) = accept_validated(&base, &endpoint, &validator).await {
        let conn_task = serve_quic_conn(base.clone(), connecting, opts.clone());
        if let Err(e) = base.pool().try_submit_tracked(base.tracker(), conn_task) {
            debug!("dropping quic connection: {}", e);
        }
    }
    Ok(())
}

async fn serve_quic_conn(base: Arc<ServerBase>, connecting: quinn::Connecting, opts: Arc<QuicOpts>) {
    // 0-RTT if the client resumed with early data, 1-RTT otherwise.
    let conn = match connecting.into_0rtt() {
        Ok((conn, _accepted)) => conn,
        Err(connecting) => match connecting.await {
            Ok(conn) => conn,
            Err(e) => {
                if !is_expected_conn_err(&e) {
                    debug!("quic handshake failed: {}", e);
                }
                return;
            }
        },
    };

    let peer = conn.remote_address();
    let sni = connection_sni(&conn);

    loop {
        let (send, recv) = tokio::select! {
            _ = base.token().cancelled() => {
                conn.close(VarInt::from_u32(DOQ_NO_ERROR), b"server shutdown");
                return;
            }
            r = timeout(opts.max_idle_timeout, conn.accept_bi()) => match r {
                Ok(Ok(streams)) => streams,
                Ok(Err(e)) => {
                    if !is_expected_conn_err(&e) {
                        debug!("quic connection from {} errored: {}", peer, e);
                    }
                    return;
                }
                Err(_) => {
                    conn.close(VarInt::from_u32(DOQ_NO_ERROR), b"idle");
                    return;
                }
            },
        };

        let job = serve_quic_stream(
            base.clone(),
            conn.clone(),
            send,
            recv,
            sni.clone(),
            opts.clone(),
        );
        if let Err(e) = base.pool().try_submit_tracked(base.tracker(), job) {
            debug!("dropping quic query from {}: {}", peer, e);
        }
    }
}

async fn serve_quic_stream(
    base: Arc<ServerBase>,
    conn: quinn::Connection,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    sni: Option<Label>,
    opts: Arc<QuicOpts>,
) {
    let peer = conn.remote_address();

    // The client half-closes after the query, so read to EOF.
    let data = match timeout(opts.read_timeout, recv.read_to_end(2 + MAX_MSG_SIZE)).await {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => {
            debug!("quic stream read from {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("quic stream read from {} timed out", peer);
            return;
        }
    };

    // RFC 9250 framing: a 2-byte length prefix covering exactly the rest of
    // the stream. Unprefixed messages from pre-RFC drafts are not grandfathered.
    if data.len() < 2 + HEADER_LEN {
        protocol_error(&conn, "doq message too short");
        return;
    }
    let declared = usize::from(u16::from_be_bytes([data[0], data[1]]));
    if declared != data.len() - 2 {
        protocol_error(&conn, "doq length prefix does not match the stream");
        return;
    }

    let req = match Message::from_vec(&data[2..]) {
        Ok(m) => m,
        Err(e) => {
            debug!("unparsable doq message from {}: {}", peer, e);
            base.metrics().on_invalid_msg(peer);
            protocol_error(&conn, "unparsable doq message");
            return;
        }
    };

    // RFC 9250 §5.5.2: edns-tcp-keepalive has no meaning on QUIC and must
    // kill the connection.
    if has_option(&req, EdnsCode::Keepalive) {
        protocol_error(&conn, "edns-tcp-keepalive is forbidden on doq");
        return;
    }

    // A response-flagged message gets no answer; everything else must be
    // answered because the stream framing demands it.
    if req.message_type() == MessageType::Response || screen(&req) == Verdict::Ignore {
        return;
    }

    let cx = QueryContext::new(
        base.info().clone(),
        RequestInfo::new().with_tls_server_name(sni),
    );
    let mut rec = RecordingWriter::new(opts.local, peer);
    if base.dispatch(&cx, &mut rec, &req).await.is_err() {
        conn.close(VarInt::from_u32(DOQ_PROTOCOL_ERROR), b"internal error");
        return;
    }

    let mut resp = rec
        .into_response()
        .unwrap_or_else(|| refusal(&req, ResponseCode::ServFail));
    if let Err(e) = normalize(Network::Tcp, Protocol::Doq, &req, &mut resp, u16::MAX) {
        debug!("normalizing doq response for {} failed: {}", peer, e);
        return;
    }

    let wire = match resp.to_vec() {
        Ok(w) if w.len() <= MAX_MSG_SIZE => w,
        Ok(w) => {
            debug!("doq response for {} of {} bytes dropped", peer, w.len());
            return;
        }
        Err(e) => {
            debug!("packing doq response for {} failed: {}", peer, e);
            return;
        }
    };

    let mut framed = Vec::with_capacity(2 + wire.len());
    framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    framed.extend_from_slice(&wire);

    match timeout(opts.write_timeout, send.write_all(&framed)).await {
        Ok(Ok(())) => {
            // Close our half: the response is complete.
            let _ = send.finish();
        }
        Ok(Err(e)) => debug!("quic stream write to {} failed: {}", peer, e),
        Err(_) => debug!("quic stream write to {} timed out", peer),
    }
}

fn protocol_error(conn: &quinn::Connection, why: &str) {
    debug!(
        "closing quic connection from {} with protocol error: {}",
        conn.remote_address(),
        why
    );
    conn.close(VarInt::from_u32(DOQ_PROTOCOL_ERROR), why.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_requires_retry_once_per_ttl() {
        let v = AddressValidator::new(16, Duration::from_secs(60));
        assert!(!v.check("192.0.2.1"));
        assert!(v.check("192.0.2.1"));
        assert!(!v.check("192.0.2.2"));
    }

    #[test]
    fn validator_entries_expire() {
        let v = AddressValidator::new(16, Duration::from_millis(0));
        assert!(!v.check("192.0.2.1"));
        // TTL zero: the entry is immediately stale and re-inserted.
        assert!(!v.check("192.0.2.1"));
    }

    #[test]
    fn validator_capacity_evicts_oldest() {
        let v = AddressValidator::new(2, Duration::from_secs(60));
        assert!(!v.check("192.0.2.1"));
        assert!(!v.check("192.0.2.2"));
        assert!(!v.check("192.0.2.3"));
        // 192.0.2.1 was evicted to make room and must revalidate.
        assert!(!v.check("192.0.2.1"));
    }

    #[test]
    fn graceful_closes_are_expected() {
        assert!(is_expected_conn_err(&quinn::ConnectionError::TimedOut));
        assert!(is_expected_conn_err(&quinn::ConnectionError::LocallyClosed));
    }
}
