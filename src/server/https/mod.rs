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

//! DNS-over-HTTPS (RFC 8484). HTTP/1.1 and HTTP/2 ride the TCP listener
//! through hyper; HTTP/3 rides a QUIC endpoint through h3. Two paths are
//! served: `/dns-query` (wireformat, GET and POST) and `/resolve` (the JSON
//! API). Anything else goes to the configured non-DNS handler, or 404.

pub mod json;

use super::{
    quic::{
        accept_validated, build_endpoint, connection_sni, is_expected_conn_err, AddressValidator,
        DEFAULT_MAX_STREAMS, DEFAULT_QUIC_IDLE_TIMEOUT, DEFAULT_VALIDATOR_CACHE_SIZE,
        DEFAULT_VALIDATOR_TTL,
    },
    refusal, screen, ServerBase, ServerError, Verdict,
};
use crate::{
    context::{QueryContext, RequestInfo, ServerInfo},
    handler::{Handler, RecordingWriter, ResponseWriter},
    message::{normalize, MAX_MSG_SIZE},
    metrics::{EmptyMetricsListener, MetricsListener},
    proto::{Network, Protocol, ALPN_DOH, ALPN_DOH3},
    Label,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, info};
use quinn::Endpoint;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, time::timeout};
use tokio_rustls::TlsAcceptor;
use trust_dns_proto::op::{Message, MessageType, ResponseCode};

/// Wireformat endpoint path.
pub const PATH_DNS_QUERY: &str = "/dns-query";
/// JSON API endpoint path.
pub const PATH_RESOLVE: &str = "/resolve";

const MIME_DNS_MESSAGE: &str = "application/dns-message";
const MIME_JSON: &str = "application/x-javascript";

// Cache-Control clamp (seconds): never advertise less than the floor so
// retry storms are damped, never more than an hour so stale data ages out.
const CACHE_TTL_FLOOR: u32 = 5;
const CACHE_TTL_CEIL: u32 = 3600;

/// Handler for requests outside the two DNS paths.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    /// Answer a non-DNS request.
    async fn handle(&self, req: Request<Bytes>) -> Response<Bytes>;
}

/// Configuration for [`HttpsServer`].
pub struct HttpsConfig {
    /// Server name for logs and metrics.
    pub name: String,
    /// Address to listen on (TCP for h1/h2, UDP for h3).
    pub addr: SocketAddr,
    /// `Any` serves both generations, `Tcp` only HTTP/1.1+2, `Udp` only
    /// HTTP/3.
    pub network: Network,
    /// The handler chain queries are dispatched to.
    pub handler: Arc<dyn Handler>,
    /// Observability hooks.
    pub metrics: Arc<dyn MetricsListener>,
    /// TLS material. ALPN sets are installed per listener.
    pub tls: rustls::ServerConfig,
    /// Where requests outside the DNS paths go; 404 when unset.
    pub fallback: Option<Arc<dyn HttpHandler>>,
    /// Deadline for the TLS handshake.
    pub read_timeout: Duration,
    /// HTTP/3: cap on concurrent request streams per connection.
    pub max_streams: u32,
    /// HTTP/3: connection idle timeout.
    pub max_idle_timeout: Duration,
    /// HTTP/3: entries kept by the address validator.
    pub validator_cache_size: usize,
    /// HTTP/3: how long a validated client IP stays exempt from Retry.
    pub validator_ttl: Duration,
    /// Worker cap shared by the listeners.
    pub max_workers: usize,
}

impl HttpsConfig {
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
            network: Network::Any,
            handler,
            metrics: Arc::new(EmptyMetricsListener),
            tls,
            fallback: None,
            read_timeout: super::DEFAULT_READ_TIMEOUT,
            max_streams: DEFAULT_MAX_STREAMS,
            max_idle_timeout: DEFAULT_QUIC_IDLE_TIMEOUT,
            validator_cache_size: DEFAULT_VALIDATOR_CACHE_SIZE,
            validator_ttl: DEFAULT_VALIDATOR_TTL,
            max_workers: super::DEFAULT_MAX_WORKERS,
        }
    }
}

// Everything a request needs besides itself.
struct HttpCtx {
    base: Arc<ServerBase>,
    fallback: Option<Arc<dyn HttpHandler>>,
}

/// DNS-over-HTTPS server.
pub struct HttpsServer {
    base: Arc<ServerBase>,
    addr: SocketAddr,
    network: Network,
    tls: Mutex<Option<rustls::ServerConfig>>,
    fallback: Option<Arc<dyn HttpHandler>>,
    read_timeout: Duration,
    max_streams: u32,
    max_idle_timeout: Duration,
    validator: Arc<AddressValidator>,
    tcp_addr: Mutex<Option<SocketAddr>>,
    endpoint: Mutex<Option<Endpoint>>,
}

impl HttpsServer {
    /// Create the server; no sockets are opened until [`start`](Self::start).
    pub fn new(cfg: HttpsConfig) -> Self {
        let info = ServerInfo::new(cfg.name.as_str(), cfg.addr, Protocol::Doh);
        Self {
            base: ServerBase::new(info, cfg.handler, cfg.metrics, cfg.max_workers),
            addr: cfg.addr,
            network: cfg.network,
            tls: Mutex::new(Some(cfg.tls)),
            fallback: cfg.fallback,
            read_timeout: cfg.read_timeout,
            max_streams: cfg.max_streams,
            max_idle_timeout: cfg.max_idle_timeout,
            validator: Arc::new(AddressValidator::new(
                cfg.validator_cache_size,
                cfg.validator_ttl,
            )),
            tcp_addr: Mutex::new(None),
            endpoint: Mutex::new(None),
        }
    }

    /// Open the listeners the configured network asks for and return. Fails
    /// if the server was started before.
    pub async fn start(&self) -> super::Result<()> {
        self.base.begin_start()?;

        let tls = self
            .tls
            .lock()
            .expect("tls config poisoned")
            .take()
            .ok_or(ServerError::InvalidConfig("tls config already consumed"))?;
        let ctx = Arc::new(HttpCtx {
            base: self.base.clone(),
            fallback: self.fallback.clone(),
        });

        if self.network.wants_tcp() {
            let mut tcp_tls = tls.clone();
            tcp_tls.alpn_protocols = ALPN_DOH.iter().map(|p| p.to_vec()).collect();
            let acceptor = TlsAcceptor::from(Arc::new(tcp_tls));

            let listener = TcpListener::bind(self.addr).await?;
            let local = listener.local_addr()?;
            *self.tcp_addr.lock().expect("addr poisoned") = Some(local);
            info!(
                "server {} is listening on https://{}",
                self.base.info().name(),
                local
            );
            self.base.spawn_listener(
                "https",
                serve_https(
                    self.base.clone(),
                    listener,
                    acceptor,
                    ctx.clone(),
                    self.read_timeout,
                ),
            );
        }

        if self.network.wants_udp() {
            let endpoint = build_endpoint(
                tls,
                &ALPN_DOH3,
                self.addr,
                self.max_streams,
                self.max_idle_timeout,
            )?;
            let local = endpoint.local_addr()?;
            info!(
                "server {} is listening on h3://{}",
                self.base.info().name(),
                local
            );
            *self.endpoint.lock().expect("endpoint poisoned") = Some(endpoint.clone());
            self.base.spawn_listener(
                "h3",
                serve_h3(self.base.clone(), endpoint, self.validator.clone(), ctx, local),
            );
        }

        Ok(())
    }

    /// Stop accepting, close the h3 endpoint, and wait until in-flight
    /// requests drain or `deadline` passes.
    pub async fn shutdown(&self, deadline: Duration) -> super::Result<()> {
        self.base.begin_shutdown()?;
        if let Some(endpoint) = self.endpoint.lock().expect("endpoint poisoned").take() {
            endpoint.close(quinn::VarInt::from_u32(0), b"server shutdown");
        }
        self.base.wait_drained(deadline).await
    }

    /// Address of the TCP listener, once started.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.lock().expect("addr poisoned")
    }

    /// Address of the HTTP/3 endpoint, once started.
    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .lock()
            .expect("endpoint poisoned")
            .as_ref()
            .and_then(|e| e.local_addr().ok())
    }
}

async fn serve_https(
    base: Arc<ServerBase>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: Arc<HttpCtx>,
    read_timeout: Duration,
) -> super::Result<()> {
    let local = listener.local_addr()?;

    loop {
        let (stream, peer) = tokio::select! {
            _ = base.token().cancelled() => return Ok(()),
            r = listener.accept() => match r {
                Ok(v) => v,
                Err(e) => {
                    debug!("https accept on {} failed: {}", base.info().name(), e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let conn = serve_https_conn(
            base.clone(),
            ctx.clone(),
            acceptor.clone(),
            stream,
            local,
            peer,
            read_timeout,
        );
        if let Err(e) = base.pool().try_submit_tracked(base.tracker(), conn) {
            debug!("dropping https connection from {}: {}", peer, e);
        }
    }
}

async fn serve_https_conn(
    base: Arc<ServerBase>,
    ctx: Arc<HttpCtx>,
    acceptor: TlsAcceptor,
    stream: tokio::net::TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
    read_timeout: Duration,
) {
    let tls_stream = match timeout(read_timeout, acceptor.accept(stream)).await {
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
    let sni: Option<Label> = tls_stream.get_ref().1.server_name().map(Arc::from);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let sni = sni.clone();
        async move {
            let (parts, body) = req.into_parts();
            let body = match Limited::new(body, MAX_MSG_SIZE).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok::<_, std::convert::Infallible>(
                        status_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
                            .map(Full::new),
                    )
                }
            };
            let resp = process_request(&ctx, parts, body, local, peer, sni).await;
            Ok(resp.map(Full::new))
        }
    });

    let token = base.token().clone();
    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let serving = builder.serve_connection(TokioIo::new(tls_stream), service);
    tokio::select! {
        _ = token.cancelled() => {}
        r = serving => {
            if let Err(e) = r {
                debug!("https connection from {} ended: {}", peer, e);
            }
        }
    }
}

async fn serve_h3(
    base: Arc<ServerBase>,
    endpoint: Endpoint,
    validator: Arc<AddressValidator>,
    ctx: Arc<HttpCtx>,
    local: SocketAddr,
) -> super::Result<()> {
    while let Some(connecting) = accept_validated(&base, &endpoint, &validator).await {
        let conn = serve_h3_conn(base.clone(), ctx.clone(), connecting, local);
        if let Err(e) = base.pool().try_submit_tracked(base.tracker(), conn) {
            debug!("dropping h3 connection: {}", e);
        }
    }
    Ok(())
}

async fn serve_h3_conn(
    base: Arc<ServerBase>,
    ctx: Arc<HttpCtx>,
    connecting: quinn::Connecting,
    local: SocketAddr,
) {
    let conn = match connecting.into_0rtt() {
        Ok((conn, _accepted)) => conn,
        Err(connecting) => match connecting.await {
            Ok(conn) => conn,
            Err(e) => {
                if !is_expected_conn_err(&e) {
                    debug!("h3 handshake failed: {}", e);
                }
                return;
            }
        },
    };
    let peer = conn.remote_address();
    let sni = connection_sni(&conn);

    let mut h3_conn =
        match h3::server::Connection::new(h3_quinn::Connection::new(conn)).await {
            Ok(c) => c,
            Err(e) => {
                debug!("h3 connection setup with {} failed: {}", peer, e);
                return;
            }
        };

    loop {
        let accepted = tokio::select! {
            _ = base.token().cancelled() => return,
            r = h3_conn.accept() => r,
        };
        match accepted {
            Ok(Some((req, stream))) => {
                let job = serve_h3_request(ctx.clone(), req, stream, local, peer, sni.clone());
                if let Err(e) = base.pool().try_submit_tracked(base.tracker(), job) {
                    debug!("dropping h3 request from {}: {}", peer, e);
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!("h3 connection from {} ended: {}", peer, e);
                return;
            }
        }
    }
}

async fn serve_h3_request(
    ctx: Arc<HttpCtx>,
    req: Request<()>,
    mut stream: h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    local: SocketAddr,
    peer: SocketAddr,
    sni: Option<Label>,
) {
    let mut body = BytesMut::new();
    loop {
        match stream.recv_data().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.remaining() > MAX_MSG_SIZE {
                    debug!("h3 request body from {} too large", peer);
                    return;
                }
                body.put(chunk);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("h3 body read from {} failed: {}", peer, e);
                return;
            }
        }
    }

    let (parts, ()) = req.into_parts();
    let resp = process_request(&ctx, parts, body.freeze(), local, peer, sni).await;
    let (head, body) = resp.into_parts();

    if let Err(e) = stream.send_response(Response::from_parts(head, ())).await {
        debug!("h3 response head to {} failed: {}", peer, e);
        return;
    }
    if let Err(e) = stream.send_data(body).await {
        debug!("h3 response body to {} failed: {}", peer, e);
        return;
    }
    let _ = stream.finish().await;
}

fn status_response(code: StatusCode, msg: &str) -> Response<Bytes> {
    Response::builder()
        .status(code)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Bytes::from(msg.to_string()))
        .expect("static response")
}

fn basic_auth_userinfo(headers: &http::HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    String::from_utf8(decoded).ok()
}

// Pull the wireformat query out of a /dns-query request.
fn wire_request(parts: &http::request::Parts, body: &Bytes) -> Result<Message, Response<Bytes>> {
    let raw = if parts.method == Method::GET {
        let query = parts.uri.query().unwrap_or_default();
        let dns = form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k.as_ref() == "dns")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| {
                status_response(StatusCode::BAD_REQUEST, "missing dns query parameter")
            })?;
        URL_SAFE_NO_PAD
            .decode(dns.trim_end_matches('='))
            .map_err(|_| {
                status_response(StatusCode::BAD_REQUEST, "invalid base64url in dns parameter")
            })?
    } else if parts.method == Method::POST {
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type != MIME_DNS_MESSAGE {
            return Err(status_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "expected application/dns-message",
            ));
        }
        body.to_vec()
    } else {
        return Err(status_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "only GET and POST are served",
        ));
    };

    Message::from_vec(&raw)
        .map_err(|_| status_response(StatusCode::BAD_REQUEST, "unparsable dns message"))
}

fn cache_max_age(resp: &Message) -> u32 {
    let min_ttl = resp
        .answers()
        .iter()
        .chain(resp.name_servers())
        .chain(resp.additionals())
        .map(|r| r.ttl())
        .min();
    match resp.response_code() {
        ResponseCode::NoError | ResponseCode::NXDomain => min_ttl
            .unwrap_or(CACHE_TTL_FLOOR)
            .clamp(CACHE_TTL_FLOOR, CACHE_TTL_CEIL),
        _ => CACHE_TTL_FLOOR,
    }
}

async fn process_request(
    ctx: &HttpCtx,
    parts: http::request::Parts,
    body: Bytes,
    local: SocketAddr,
    peer: SocketAddr,
    sni: Option<Label>,
) -> Response<Bytes> {
    let path = parts.uri.path().to_string();
    let (req_msg, want_json) = match path.as_str() {
        PATH_DNS_QUERY => match wire_request(&parts, &body) {
            Ok(msg) => (msg, false),
            Err(resp) => return resp,
        },
        PATH_RESOLVE => match json::resolve_request(parts.uri.query().unwrap_or_default()) {
            Ok(resolve) => (resolve.query, !resolve.force_wire),
            Err(why) => return status_response(StatusCode::BAD_REQUEST, &why),
        },
        _ => {
            return match &ctx.fallback {
                Some(handler) => {
                    handler
                        .handle(Request::from_parts(parts, body))
                        .await
                }
                None => status_response(StatusCode::NOT_FOUND, "not found"),
            }
        }
    };

    if req_msg.message_type() == MessageType::Response || screen(&req_msg) == Verdict::Ignore {
        return status_response(StatusCode::BAD_REQUEST, "not a query");
    }

    let cx = QueryContext::new(
        ctx.base.info().clone(),
        RequestInfo::new()
            .with_tls_server_name(sni)
            .with_url(parts.uri.clone())
            .with_userinfo(basic_auth_userinfo(&parts.headers)),
    );
    let mut rec = RecordingWriter::new(local, peer);
    if ctx.base.dispatch(&cx, &mut rec, &req_msg).await.is_err() {
        return status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    }

    let mut resp = rec
        .into_response()
        .unwrap_or_else(|| refusal(&req_msg, ResponseCode::ServFail));
    if let Err(e) = normalize(Network::Tcp, Protocol::Doh, &req_msg, &mut resp, u16::MAX) {
        debug!("normalizing doh response for {} failed: {}", peer, e);
        return status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    }

    let (content_type, payload) = if want_json {
        match json::render(&resp) {
            Ok(body) => (MIME_JSON, body),
            Err(e) => {
                debug!("rendering json response for {} failed: {}", peer, e);
                return status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        }
    } else {
        match resp.to_vec() {
            Ok(body) => (MIME_DNS_MESSAGE, body),
            Err(e) => {
                debug!("packing doh response for {} failed: {}", peer, e);
                return status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CACHE_CONTROL,
            format!("max-age={}", cache_max_age(&resp)),
        )
        .header(header::CONTENT_LENGTH, payload.len())
        .body(Bytes::from(payload))
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
}
