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

//! Server implementations, one per protocol, sharing a common base that owns
//! lifecycle, query screening, handler dispatch, and shutdown coordination.

pub mod dns;
pub mod dnscrypt;
pub mod https;
pub mod quic;
pub mod tls;

pub use self::{
    dns::{DnsConfig, DnsServer},
    dnscrypt::{DnsCryptCodec, DnsCryptConfig, DnsCryptHandler, DnsCryptServer},
    https::{HttpHandler, HttpsConfig, HttpsServer},
    quic::{QuicConfig, QuicServer},
    tls::{TlsConfig, TlsServer},
};

use crate::{
    context::{QueryContext, ServerInfo},
    handler::{writer::WriterError, Handler, ResponseWriter},
    metrics::{MetricsListener, QueryInfo},
    taskpool::TaskPool,
};
use futures::FutureExt;
use log::{debug, error};
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use trust_dns_proto::op::{Message, MessageType, OpCode, ResponseCode};

/// Default deadline for reading one message (or finishing a TLS handshake).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Default deadline for writing one response.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default worker cap shared by the listeners of one server.
pub const DEFAULT_MAX_WORKERS: usize = 1024;

/// Error related to server lifecycle and listeners.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called on a server that is already running or stopped.
    #[error("server {0} has already been started")]
    AlreadyStarted(String),

    /// `shutdown` was called on a server that never ran.
    #[error("server {0} is not running")]
    NotRunning(String),

    /// In-flight queries were still draining when the shutdown deadline
    /// fired.
    #[error("server {0} did not drain before the shutdown deadline")]
    ShutdownTimeout(String),

    /// Listener or socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The supplied configuration cannot be served.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The TLS configuration cannot back a QUIC endpoint.
    #[error(transparent)]
    QuicConfig(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
}

/// Result alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Running,
    Stopped,
}

/// What to do with an incoming message before it reaches the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Hand it to the handler chain.
    Accept,
    /// Answer with the given error code without consulting the handler.
    Reject(ResponseCode),
    /// Drop it silently.
    Ignore,
}

/// Uniform accept-time validation, applied on every transport.
pub(crate) fn screen(msg: &Message) -> Verdict {
    // A response on a server socket is either reflection or confusion;
    // answering it would let an attacker bounce traffic off us.
    if msg.message_type() == MessageType::Response {
        return Verdict::Ignore;
    }
    match msg.op_code() {
        OpCode::Query | OpCode::Notify => {}
        _ => return Verdict::Reject(ResponseCode::NotImp),
    }
    if msg.queries().len() != 1 || msg.answers().len() > 1 || msg.name_servers().len() > 1 {
        return Verdict::Reject(ResponseCode::FormErr);
    }
    Verdict::Accept
}

/// Build the error response for a rejected or failed query.
pub(crate) fn refusal(req: &Message, code: ResponseCode) -> Message {
    let mut resp = Message::error_msg(req.id(), req.op_code(), code);
    resp.set_recursion_desired(req.recursion_desired());
    for q in req.queries() {
        resp.add_query(q.clone());
    }
    resp
}

/// Why a dispatched query could not be completed.
#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    /// The handler panicked; the transport should drop the connection.
    #[error("handler panicked")]
    Panic,

    /// The response could not be written.
    #[error(transparent)]
    Writer(#[from] WriterError),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// State shared by every per-protocol server: identity, lifecycle flag,
/// worker pool, shutdown plumbing, and the dispatch path.
pub(crate) struct ServerBase {
    info: Arc<ServerInfo>,
    handler: Arc<dyn Handler>,
    metrics: Arc<dyn MetricsListener>,
    pool: TaskPool,
    tracker: TaskTracker,
    token: CancellationToken,
    state: Mutex<State>,
}

impl ServerBase {
    pub(crate) fn new(
        info: ServerInfo,
        handler: Arc<dyn Handler>,
        metrics: Arc<dyn MetricsListener>,
        max_workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            info: Arc::new(info),
            handler,
            metrics,
            pool: TaskPool::new(max_workers),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
            state: Mutex::new(State::NotStarted),
        })
    }

    pub(crate) fn info(&self) -> &Arc<ServerInfo> {
        &self.info
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsListener> {
        &self.metrics
    }

    pub(crate) fn pool(&self) -> &TaskPool {
        &self.pool
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.state.lock().expect("server state poisoned") == State::Running
    }

    // not-started -> running, once.
    pub(crate) fn begin_start(&self) -> Result<()> {
        let mut state = self.state.lock().expect("server state poisoned");
        match *state {
            State::NotStarted => {
                *state = State::Running;
                Ok(())
            }
            _ => Err(ServerError::AlreadyStarted(self.info.name().to_string())),
        }
    }

    // running -> stopped, once. Cancels the token, which unblocks every
    // listener loop and pending connection read.
    pub(crate) fn begin_shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().expect("server state poisoned");
        match *state {
            State::Running => {
                *state = State::Stopped;
                self.token.cancel();
                Ok(())
            }
            _ => Err(ServerError::NotRunning(self.info.name().to_string())),
        }
    }

    // Wait for listener loops and in-flight workers, then release the pool.
    // The pool is released even when the deadline fires, so stragglers can
    // still finish but nothing new is admitted.
    pub(crate) async fn wait_drained(&self, deadline: Duration) -> Result<()> {
        self.tracker.close();
        let drained = timeout(deadline, self.tracker.wait()).await;
        self.pool.close();
        drained.map_err(|_| ServerError::ShutdownTimeout(self.info.name().to_string()))
    }

    /// Run a listener loop. A panic here means the server silently stopped
    /// accepting traffic, which no runtime recovery can fix; report it and
    /// take the process down.
    pub(crate) fn spawn_listener<F>(self: &Arc<Self>, what: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let base = self.clone();
        self.tracker.spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => debug!("{} loop of {} exited", what, base.info.name()),
                Ok(Err(e)) => error!("{} loop of {} failed: {}", what, base.info.name(), e),
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    base.metrics.on_panic(base.info.name(), &msg);
                    error!(
                        "fatal: {} loop of {} panicked: {}",
                        what,
                        base.info.name(),
                        msg
                    );
                    std::process::abort();
                }
            }
        });
    }

    /// Screen `req`, run the handler chain, and make sure a failure turns
    /// into SERVFAIL rather than silence-with-error.
    pub(crate) async fn dispatch(
        &self,
        cx: &QueryContext,
        rw: &mut dyn ResponseWriter,
        req: &Message,
    ) -> std::result::Result<(), DispatchError> {
        match screen(req) {
            Verdict::Ignore => {
                debug!("ignoring response-flagged message on {}", self.info.name());
                return Ok(());
            }
            Verdict::Reject(code) => {
                rw.write_msg(cx, req, refusal(req, code)).await?;
                return Ok(());
            }
            Verdict::Accept => {}
        }

        if let Some(q) = req.queries().first() {
            self.metrics.on_request(
                cx,
                &QueryInfo {
                    qname: q.name().clone(),
                    qtype: q.query_type(),
                    proto: self.info.proto(),
                },
            );
        }

        match AssertUnwindSafe(self.handler.serve_dns(cx, rw, req))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("handler on {} failed: {}", self.info.name(), e);
                self.metrics.on_error(cx, &e);
                rw.write_msg(cx, req, refusal(req, ResponseCode::ServFail))
                    .await?;
                Ok(())
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                self.metrics.on_panic(self.info.name(), &msg);
                error!("handler on {} panicked: {}", self.info.name(), msg);
                Err(DispatchError::Panic)
            }
        }
    }
}
