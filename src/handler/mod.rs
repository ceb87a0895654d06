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

//! The handler seam: servers hand every validated query to a [`Handler`],
//! optionally wrapped by a [`Middleware`] chain.

pub mod writer;

pub use writer::{RecordingWriter, ResponseWriter, WrappingRecorder, WriterError};

use crate::{context::QueryContext, forward::ForwardError, upstream::UpstreamError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use trust_dns_proto::{error::ProtoError, op::Message};

/// Error returned by handlers and middlewares.
///
/// A non-`Ok` return makes the dispatching server synthesize a SERVFAIL
/// response; the error itself is reported to the metrics listener and never
/// reaches the client.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// I/O error while producing the response.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed message encountered while producing the response.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// The response writer failed.
    #[error(transparent)]
    Writer(#[from] WriterError),

    /// A single upstream exchange failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The forwarding handler exhausted its upstreams.
    #[error(transparent)]
    Forward(#[from] ForwardError),

    /// Any other handler-specific failure.
    #[error("handler failed: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Result alias used throughout the handler seam.
pub type Result<T> = std::result::Result<T, HandlerError>;

/// Processes one DNS query.
///
/// A handler writes its response through `rw` and returns `Ok(())`. Writing
/// nothing and returning `Ok(())` means "no response", which is valid on
/// UDP/TCP, while the DoQ and DNSCrypt servers synthesize a SERVFAIL because
/// their framing requires one. `req` and any message passed to
/// [`ResponseWriter::write_msg`] must not be touched afterwards; the writer
/// may be a recorder that hands them onward.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve a single query.
    async fn serve_dns(
        &self,
        cx: &QueryContext,
        rw: &mut dyn ResponseWriter,
        req: &Message,
    ) -> Result<()>;
}

/// A composable layer around a [`Handler`].
pub trait Middleware: Send + Sync {
    /// Wrap `next`, returning the handler that runs this layer first.
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler>;
}

/// Compose `middlewares` around `handler` so that the first listed middleware
/// runs first. Built by folding the list in reverse: `[m1, m2, m3]` over `h`
/// yields `m1(m2(m3(h)))`.
pub fn wrap_all(middlewares: &[Arc<dyn Middleware>], handler: Arc<dyn Handler>) -> Arc<dyn Handler> {
    middlewares
        .iter()
        .rev()
        .fold(handler, |inner, m| m.wrap(inner))
}

/// Adapts a plain response-building closure into a [`Handler`]. Handy for
/// static zones and tests.
pub struct RespondWith<F>(
    /// The response builder the adapter calls for every query.
    pub F,
);

#[async_trait]
impl<F> Handler for RespondWith<F>
where
    F: Fn(&Message) -> Result<Message> + Send + Sync,
{
    async fn serve_dns(
        &self,
        cx: &QueryContext,
        rw: &mut dyn ResponseWriter,
        req: &Message,
    ) -> Result<()> {
        let resp = (self.0)(req)?;
        rw.write_msg(cx, req, resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::{RequestInfo, ServerInfo},
        proto::Protocol,
    };
    use std::net::SocketAddr;
    use trust_dns_proto::op::{MessageType, OpCode};

    fn test_cx() -> QueryContext {
        let addr: SocketAddr = "127.0.0.1:53".parse().unwrap();
        QueryContext::new(
            Arc::new(ServerInfo::new("test", addr, Protocol::Dns)),
            RequestInfo::new(),
        )
    }

    struct Tag(&'static str);

    #[async_trait]
    impl Handler for Tag {
        async fn serve_dns(
            &self,
            cx: &QueryContext,
            rw: &mut dyn ResponseWriter,
            req: &Message,
        ) -> Result<()> {
            let mut wrapped = WrappingRecorder::new(rw);
            // Delegation target: answer with an empty response whose opcode
            // encodes nothing; the tag only matters for ordering assertions.
            let mut resp = Message::new();
            resp.set_id(req.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query);
            wrapped.write_msg(cx, req, resp).await?;
            log::debug!("layer {} wrote", self.0);
            Ok(())
        }
    }

    struct Prepend(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);

    impl Middleware for Prepend {
        fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
            struct Layer {
                tag: &'static str,
                order: Arc<std::sync::Mutex<Vec<&'static str>>>,
                next: Arc<dyn Handler>,
            }

            #[async_trait]
            impl Handler for Layer {
                async fn serve_dns(
                    &self,
                    cx: &QueryContext,
                    rw: &mut dyn ResponseWriter,
                    req: &Message,
                ) -> Result<()> {
                    self.order.lock().unwrap().push(self.tag);
                    self.next.serve_dns(cx, rw, req).await
                }
            }

            Arc::new(Layer {
                tag: self.0,
                order: self.1.clone(),
                next,
            })
        }
    }

    #[tokio::test]
    async fn middlewares_run_in_list_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Prepend("first", order.clone())),
            Arc::new(Prepend("second", order.clone())),
            Arc::new(Prepend("third", order.clone())),
        ];
        let h = wrap_all(&chain, Arc::new(Tag("inner")));

        let cx = test_cx();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut rec = RecordingWriter::new(addr, addr);
        let req = Message::new();
        h.serve_dns(&cx, &mut rec, &req).await.unwrap();

        assert_eq!(&*order.lock().unwrap(), &["first", "second", "third"]);
        assert!(rec.response().is_some());
    }
}
