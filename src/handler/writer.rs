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

//! Response writers. Every transport has a direct writer; two recorders let
//! middlewares and wrapping servers observe the response instead of (or in
//! addition to) sending it.

use crate::context::QueryContext;
use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;
use trust_dns_proto::{error::ProtoError, op::Message};

/// Error produced while serializing or sending a response.
#[derive(Debug, Error)]
pub enum WriterError {
    /// Socket-level failure; the connection is usually torn down.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The response could not be serialized.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// The serialized response exceeds what the transport can frame.
    #[error("response of {0} bytes exceeds the transport limit")]
    ResponseTooLarge(usize),
}

/// Result alias for writer operations.
pub type Result<T> = std::result::Result<T, WriterError>;

/// The capability handed to handlers for answering a query.
///
/// The response is taken by value: once written it belongs to the writer and
/// cannot be retouched by the handler.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Address of the listener the query arrived on.
    fn local_addr(&self) -> SocketAddr;

    /// Address of the client.
    fn remote_addr(&self) -> SocketAddr;

    /// Normalize `resp` for the transport and send it.
    async fn write_msg(&mut self, cx: &QueryContext, req: &Message, resp: Message) -> Result<()>;
}

/// A writer that sends nothing and keeps the last response.
///
/// Used by middlewares that want to suppress the inner write, and by the DoQ,
/// DoH, and DNSCrypt servers, whose framing needs the response bytes in hand
/// before anything touches the wire.
#[derive(Debug)]
pub struct RecordingWriter {
    local: SocketAddr,
    remote: SocketAddr,
    resp: Option<Message>,
}

impl RecordingWriter {
    /// Create a recorder reporting the given addresses.
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            local,
            remote,
            resp: None,
        }
    }

    /// The last recorded response, if the handler wrote one.
    pub fn response(&self) -> Option<&Message> {
        self.resp.as_ref()
    }

    /// Consume the recorder, yielding the last recorded response.
    pub fn into_response(self) -> Option<Message> {
        self.resp
    }
}

#[async_trait]
impl ResponseWriter for RecordingWriter {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_msg(&mut self, _cx: &QueryContext, _req: &Message, resp: Message) -> Result<()> {
        self.resp = Some(resp);
        Ok(())
    }
}

/// A writer that forwards to an inner writer and also keeps the last
/// response. Lets a middleware observe what the chain below it produced
/// without interfering with the actual write.
pub struct WrappingRecorder<'a> {
    inner: &'a mut dyn ResponseWriter,
    resp: Option<Message>,
}

impl<'a> WrappingRecorder<'a> {
    /// Wrap `inner`.
    pub fn new(inner: &'a mut dyn ResponseWriter) -> Self {
        Self { inner, resp: None }
    }

    /// The last response passed through this recorder.
    pub fn response(&self) -> Option<&Message> {
        self.resp.as_ref()
    }
}

#[async_trait]
impl ResponseWriter for WrappingRecorder<'_> {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr()
    }

    async fn write_msg(&mut self, cx: &QueryContext, req: &Message, resp: Message) -> Result<()> {
        self.resp = Some(resp.clone());
        self.inner.write_msg(cx, req, resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::{RequestInfo, ServerInfo},
        proto::Protocol,
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn recorder_keeps_the_last_response() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let cx = QueryContext::new(
            Arc::new(ServerInfo::new("rec", addr, Protocol::Dns)),
            RequestInfo::new(),
        );
        let mut rec = RecordingWriter::new(addr, addr);

        let req = Message::new();
        let mut first = Message::new();
        first.set_id(1);
        let mut second = Message::new();
        second.set_id(2);

        rec.write_msg(&cx, &req, first).await.unwrap();
        rec.write_msg(&cx, &req, second).await.unwrap();
        assert_eq!(rec.into_response().unwrap().id(), 2);
    }

    #[tokio::test]
    async fn wrapping_recorder_passes_through() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let cx = QueryContext::new(
            Arc::new(ServerInfo::new("rec", addr, Protocol::Dns)),
            RequestInfo::new(),
        );
        let mut inner = RecordingWriter::new(addr, addr);
        let mut wrapped = WrappingRecorder::new(&mut inner);

        let req = Message::new();
        let mut resp = Message::new();
        resp.set_id(7);
        wrapped.write_msg(&cx, &req, resp).await.unwrap();

        assert_eq!(wrapped.response().unwrap().id(), 7);
        assert_eq!(inner.response().unwrap().id(), 7);
    }
}
