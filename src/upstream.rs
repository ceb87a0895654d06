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

//! Upstream resolvers. [`PlainUpstream`] speaks classic DNS53 with automatic
//! UDP to TCP re-query when the UDP answer is truncated or does not belong to
//! the question that was asked.

use crate::{message::MAX_MSG_SIZE, proto::Network};
use async_trait::async_trait;
use log::debug;
use std::{fmt, net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::{error::Elapsed, timeout},
};
use trust_dns_proto::{error::ProtoError, op::Message};

/// Error produced by an upstream exchange.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The response could not be packed or unpacked.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// The exchange ran past its deadline.
    #[error(transparent)]
    Timeout(#[from] Elapsed),

    /// The response arrived but does not answer the question that was asked.
    #[error("invalid response: {0}")]
    Invalid(&'static str),

    /// Annotates which upstream a failure came from.
    #[error("exchanging with {upstream}")]
    Exchange {
        /// Address of the failing upstream.
        upstream: String,
        /// What went wrong.
        #[source]
        cause: Box<UpstreamError>,
    },
}

impl UpstreamError {
    /// Wrap `cause` with the upstream it came from. Already-annotated errors
    /// are passed through untouched.
    pub fn wrap(upstream: String, cause: UpstreamError) -> Self {
        match cause {
            e @ Self::Exchange { .. } => e,
            cause => Self::Exchange {
                upstream,
                cause: Box::new(cause),
            },
        }
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// A resolver queries can be relayed to.
#[async_trait]
pub trait Upstream: Send + Sync + fmt::Display {
    /// Send `req` and wait for a validated response.
    async fn exchange(&self, req: &Message) -> Result<Message>;

    /// Release any resources held open between exchanges.
    async fn close(&self) {}
}

/// Check that `resp` answers `req`: same ID, exactly one question, and the
/// question matches name (case-insensitively), type, and class.
pub fn validate_response(req: &Message, resp: &Message) -> Result<()> {
    if resp.id() != req.id() {
        return Err(UpstreamError::Invalid("response id does not match"));
    }
    if resp.queries().len() != 1 {
        return Err(UpstreamError::Invalid("response question count is not 1"));
    }
    // Accepted queries always carry exactly one question.
    let (rq, q) = match (resp.queries().first(), req.queries().first()) {
        (Some(rq), Some(q)) => (rq, q),
        _ => return Err(UpstreamError::Invalid("request carries no question")),
    };
    if rq.name().to_lowercase() != q.name().to_lowercase()
        || rq.query_type() != q.query_type()
        || rq.query_class() != q.query_class()
    {
        return Err(UpstreamError::Invalid("response question does not match"));
    }
    Ok(())
}

/// A plain DNS53 upstream with a preferred network.
///
/// With `Any` (or `Udp`) the query goes out over UDP first; a network error,
/// garbage, an ID or question mismatch, or a truncated answer triggers one
/// re-query over TCP. With `Tcp` the query goes straight to TCP.
pub struct PlainUpstream {
    addr: SocketAddr,
    network: Network,
    timeout: Duration,
}

impl PlainUpstream {
    /// Create an upstream pointing at `addr`.
    pub fn new(addr: SocketAddr, network: Network, timeout: Duration) -> Self {
        Self {
            addr,
            network,
            timeout,
        }
    }

    async fn exchange_udp(&self, req: &Message) -> Result<Message> {
        let wire = req.to_vec()?;
        let socket = UdpSocket::bind(unspecified(self.addr.is_ipv4())).await?;
        socket.connect(self.addr).await?;

        timeout(self.timeout, async {
            socket.send(&wire).await?;
            let mut buf = vec![0u8; MAX_MSG_SIZE];
            let len = socket.recv(&mut buf).await?;
            buf.truncate(len);
            let resp = Message::from_vec(&buf)?;
            validate_response(req, &resp)?;
            Ok(resp)
        })
        .await?
    }

    async fn exchange_tcp(&self, req: &Message) -> Result<Message> {
        let wire = req.to_vec()?;
        let len = u16::try_from(wire.len())
            .map_err(|_| UpstreamError::Invalid("request exceeds the wire maximum"))?;

        timeout(self.timeout, async {
            let mut stream = TcpStream::connect(self.addr).await?;
            let mut payload = Vec::with_capacity(2 + wire.len());
            payload.extend_from_slice(&len.to_be_bytes());
            payload.extend_from_slice(&wire);
            stream.write_all(&payload).await?;
            stream.flush().await?;

            let resp_len = stream.read_u16().await?;
            let mut buf = vec![0u8; usize::from(resp_len)];
            stream.read_exact(&mut buf).await?;
            let resp = Message::from_vec(&buf)?;
            validate_response(req, &resp)?;
            Ok(resp)
        })
        .await?
    }
}

#[async_trait]
impl Upstream for PlainUpstream {
    async fn exchange(&self, req: &Message) -> Result<Message> {
        let result = match self.network {
            Network::Tcp => self.exchange_tcp(req).await,
            Network::Udp | Network::Any => match self.exchange_udp(req).await {
                Ok(resp) if !resp.truncated() => Ok(resp),
                Ok(_) => {
                    debug!("response from {} was truncated, re-querying over tcp", self);
                    self.exchange_tcp(req).await
                }
                Err(e) => {
                    debug!("udp exchange with {} failed ({}), re-querying over tcp", self, e);
                    self.exchange_tcp(req).await
                }
            },
        };
        result.map_err(|e| UpstreamError::wrap(self.to_string(), e))
    }
}

impl fmt::Display for PlainUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network {
            Network::Tcp => write!(f, "tcp://{}", self.addr),
            Network::Udp | Network::Any => write!(f, "udp://{}", self.addr),
        }
    }
}

fn unspecified(is_ipv4: bool) -> SocketAddr {
    if is_ipv4 {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use trust_dns_proto::{
        op::{MessageType, OpCode, Query},
        rr::{Name, RecordType},
    };

    fn req(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(1234)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    fn resp_for(req: &Message) -> Message {
        let mut msg = Message::new();
        msg.set_id(req.id()).set_message_type(MessageType::Response);
        for q in req.queries() {
            msg.add_query(q.clone());
        }
        msg
    }

    #[test]
    fn matching_response_passes() {
        let q = req("example.org.");
        assert!(validate_response(&q, &resp_for(&q)).is_ok());
    }

    #[test]
    fn id_mismatch_is_rejected() {
        let q = req("example.org.");
        let mut r = resp_for(&q);
        r.set_id(4321);
        assert!(validate_response(&q, &r).is_err());
    }

    #[test]
    fn qname_comparison_ignores_case() {
        let q = req("example.org.");
        let mut r = Message::new();
        r.set_id(q.id())
            .add_query(Query::query(Name::from_str("EXAMPLE.ORG.").unwrap(), RecordType::A));
        assert!(validate_response(&q, &r).is_ok());
    }

    #[test]
    fn foreign_question_is_rejected() {
        let q = req("example.org.");
        let mut r = Message::new();
        r.set_id(q.id())
            .add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        assert!(validate_response(&q, &r).is_err());
    }

    #[test]
    fn qtype_mismatch_is_rejected() {
        let q = req("example.org.");
        let mut r = Message::new();
        r.set_id(q.id()).add_query(Query::query(
            Name::from_str("example.org.").unwrap(),
            RecordType::AAAA,
        ));
        assert!(validate_response(&q, &r).is_err());
    }

    #[test]
    fn zero_question_response_is_rejected() {
        let q = req("example.org.");
        let mut r = Message::new();
        r.set_id(q.id());
        assert!(validate_response(&q, &r).is_err());
    }
}
