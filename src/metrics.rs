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

//! Hooks for observability backends. The framework calls these at the points
//! a deployment usually wants counters; what happens behind them is not our
//! concern. Every callback has an empty default so implementors only override
//! what they need.

use crate::{context::QueryContext, handler::HandlerError, proto::Protocol, upstream::UpstreamError};
use std::{net::SocketAddr, time::Duration};
use trust_dns_proto::rr::{Name, RecordType};

/// A snapshot of the query passed to [`MetricsListener::on_request`].
#[derive(Debug, Clone)]
pub struct QueryInfo {
    /// Queried name.
    pub qname: Name,
    /// Queried record type.
    pub qtype: RecordType,
    /// Protocol the query arrived over.
    pub proto: Protocol,
}

/// Receiver for framework events. Implementations must be cheap and must not
/// block: callbacks run inline on the serving path.
pub trait MetricsListener: Send + Sync {
    /// A validated query is about to be dispatched to the handler chain.
    fn on_request(&self, cx: &QueryContext, info: &QueryInfo) {
        let _ = (cx, info);
    }

    /// A message arrived that could not be unpacked. No response is sent for
    /// these.
    fn on_invalid_msg(&self, remote: SocketAddr) {
        let _ = remote;
    }

    /// The handler chain returned an error; a SERVFAIL was synthesized.
    fn on_error(&self, cx: &QueryContext, err: &HandlerError) {
        let _ = (cx, err);
    }

    /// A panic escaped a query job or a listener.
    fn on_panic(&self, server: &str, value: &str) {
        let _ = (server, value);
    }

    /// A QUIC connection consulted the address validator. `hit` is true when
    /// the client address was already validated and no Retry was required.
    fn on_quic_address_validation(&self, hit: bool) {
        let _ = hit;
    }

    /// The forwarding handler finished one exchange attempt against an
    /// upstream.
    fn on_forward_request(
        &self,
        upstream: &str,
        elapsed: Duration,
        error: Option<&UpstreamError>,
    ) {
        let _ = (upstream, elapsed, error);
    }

    /// A healthcheck changed (or re-asserted) the up/down state of an
    /// upstream.
    fn on_upstream_status_changed(&self, upstream: &str, is_main: bool, is_up: bool) {
        let _ = (upstream, is_main, is_up);
    }
}

/// A listener that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyMetricsListener;

impl MetricsListener for EmptyMetricsListener {}
