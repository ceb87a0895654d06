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

#![deny(missing_docs)]
#![deny(unsafe_code)]
// Documentation
//! This is the serving core for dcompass-family resolvers. It accepts DNS
//! queries over plain UDP/TCP, DoT, DoH (HTTP/1.1, HTTP/2, HTTP/3), DoQ, and
//! DNSCrypt, dispatches them to a user-supplied [`Handler`](handler::Handler),
//! and writes back normalized responses. It also ships a forwarding handler
//! with UDP to TCP fallback and healthcheck-driven failover between primary
//! and fallback upstreams.

pub mod buf;
pub mod context;
pub mod error;
pub mod forward;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod proto;
pub mod server;
pub mod taskpool;
pub mod upstream;

pub use self::{
    context::{QueryContext, RequestInfo, ServerInfo},
    error::DserveError,
    forward::ForwardHandler,
    handler::{writer::ResponseWriter, Handler, Middleware},
    metrics::MetricsListener,
    proto::{Network, Protocol},
    upstream::Upstream,
};

use std::sync::Arc;

/// Tag used to identify servers and upstreams in logs and metrics.
pub type Label = Arc<str>;
