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

//! Request-scoped state handed to every middleware and handler.
//!
//! Instead of an untyped bag of context values, the state travels in a
//! [`QueryContext`] struct: server identity is always present, per-request
//! extras (TLS server name, DoH URL, userinfo) are `Option`s with accessors.

use crate::{proto::Protocol, Label};
use http::Uri;
use std::{net::SocketAddr, sync::Arc, time::Instant};

/// Identity of the server a query arrived on. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    name: Label,
    addr: SocketAddr,
    proto: Protocol,
}

impl ServerInfo {
    /// Create a new server identity.
    pub fn new(name: impl Into<Label>, addr: SocketAddr, proto: Protocol) -> Self {
        Self {
            name: name.into(),
            addr,
            proto,
        }
    }

    /// The configured server name, used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address the server was configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The protocol the server speaks.
    pub fn proto(&self) -> Protocol {
        self.proto
    }
}

/// Per-request state. Valid for a single handler invocation; the framework
/// never mutates it after the handler has been entered.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    start: Instant,
    tls_server_name: Option<Label>,
    url: Option<Uri>,
    userinfo: Option<String>,
}

impl RequestInfo {
    /// Create request info stamped with the current time.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            tls_server_name: None,
            url: None,
            userinfo: None,
        }
    }

    /// Record the SNI the client sent during the TLS handshake.
    pub fn with_tls_server_name(mut self, name: Option<Label>) -> Self {
        self.tls_server_name = name;
        self
    }

    /// Record the URL of the DoH request that carried the query.
    pub fn with_url(mut self, url: Uri) -> Self {
        self.url = Some(url);
        self
    }

    /// Record the basic-auth userinfo of the DoH request, if any.
    pub fn with_userinfo(mut self, userinfo: Option<String>) -> Self {
        self.userinfo = userinfo;
        self
    }

    /// When the server started processing the query.
    pub fn start_time(&self) -> Instant {
        self.start
    }

    /// TLS server name indication, present on DoT/DoH/DoQ requests that sent
    /// one.
    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls_server_name.as_deref()
    }

    /// URL of the DoH request, present only on DoH.
    pub fn url(&self) -> Option<&Uri> {
        self.url.as_ref()
    }

    /// Basic-auth userinfo of the DoH request, present only when the client
    /// authenticated.
    pub fn userinfo(&self) -> Option<&str> {
        self.userinfo.as_deref()
    }
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a handler may need to know about the query besides the message
/// itself.
#[derive(Debug, Clone)]
pub struct QueryContext {
    server: Arc<ServerInfo>,
    request: RequestInfo,
}

impl QueryContext {
    /// Assemble the context for one query.
    pub fn new(server: Arc<ServerInfo>, request: RequestInfo) -> Self {
        Self { server, request }
    }

    /// Identity of the server that accepted the query.
    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// Per-request state.
    pub fn request(&self) -> &RequestInfo {
        &self.request
    }
}
