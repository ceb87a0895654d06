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

//! Protocol and network selectors shared by every server and upstream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The DNS wire protocol a server speaks or a request arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain DNS over UDP or TCP (RFC 1035).
    Dns,
    /// DNS-over-TLS (RFC 7858).
    Dot,
    /// DNS-over-HTTPS over HTTP/1.1, HTTP/2, or HTTP/3 (RFC 8484).
    Doh,
    /// DNS-over-QUIC (RFC 9250).
    Doq,
    /// DNSCrypt over UDP.
    DnscryptUdp,
    /// DNSCrypt over TCP.
    DnscryptTcp,
}

/// ALPN token for DoT.
pub const ALPN_DOT: &[u8] = b"dot";
/// ALPN tokens for DoH over TCP, in negotiation order.
pub const ALPN_DOH: [&[u8]; 2] = [b"h2", b"http/1.1"];
/// ALPN tokens for DoH over HTTP/3, in negotiation order.
pub const ALPN_DOH3: [&[u8]; 3] = [b"h3", b"h2", b"http/1.1"];
/// ALPN tokens for DoQ. The first entry is the RFC 9250 token, the rest are
/// draft-era tokens kept for backward compatibility.
pub const ALPN_DOQ: [&[u8]; 5] = [b"doq", b"doq-i00", b"doq-i02", b"doq-i03", b"dq"];

impl Protocol {
    /// Whether the protocol runs over a TLS (or QUIC) handshake.
    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::Dot | Self::Doh | Self::Doq)
    }

    /// Whether responses on this protocol may carry an EDNS Padding option
    /// (RFC 8467 limits padding to encrypted transports).
    pub fn supports_padding(self) -> bool {
        self.is_encrypted()
    }

    /// The ALPN tokens offered during the TLS handshake, empty for protocols
    /// without one.
    pub fn alpn(self) -> &'static [&'static [u8]] {
        match self {
            Self::Dot => &[ALPN_DOT],
            Self::Doh => &ALPN_DOH,
            Self::Doq => &ALPN_DOQ,
            Self::Dns | Self::DnscryptUdp | Self::DnscryptTcp => &[],
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dns => "dns",
            Self::Dot => "tls",
            Self::Doh => "https",
            Self::Doq => "quic",
            Self::DnscryptUdp => "dnscrypt (udp)",
            Self::DnscryptTcp => "dnscrypt (tcp)",
        })
    }
}

/// Which transports a server should open listeners on, or an upstream should
/// exchange over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Use every transport appropriate for the protocol.
    #[default]
    Any,
    /// UDP only.
    Udp,
    /// TCP only.
    Tcp,
}

impl Network {
    /// Whether a UDP listener (or exchange) is wanted.
    pub fn wants_udp(self) -> bool {
        matches!(self, Self::Any | Self::Udp)
    }

    /// Whether a TCP listener (or exchange) is wanted.
    pub fn wants_tcp(self) -> bool {
        matches!(self, Self::Any | Self::Tcp)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Any => "any",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_is_limited_to_encrypted_transports() {
        assert!(Protocol::Dot.supports_padding());
        assert!(Protocol::Doh.supports_padding());
        assert!(Protocol::Doq.supports_padding());
        assert!(!Protocol::Dns.supports_padding());
        assert!(!Protocol::DnscryptUdp.supports_padding());
        assert!(!Protocol::DnscryptTcp.supports_padding());
    }

    #[test]
    fn doq_alpn_prefers_the_rfc_token() {
        assert_eq!(Protocol::Doq.alpn()[0], b"doq");
    }

    #[test]
    fn network_gates_listeners() {
        assert!(Network::Any.wants_udp() && Network::Any.wants_tcp());
        assert!(Network::Udp.wants_udp() && !Network::Udp.wants_tcp());
        assert!(!Network::Tcp.wants_udp() && Network::Tcp.wants_tcp());
    }
}
