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

//! Response normalization. Before a response leaves the process it passes
//! through [`normalize`] exactly once, which rewrites the EDNS(0) record,
//! enforces the transport size budget, and applies RFC 8467 padding on the
//! encrypted transports.

use crate::proto::{Network, Protocol};
use rand::Rng;
use std::time::Duration;
use trust_dns_proto::{
    error::ProtoError,
    op::{Edns, Message},
    rr::rdata::opt::{EdnsCode, EdnsOption},
};

/// Largest message the DNS wire format can frame (RFC 1035 TCP length prefix).
pub const MAX_MSG_SIZE: usize = u16::MAX as usize;

/// Minimal UDP payload every resolver must accept (RFC 1035).
pub const MIN_UDP_SIZE: u16 = 512;

/// Length of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// Upper bound for the random padding length (RFC 8467 recommends short,
/// unpredictable paddings for responses).
const MAX_PADDING_LEN: usize = 32;

const NSID_CODE: u16 = 3;
const EXPIRE_CODE: u16 = 9;
const KEEPALIVE_CODE: u16 = 11;
const PADDING_CODE: u16 = 12;

// NSID and EXPIRE are the only options a response may inherit from the
// request (RFC 5001, RFC 7314); everything else is either hop-by-hop or
// meaningless when echoed.
fn preserved(code: EdnsCode) -> bool {
    matches!(u16::from(code), NSID_CODE | EXPIRE_CODE)
}

/// The response size budget for one transport.
///
/// TCP-framed transports get the full wire maximum. UDP honors the size the
/// client advertised via EDNS(0), clamped from above by the server's
/// `max_udp_size` and from below by the 512-byte floor.
pub fn max_response_size(network: Network, advertised: u16, max_udp_size: u16) -> usize {
    match network {
        Network::Tcp => MAX_MSG_SIZE,
        Network::Udp | Network::Any => usize::from(advertised.min(max_udp_size).max(MIN_UDP_SIZE)),
    }
}

/// Rewrite `resp` in place for the wire.
///
/// When the request carried no OPT record, the response is only truncated to
/// the transport budget. Otherwise the response OPT is rebuilt: owner and
/// version reset, the client's UDP size copied, the DO bit mirrored, and the
/// extended RCODE cleared. If the handler did not set an OPT itself, the
/// request options are filtered down to NSID and EXPIRE and carried over.
/// Padding is added last so it never influences the truncation decision.
pub fn normalize(
    network: Network,
    proto: Protocol,
    req: &Message,
    resp: &mut Message,
    max_udp_size: u16,
) -> Result<(), ProtoError> {
    let budget = match req.edns() {
        None => max_response_size(network, 0, max_udp_size),
        Some(req_edns) => {
            // Rebuilding from a fresh Edns resets the owner name, version,
            // and extended RCODE bits in one go.
            let mut edns = Edns::new();
            edns.set_max_payload(req_edns.max_payload());
            edns.set_version(0);
            edns.set_dnssec_ok(req_edns.dnssec_ok());

            match resp.edns() {
                Some(old) => {
                    for opt in old.options().as_ref().values() {
                        edns.options_mut().insert(opt.clone());
                    }
                }
                None => {
                    for (code, opt) in req_edns.options().as_ref() {
                        if preserved(*code) {
                            edns.options_mut().insert(opt.clone());
                        }
                    }
                }
            }
            resp.set_edns(edns);
            max_response_size(network, req_edns.max_payload(), max_udp_size)
        }
    };

    enforce_size(resp, budget)?;

    if proto.supports_padding() && has_option(req, EdnsCode::Padding) {
        if let Some(edns) = resp.edns() {
            let len = rand::thread_rng().gen_range(1..=MAX_PADDING_LEN);
            let mut edns = edns.clone();
            edns.options_mut()
                .insert(EdnsOption::Unknown(PADDING_CODE, vec![0; len]));
            resp.set_edns(edns);
        }
    }

    Ok(())
}

/// Echo an `edns-tcp-keepalive` option (RFC 7828) iff the request carried
/// one. The value is the connection idle timeout in units of 100 ms.
pub fn reflect_tcp_keepalive(req: &Message, resp: &mut Message, idle_timeout: Duration) {
    if !has_option(req, EdnsCode::Keepalive) {
        return;
    }
    let units = (idle_timeout.as_millis() / 100).min(u128::from(u16::MAX)) as u16;
    // The request had an OPT, so normalize has given the response one.
    if let Some(edns) = resp.edns() {
        let mut edns = edns.clone();
        edns.options_mut()
            .insert(EdnsOption::Unknown(KEEPALIVE_CODE, units.to_be_bytes().to_vec()));
        resp.set_edns(edns);
    }
}

/// Whether the request advertised the given EDNS option.
pub fn has_option(msg: &Message, code: EdnsCode) -> bool {
    msg.edns().map_or(false, |e| e.options().get(code).is_some())
}

fn enforce_size(resp: &mut Message, budget: usize) -> Result<(), ProtoError> {
    if resp.to_vec()?.len() > budget {
        *resp = truncated_copy(resp);
    }
    Ok(())
}

// A truncated response keeps the header, question, and OPT only. Sending
// partial record sets from a public resolver invites clients to act on
// incomplete data, so everything else is dropped and TC tells the client to
// come back over TCP.
fn truncated_copy(msg: &Message) -> Message {
    let mut out = Message::new();
    out.set_id(msg.id())
        .set_message_type(msg.message_type())
        .set_op_code(msg.op_code())
        .set_response_code(msg.response_code())
        .set_authoritative(msg.authoritative())
        .set_recursion_desired(msg.recursion_desired())
        .set_recursion_available(msg.recursion_available())
        .set_checking_disabled(msg.checking_disabled())
        .set_truncated(true);
    for q in msg.queries() {
        out.add_query(q.clone());
    }
    if let Some(edns) = msg.edns() {
        out.set_edns(edns.clone());
    }
    out
}
