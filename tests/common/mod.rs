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

//! Shared helpers for the integration tests: canned handlers, query
//! builders, and self-signed TLS material.

#![allow(dead_code)]

use dserve::handler::{Handler, HandlerError, RespondWith};
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::{net::Ipv4Addr, str::FromStr, sync::Arc};
use trust_dns_proto::{
    op::{Edns, Message, MessageType, OpCode, Query},
    rr::{rdata::A, Name, RData, Record, RecordType},
};

/// Response skeleton mirroring the request.
pub fn response_for(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(req.op_code())
        .set_recursion_desired(req.recursion_desired())
        .set_recursion_available(true);
    for q in req.queries() {
        resp.add_query(q.clone());
    }
    resp
}

/// A handler answering every query with `n` copies of `A 0.0.0.0`, TTL 100.
pub fn a_handler(n: usize) -> Arc<dyn Handler> {
    Arc::new(RespondWith(move |req: &Message| {
        let mut resp = response_for(req);
        let name = req.queries()[0].name().clone();
        for _ in 0..n {
            resp.add_answer(Record::from_rdata(
                name.clone(),
                100,
                RData::A(A::from(Ipv4Addr::UNSPECIFIED)),
            ));
        }
        Ok::<_, HandlerError>(resp)
    }))
}

/// Plain A/IN query for `name` with the given id.
pub fn query(id: u16, name: &str) -> Message {
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    msg
}

/// Like [`query`], with an OPT advertising `payload` bytes of UDP budget.
pub fn query_with_edns(id: u16, name: &str, payload: u16) -> Message {
    let mut msg = query(id, name);
    let mut edns = Edns::new();
    edns.set_max_payload(payload);
    edns.set_version(0);
    msg.set_edns(edns);
    msg
}

/// Self-signed server TLS config for `localhost` / `127.0.0.1`.
///
/// The provider is named explicitly: the dev-dependency graph enables more
/// than one rustls backend, which makes the provider-less builder panic.
pub fn server_tls() -> rustls::ServerConfig {
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();
    let cert_der = cert.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key.into())
    .unwrap()
}

/// A certificate verifier that accepts whatever the test server presents.
#[derive(Debug)]
pub struct AcceptAnyCert(rustls::crypto::CryptoProvider);

impl AcceptAnyCert {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(rustls::crypto::aws_lc_rs::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
