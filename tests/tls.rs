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

mod common;

use common::{a_handler, query, server_tls, AcceptAnyCert};
use dserve::server::{DnsConfig, TlsConfig, TlsServer};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::TlsConnector;
use trust_dns_proto::{
    op::{Edns, Message, ResponseCode},
    rr::rdata::opt::{EdnsCode, EdnsOption},
};

async fn start_server() -> (TlsServer, SocketAddr) {
    let server = TlsServer::new(TlsConfig {
        dns: DnsConfig::new(
            "dot-test",
            "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            a_handler(1),
        ),
        tls: server_tls(),
    });
    server.start().await.unwrap();
    let addr = server.local_tcp_addr().unwrap();
    (server, addr)
}

async fn connect(addr: SocketAddr) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .dangerous()
    .with_custom_certificate_verifier(AcceptAnyCert::new())
    .with_no_client_auth();
    crypto.alpn_protocols = vec![b"dot".to_vec()];

    let connector = TlsConnector::from(Arc::new(crypto));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    connector.connect(server_name, tcp).await.unwrap()
}

async fn roundtrip(
    stream: &mut tokio_rustls::client::TlsStream<TcpStream>,
    msg: &Message,
) -> Message {
    let wire = msg.to_vec().unwrap();
    let mut framed = (wire.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(&wire);
    stream.write_all(&framed).await.unwrap();
    stream.flush().await.unwrap();

    let len = timeout(Duration::from_secs(5), stream.read_u16())
        .await
        .expect("no dot response")
        .unwrap();
    let mut buf = vec![0u8; usize::from(len)];
    stream.read_exact(&mut buf).await.unwrap();
    Message::from_vec(&buf).unwrap()
}

#[tokio::test]
async fn tls_happy_path() {
    let (server, addr) = start_server().await;
    let mut stream = connect(addr).await;

    let resp = roundtrip(&mut stream, &query(600, "example.org.")).await;
    assert_eq!(resp.id(), 600);
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert_eq!(resp.answers().len(), 1);

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn padding_mirrors_the_request() {
    let (server, addr) = start_server().await;
    let mut stream = connect(addr).await;

    // A padded query must come back padded, 1 to 32 bytes worth.
    let mut padded = query(601, "example.org.");
    let mut edns = Edns::new();
    edns.set_max_payload(1232);
    edns.options_mut()
        .insert(EdnsOption::Unknown(12, vec![0; 24]));
    padded.set_edns(edns);

    let resp = roundtrip(&mut stream, &padded).await;
    match resp.edns().unwrap().options().get(EdnsCode::from(12)) {
        Some(EdnsOption::Unknown(_, data)) => {
            assert!((1..=32).contains(&data.len()), "padding of {} bytes", data.len())
        }
        other => panic!("expected a padding option, got {:?}", other),
    }

    // An unpadded query must come back unpadded.
    let mut plain = query(602, "example.org.");
    let mut edns = Edns::new();
    edns.set_max_payload(1232);
    plain.set_edns(edns);

    let resp = roundtrip(&mut stream, &plain).await;
    assert!(resp
        .edns()
        .unwrap()
        .options()
        .get(EdnsCode::from(12))
        .is_none());

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn keepalive_reports_the_idle_timeout() {
    let (server, addr) = start_server().await;
    let mut stream = connect(addr).await;

    let mut req = query(603, "example.org.");
    let mut edns = Edns::new();
    edns.set_max_payload(1232);
    edns.options_mut().insert(EdnsOption::Unknown(11, Vec::new()));
    req.set_edns(edns);

    let resp = roundtrip(&mut stream, &req).await;
    match resp.edns().unwrap().options().get(EdnsCode::from(11)) {
        // Default idle timeout is 30 s = 300 units of 100 ms.
        Some(EdnsOption::Unknown(_, data)) => {
            assert_eq!(data.as_slice(), 300u16.to_be_bytes().as_slice())
        }
        other => panic!("expected a keepalive option, got {:?}", other),
    }

    // And without the option in the request, none in the response.
    let resp = roundtrip(&mut stream, &query(604, "example.org.")).await;
    assert!(resp
        .edns()
        .map_or(true, |e| e.options().get(EdnsCode::from(11)).is_none()));

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}
