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

use common::{a_handler, query, query_with_edns};
use dserve::server::{DnsConfig, DnsServer};
use std::{collections::HashSet, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use trust_dns_proto::op::{Message, OpCode, ResponseCode};

async fn start_server(answers: usize) -> DnsServer {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = DnsServer::new(DnsConfig::new(
        "dns-test",
        "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        a_handler(answers),
    ));
    server.start().await.unwrap();
    server
}

async fn udp_roundtrip(addr: SocketAddr, msg: &Message) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(addr).await.unwrap();
    socket.send(&msg.to_vec().unwrap()).await.unwrap();

    let mut buf = vec![0u8; 65535];
    let len = timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .expect("no response within 2s")
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

#[tokio::test]
async fn udp_happy_path() {
    let server = start_server(1).await;
    let addr = server.local_udp_addr().unwrap();

    let req = query(4242, "example.org.");
    let resp = udp_roundtrip(addr, &req).await;

    assert_eq!(resp.id(), 4242);
    assert_eq!(resp.response_code(), ResponseCode::NoError);
    assert!(!resp.truncated());
    assert_eq!(resp.answers().len(), 1);
    let answer = &resp.answers()[0];
    assert_eq!(answer.name().to_utf8(), "example.org.");
    assert_eq!(answer.ttl(), 100);
    assert_eq!(
        answer.data().unwrap().to_string(),
        "0.0.0.0"
    );

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn udp_truncates_without_edns() {
    let server = start_server(64).await;
    let addr = server.local_udp_addr().unwrap();

    let resp = udp_roundtrip(addr, &query(1, "example.org.")).await;

    assert!(resp.truncated());
    assert!(resp.answers().is_empty());
    assert!(resp.to_vec().unwrap().len() <= 512);

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn udp_honors_advertised_edns_size() {
    let server = start_server(64).await;
    let addr = server.local_udp_addr().unwrap();

    let resp = udp_roundtrip(addr, &query_with_edns(2, "example.org.", 2000)).await;

    assert!(!resp.truncated());
    assert_eq!(resp.answers().len(), 64);

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn two_questions_get_formerr() {
    let server = start_server(1).await;
    let addr = server.local_udp_addr().unwrap();

    let mut req = query(7, "example.org.");
    req.add_query(trust_dns_proto::op::Query::query(
        trust_dns_proto::rr::Name::from_utf8("example.com.").unwrap(),
        trust_dns_proto::rr::RecordType::A,
    ));
    let resp = udp_roundtrip(addr, &req).await;

    assert_eq!(resp.response_code(), ResponseCode::FormErr);
    assert!(resp.answers().is_empty());

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn status_opcode_gets_notimp() {
    let server = start_server(1).await;
    let addr = server.local_udp_addr().unwrap();

    let mut req = query(8, "example.org.");
    req.set_op_code(OpCode::Status);
    let resp = udp_roundtrip(addr, &req).await;

    assert_eq!(resp.response_code(), ResponseCode::NotImp);
    assert_eq!(resp.op_code(), OpCode::Status);

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn tcp_pipelining_answers_every_query() {
    let server = start_server(1).await;
    let addr = server.local_tcp_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // 100 back-to-back queries, distinct ids and names so responses can be
    // paired up regardless of the order they come back in.
    let mut writes = Vec::new();
    for id in 1..=100u16 {
        let msg = query(id, &format!("host{}.example.org.", id));
        let wire = msg.to_vec().unwrap();
        writes.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        writes.extend_from_slice(&wire);
    }
    stream.write_all(&writes).await.unwrap();
    stream.flush().await.unwrap();

    let mut seen = HashSet::new();
    for _ in 0..100 {
        let len = timeout(Duration::from_secs(5), stream.read_u16())
            .await
            .expect("pipelined response missing")
            .unwrap();
        let mut buf = vec![0u8; usize::from(len)];
        stream.read_exact(&mut buf).await.unwrap();
        let resp = Message::from_vec(&buf).unwrap();

        assert_eq!(
            resp.queries()[0].name().to_utf8(),
            format!("host{}.example.org.", resp.id())
        );
        assert!(seen.insert(resp.id()), "duplicate response id {}", resp.id());
    }
    assert_eq!(seen, (1..=100).collect::<HashSet<u16>>());

    server.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_all_listeners() {
    let server = start_server(1).await;
    let udp = server.local_udp_addr().unwrap();
    let tcp = server.local_tcp_addr().unwrap();

    // Warm check that it serves at all.
    let resp = udp_roundtrip(udp, &query(1, "example.org.")).await;
    assert_eq!(resp.response_code(), ResponseCode::NoError);

    server.shutdown(Duration::from_secs(5)).await.unwrap();

    // UDP: the socket is gone, nothing answers.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(udp).await.unwrap();
    socket
        .send(&query(2, "example.org.").to_vec().unwrap())
        .await
        .unwrap();
    let mut buf = [0u8; 512];
    assert!(
        timeout(Duration::from_millis(500), socket.recv(&mut buf))
            .await
            .is_err(),
        "a shut-down server answered a udp query"
    );

    // TCP: connects are refused, or the connection is unusable right away.
    match TcpStream::connect(tcp).await {
        Err(_) => {}
        Ok(mut stream) => {
            let msg = query(3, "example.org.").to_vec().unwrap();
            let mut framed = (msg.len() as u16).to_be_bytes().to_vec();
            framed.extend_from_slice(&msg);
            let _ = stream.write_all(&framed).await;
            let mut buf = [0u8; 2];
            match timeout(Duration::from_millis(500), stream.read_exact(&mut buf)).await {
                Ok(Ok(_)) => panic!("a shut-down server answered a tcp query"),
                _ => {}
            }
        }
    }

    // A second shutdown must fail: the transition is one-shot.
    assert!(server.shutdown(Duration::from_secs(1)).await.is_err());
}
