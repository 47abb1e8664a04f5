//! End-to-end proxy tests over loopback UDP.
//!
//! These tests stand up a real proxy with a real configuration and verify:
//! - the UDP→UDP forwarding path with per-hop password re-encryption and
//!   identifier/authenticator restoration
//! - the realm-miss path answering Access-Reject with the configured
//!   Reply-Message
//! - duplicate suppression toward the upstream
//! - local accounting responses

use radproxy_proto::{attrs, auth, password, AttributeType, Code, Packet};
use radproxy_server::{Config, Proxy};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const CLIENT_SECRET: &[u8] = b"clientsecret";
const SERVER_SECRET: &[u8] = b"serversecret";

fn proxy_config(upstream: SocketAddr, realms: serde_json::Value) -> Config {
    serde_json::from_value(serde_json::json!({
        "listen_udp": "127.0.0.1:0",
        "clients": [
            { "type": "udp", "host": "127.0.0.1", "secret": "clientsecret" }
        ],
        "servers": [
            {
                "name": "upstream1",
                "type": "udp",
                "host": upstream.ip().to_string(),
                "port": upstream.port(),
                "secret": "serversecret"
            }
        ],
        "realms": realms
    }))
    .expect("config deserializes")
}

fn access_request(id: u8, username: &str, plain_password: &[u8]) -> Packet {
    let req_auth = auth::generate_request_authenticator();
    let mut packet = Packet::new(Code::AccessRequest, id, req_auth);
    packet
        .push_attribute(AttributeType::UserName as u8, username.as_bytes())
        .expect("User-Name fits");
    let mut encrypted = plain_password.to_vec();
    encrypted.resize(encrypted.len().next_multiple_of(16).max(16), 0);
    password::encrypt_in_place(&mut encrypted, CLIENT_SECRET, &req_auth).expect("valid length");
    packet
        .push_attribute(AttributeType::UserPassword as u8, &encrypted)
        .expect("User-Password fits");
    packet
}

async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; 4096];
    let (len, src) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("packet within deadline")
        .expect("recv succeeds");
    (Packet::from_datagram(&buf[..len]).expect("valid packet"), src)
}

#[tokio::test]
async fn test_udp_happy_path_roundtrip() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = proxy_config(
        upstream.local_addr().unwrap(),
        serde_json::json!([{ "pattern": "example.org", "servers": ["upstream1"] }]),
    );
    let proxy = Proxy::new(&config).await.unwrap();
    let proxy_addr = proxy.udp_listen_addr().unwrap();
    tokio::spawn(proxy.run(None));

    let nas = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = access_request(7, "alice@example.org", b"correct horse");
    let orig_auth = request.authenticator();
    nas.send_to(request.as_bytes(), proxy_addr).await.unwrap();

    // the upstream sees a re-encrypted request under a fresh authenticator
    let (forwarded, proxy_src) = recv_packet(&upstream).await;
    assert_eq!(forwarded.code(), Some(Code::AccessRequest));
    let forwarded_auth = forwarded.authenticator();
    assert_ne!(forwarded_auth, orig_auth);
    let offset = attrs::find(forwarded.attributes(), AttributeType::UserPassword as u8).unwrap();
    let mut pwd = attrs::value(forwarded.attributes(), offset).to_vec();
    password::decrypt_in_place(&mut pwd, SERVER_SECRET, &forwarded_auth).unwrap();
    assert_eq!(&pwd[..13], b"correct horse");

    // answer as the home server would
    let mut accept = Packet::new(
        Code::AccessAccept,
        forwarded.identifier(),
        forwarded_auth,
    );
    auth::sign_response(accept.as_bytes_mut(), SERVER_SECRET);
    upstream
        .send_to(accept.as_bytes(), proxy_src)
        .await
        .unwrap();

    // the NAS gets its original identifier back, signed under its secret
    let (reply, _) = recv_packet(&nas).await;
    assert_eq!(reply.code(), Some(Code::AccessAccept));
    assert_eq!(reply.identifier(), 7);
    assert!(auth::verify_response(reply.as_bytes(), &orig_auth, CLIENT_SECRET));
}

#[tokio::test]
async fn test_realm_miss_rejects_with_message() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = proxy_config(
        upstream.local_addr().unwrap(),
        serde_json::json!([
            { "pattern": "example.org", "servers": ["upstream1"] },
            { "pattern": "*", "servers": [], "reply_message": "no route" }
        ]),
    );
    let proxy = Proxy::new(&config).await.unwrap();
    let proxy_addr = proxy.udp_listen_addr().unwrap();
    tokio::spawn(proxy.run(None));

    let nas = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = access_request(42, "bob@nowhere", b"whatever");
    let orig_auth = request.authenticator();
    nas.send_to(request.as_bytes(), proxy_addr).await.unwrap();

    let (reply, _) = recv_packet(&nas).await;
    assert_eq!(reply.code(), Some(Code::AccessReject));
    assert_eq!(reply.identifier(), 42);
    assert!(auth::verify_response(reply.as_bytes(), &orig_auth, CLIENT_SECRET));
    let offset = attrs::find(reply.attributes(), AttributeType::ReplyMessage as u8).unwrap();
    assert_eq!(attrs::value(reply.attributes(), offset), b"no route");

    // nothing was forwarded upstream
    let mut buf = [0u8; 64];
    assert!(
        timeout(Duration::from_millis(300), upstream.recv_from(&mut buf))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_duplicate_request_forwarded_once() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = proxy_config(
        upstream.local_addr().unwrap(),
        serde_json::json!([{ "pattern": "example.org", "servers": ["upstream1"] }]),
    );
    let proxy = Proxy::new(&config).await.unwrap();
    let proxy_addr = proxy.udp_listen_addr().unwrap();
    tokio::spawn(proxy.run(None));

    let nas = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = access_request(7, "alice@example.org", b"pw");
    nas.send_to(request.as_bytes(), proxy_addr).await.unwrap();
    nas.send_to(request.as_bytes(), proxy_addr).await.unwrap();

    let (first, _) = recv_packet(&upstream).await;
    assert_eq!(first.code(), Some(Code::AccessRequest));

    // the retransmit is swallowed; nothing else arrives upstream
    let mut buf = [0u8; 4096];
    assert!(
        timeout(Duration::from_millis(500), upstream.recv_from(&mut buf))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_accounting_answered_locally() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = proxy_config(
        upstream.local_addr().unwrap(),
        serde_json::json!([{ "pattern": "example.org", "servers": ["upstream1"] }]),
    );
    config.listen_accounting_udp = Some("127.0.0.1:0".to_string());
    let proxy = Proxy::new(&config).await.unwrap();
    let acct_addr = proxy.acct_listen_addr().unwrap();
    tokio::spawn(proxy.run(None));

    let nas = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let req_auth = auth::generate_request_authenticator();
    let mut request = Packet::new(Code::AccountingRequest, 9, req_auth);
    request
        .push_attribute(AttributeType::UserName as u8, b"alice@example.org")
        .unwrap();
    nas.send_to(request.as_bytes(), acct_addr).await.unwrap();

    let (reply, _) = recv_packet(&nas).await;
    assert_eq!(reply.code(), Some(Code::AccountingResponse));
    assert_eq!(reply.identifier(), 9);
    assert_eq!(reply.length(), 20);
    assert!(auth::verify_response(reply.as_bytes(), &req_auth, CLIENT_SECRET));
}
