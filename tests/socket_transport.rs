mod common;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use enclave_bridge::client::SocketClient;
use enclave_bridge::codec::{self, Envelope};
use enclave_bridge::connector::{ConnectorHandle, SocketConnector, SocketOptions};
use enclave_bridge::kms::{eth, EthSignature};
use enclave_bridge::transport::SocketTarget;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn start() -> (SocketClient, ConnectorHandle) {
    let connector = SocketConnector::bind(SocketTarget::tcp("127.0.0.1", 0), SocketOptions::default())
        .await
        .unwrap();
    let addr = connector.local_addr().unwrap();
    let handle = connector.handle();
    tokio::spawn(connector.run(common::fibonacci_dispatcher()));

    let client = SocketClient::new(
        SocketTarget::Tcp(addr.to_string()),
        Duration::from_secs(5),
        1024 * 1024,
    );
    (client, handle)
}

#[tokio::test]
async fn test_fibonacci_scenario_over_socket() {
    let (client, handle) = start().await;

    let status = client
        .send_request(&Envelope::request("/status", json!({})))
        .await
        .unwrap();
    assert_eq!(status.data["lifecycle"], "uninitialized");

    let init = client
        .send_request(&Envelope::request(
            "/initialize",
            json!({ "data": BASE64.encode(common::word(30)) }),
        ))
        .await
        .unwrap();
    assert_eq!(init.status, Some(200));

    let status = client
        .send_request(&Envelope::request("/status", json!({})))
        .await
        .unwrap();
    assert_eq!(status.data["computation_status"], "completed");
    assert_eq!(status.data["lifecycle"], "finalized");

    let mut expected = [0u8; 32];
    expected[28..].copy_from_slice(&832_040u32.to_be_bytes());
    let result = BASE64
        .decode(status.data["result"].as_str().unwrap())
        .unwrap();
    assert_eq!(result, expected);

    let key = client
        .send_request(&Envelope::request("/public-key", json!({})))
        .await
        .unwrap();
    let signature = BASE64
        .decode(status.data["signature"].as_str().unwrap())
        .unwrap();
    let signature = EthSignature::from_slice(&signature).unwrap();
    let signer = eth::recover(&result, &signature).unwrap();
    assert_eq!(key.data["eth_address"], eth::address(&signer));

    // finalized results never change
    let again = client
        .send_request(&Envelope::request("/settlement", json!({})))
        .await
        .unwrap();
    assert_eq!(again.data["result"], status.data["result"]);
    assert_eq!(again.data["signature"], status.data["signature"]);

    handle.stop();
}

#[tokio::test]
async fn test_malformed_frame_gets_error_envelope() {
    let connector = SocketConnector::bind(SocketTarget::tcp("127.0.0.1", 0), SocketOptions::default())
        .await
        .unwrap();
    let addr = connector.local_addr().unwrap();
    let handle = connector.handle();
    tokio::spawn(connector.run(common::fibonacci_dispatcher()));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let garbage = b"not an envelope";
    stream
        .write_all(&(garbage.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(garbage).await.unwrap();

    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.unwrap();
    let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
    stream.read_exact(&mut body).await.unwrap();
    let reply = codec::decode_payload(&body).unwrap();
    assert_eq!(reply.status, Some(400));
    assert_eq!(reply.data["status"], "error");

    // the accept loop survives the bad connection
    let client = SocketClient::new(
        SocketTarget::Tcp(addr.to_string()),
        Duration::from_secs(5),
        1024 * 1024,
    );
    let health = client
        .send_request(&Envelope::request("/health", json!({})))
        .await
        .unwrap();
    assert_eq!(health.data["status"], "ok");

    handle.stop();
}

#[tokio::test]
async fn test_keep_alive_serves_multiple_frames() {
    let connector = SocketConnector::bind(
        SocketTarget::tcp("127.0.0.1", 0),
        SocketOptions {
            keep_alive: true,
            ..SocketOptions::default()
        },
    )
    .await
    .unwrap();
    let addr = connector.local_addr().unwrap();
    let handle = connector.handle();
    tokio::spawn(connector.run(common::fibonacci_dispatcher()));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    for endpoint in ["/health", "/status", "/fibonacci/12"] {
        codec::write_frame(&mut stream, &Envelope::request(endpoint, json!({})))
            .await
            .unwrap();
        let reply = codec::read_frame(&mut stream, Duration::from_secs(5), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.endpoint, endpoint);
        assert_eq!(reply.status, Some(200));
    }

    handle.stop();
}
