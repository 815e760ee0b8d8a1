mod common;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use enclave_bridge::client::{EnclaveClient, SimulationClient, SocketClient};
use enclave_bridge::codec::Envelope;
use enclave_bridge::connector::{HttpConnector, SocketConnector, SocketOptions};
use enclave_bridge::parent::{initialize_enclave, Forwarder};
use enclave_bridge::transport::SocketTarget;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// parent HTTP front-end -> framed TCP -> enclave dispatcher
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_forwards_and_initializes() {
    let enclave = SocketConnector::bind(SocketTarget::tcp("127.0.0.1", 0), SocketOptions::default())
        .await
        .unwrap();
    let enclave_addr = enclave.local_addr().unwrap();
    let enclave_handle = enclave.handle();
    tokio::spawn(enclave.run(common::fibonacci_dispatcher()));

    let to_enclave = EnclaveClient::Socket(SocketClient::new(
        SocketTarget::Tcp(enclave_addr.to_string()),
        Duration::from_secs(5),
        1024 * 1024,
    ));

    let init = initialize_enclave(&to_enclave, &common::word(30), 5, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(init.status, 200);

    let front = HttpConnector::bind("127.0.0.1:0", Duration::from_secs(5), 1024 * 1024)
        .await
        .unwrap();
    let front_port = front.local_addr().unwrap().port();
    let front_handle = front.handle();
    tokio::spawn(front.run(Arc::new(Forwarder::new(to_enclave))));

    let user = SimulationClient::new("127.0.0.1", front_port, Duration::from_secs(5));
    let status = user
        .send_request(&Envelope::request("/status", json!({})))
        .await
        .unwrap();
    assert_eq!(status.status, Some(200));
    assert_eq!(status.data["computation_status"], "completed");
    let result = BASE64.decode(status.data["result"].as_str().unwrap()).unwrap();
    assert_eq!(&result[28..], &832_040u32.to_be_bytes());

    // enclave error statuses are relayed unchanged
    let conflict = user
        .send_request(&Envelope::request("/initialize", json!({"data": ""})))
        .await
        .unwrap();
    assert_eq!(conflict.status, Some(409));

    front_handle.stop();
    enclave_handle.stop();
}
