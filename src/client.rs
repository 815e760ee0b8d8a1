//! Parent-side clients for reaching the enclave

use crate::codec::{self, Envelope};
use crate::config::{EnvSetup, ParentConfig};
use crate::error::{FramingError, TransportError};
use crate::transport::{SocketTarget, Stream};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Talks HTTP to a simulated enclave
#[derive(Debug, Clone)]
pub struct SimulationClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl SimulationClient {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// POSTs `request.data` to `/<endpoint>` and wraps the reply
    pub async fn send_request(&self, request: &Envelope) -> Result<Envelope, TransportError> {
        let body = serde_json::to_vec(&request.data)
            .map_err(|e| FramingError::Malformed(format!("cannot serialize data: {}", e)))?;
        let path = normalize_endpoint(&request.endpoint);

        let exchange = self.exchange(Method::POST, &path, Some(body));
        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        let data = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok(Envelope {
            endpoint: path,
            data,
            status: Some(status),
        })
    }

    /// True when `GET /health` answers 200
    pub async fn probe(&self) -> bool {
        let exchange = self.exchange(Method::GET, "/health", None);
        matches!(
            tokio::time::timeout(self.timeout, exchange).await,
            Ok(Ok((200, _)))
        )
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(u16, Bytes), TransportError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| TransportError::Http(format!("handshake failed: {}", e)))?;

        let host = self.host.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(host = %host, error = %e, "Client connection closed with error");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, format!("{}:{}", self.host, self.port));
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| TransportError::Http(format!("request failed: {}", e)))?;

        let status = response.status().as_u16();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Http(format!("cannot read response: {}", e)))?
            .to_bytes();
        Ok((status, bytes))
    }
}

/// One framed exchange per request over TCP or vsock
#[derive(Debug, Clone)]
pub struct SocketClient {
    target: SocketTarget,
    timeout: Duration,
    max_frame_bytes: usize,
}

impl SocketClient {
    pub fn new(target: SocketTarget, timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            target,
            timeout,
            max_frame_bytes,
        }
    }

    pub async fn send_request(&self, request: &Envelope) -> Result<Envelope, TransportError> {
        let exchange = async {
            let mut stream = Stream::connect(&self.target).await?;
            codec::write_frame(&mut stream, request).await?;
            codec::read_frame(&mut stream, self.timeout, Some(self.max_frame_bytes))
                .await?
                .ok_or_else(|| {
                    TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "enclave closed the connection without replying",
                    ))
                })
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }

    /// True when a connection can be opened
    pub async fn probe(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, Stream::connect(&self.target)).await,
            Ok(Ok(_))
        )
    }
}

/// The client a parent uses, chosen at startup
#[derive(Debug, Clone)]
pub enum EnclaveClient {
    Simulation(SimulationClient),
    Socket(SocketClient),
}

impl EnclaveClient {
    /// Nitro: vsock to `ENCLAVE_CID`. Simulation: HTTP, or framed TCP with `USE_RAW_SOCKET`.
    pub fn from_config(config: &ParentConfig) -> Self {
        match (config.env_setup, config.use_raw_socket) {
            (EnvSetup::Nitro, _) => EnclaveClient::Socket(SocketClient::new(
                SocketTarget::Vsock {
                    cid: config.enclave_cid,
                    port: config.vsock_port,
                },
                config.request_timeout,
                config.max_frame_bytes,
            )),
            (EnvSetup::Sim, true) => EnclaveClient::Socket(SocketClient::new(
                SocketTarget::tcp(&config.enclave_host, config.enclave_port),
                config.request_timeout,
                config.max_frame_bytes,
            )),
            (EnvSetup::Sim, false) => EnclaveClient::Simulation(SimulationClient::new(
                config.enclave_host.clone(),
                config.enclave_port,
                config.request_timeout,
            )),
        }
    }

    pub async fn send_request(&self, request: &Envelope) -> Result<Envelope, TransportError> {
        match self {
            EnclaveClient::Simulation(client) => client.send_request(request).await,
            EnclaveClient::Socket(client) => client.send_request(request).await,
        }
    }

    /// Polls until the enclave accepts requests; false after `max_retries` failed probes
    pub async fn wait_for_enclave(&self, max_retries: u32, interval: Duration) -> bool {
        for attempt in 1..=max_retries {
            let ready = match self {
                EnclaveClient::Simulation(client) => client.probe().await,
                EnclaveClient::Socket(client) => client.probe().await,
            };
            if ready {
                info!(attempt, "Enclave is reachable");
                return true;
            }
            debug!(attempt, max_retries, "Enclave not reachable yet");
            if attempt < max_retries {
                tokio::time::sleep(interval).await;
            }
        }
        warn!(max_retries, "Gave up waiting for the enclave");
        false
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{}", endpoint)
    }
}
