//! Enclave-side server connectors
//!
//! A connector owns a listener, accepts connections and hands every decoded
//! request to a [`RequestHandler`]. Two flavours exist:
//!
//! - **socket**: length-prefixed envelopes over TCP (simulation) or vsock
//!   (Nitro), see [`crate::codec`]
//! - **http**: `GET|POST /<endpoint>` with a JSON body or query parameters
//!
//! Each connection runs on its own task and each dispatch on a blocking worker
//! thread, so a slow handler never stalls the accept loop. A failing
//! connection is logged and answered with an error envelope where possible;
//! it never ends the loop. [`ConnectorHandle::stop`] ends the loop
//! cooperatively while in-flight connections finish on their own.

use crate::codec::{self, Envelope, Reply};
use crate::config::{EnclaveConfig, EnvSetup};
use crate::error::TransportError;
use crate::transport::{Listener, SocketTarget, Stream};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Receives decoded requests. Called on a blocking worker thread.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Envelope) -> Reply;
}

impl<F> RequestHandler for F
where
    F: Fn(Envelope) -> Reply + Send + Sync + 'static,
{
    fn handle(&self, request: Envelope) -> Reply {
        self(request)
    }
}

/// Cooperative stop signal for a running connector
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Default for ConnectorHandle {
    fn default() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

impl ConnectorHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops accepting new connections
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // stores a permit if the loop is not currently waiting
        self.shutdown.notify_one();
    }

    fn start(&self) -> Result<(), TransportError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| TransportError::AlreadyRunning)
    }
}

/// Options of the framed socket connector
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
    /// Serve successive frames on one connection until EOF
    pub keep_alive: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            read_timeout: crate::config::DEFAULT_READ_TIMEOUT,
            max_frame_bytes: crate::config::DEFAULT_MAX_FRAME_BYTES,
            keep_alive: false,
        }
    }
}

/// Framed envelope server over TCP or vsock
pub struct SocketConnector {
    listener: Listener,
    target: SocketTarget,
    options: SocketOptions,
    handle: ConnectorHandle,
}

impl SocketConnector {
    pub async fn bind(target: SocketTarget, options: SocketOptions) -> Result<Self, TransportError> {
        let listener = Listener::bind(&target).await?;
        Ok(Self {
            listener,
            target,
            options,
            handle: ConnectorHandle::default(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ConnectorHandle {
        self.handle.clone()
    }

    pub async fn run(mut self, handler: Arc<dyn RequestHandler>) -> Result<(), TransportError> {
        self.handle.start()?;
        info!(
            target = %self.target,
            keep_alive = self.options.keep_alive,
            "Socket connector listening"
        );

        while self.handle.is_running() {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.handle.shutdown.notified() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&handler);
                    let options = self.options.clone();
                    tokio::spawn(async move {
                        serve_socket_connection(stream, peer, handler, options).await;
                    });
                }
                Err(e) => {
                    // e.g. EMFILE; back off instead of spinning
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        self.handle.running.store(false, Ordering::SeqCst);
        info!(target = %self.target, "Socket connector stopped");
        Ok(())
    }
}

async fn serve_socket_connection(
    stream: Stream,
    peer: String,
    handler: Arc<dyn RequestHandler>,
    options: SocketOptions,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    loop {
        let request = match codec::read_frame(
            &mut reader,
            options.read_timeout,
            Some(options.max_frame_bytes),
        )
        .await
        {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to read request frame");
                let reply = Envelope::response("", Reply::error(400, e.to_string()));
                if let Err(e) = send_frame(&mut writer, &reply, options.read_timeout).await {
                    debug!(peer = %peer, error = %e, "Could not deliver error reply");
                }
                break;
            }
        };

        let endpoint = request.endpoint.clone();
        debug!(peer = %peer, endpoint = %endpoint, "Request received");
        let reply = dispatch(Arc::clone(&handler), request).await;
        let response = Envelope::response(endpoint, reply);

        if let Err(e) = send_frame(&mut writer, &response, options.read_timeout).await {
            error!(peer = %peer, error = %e, "Failed to write response frame");
            break;
        }
        if !options.keep_alive {
            break;
        }
    }
}

/// Writes one frame; a peer that stops reading fails the write after `timeout`
async fn send_frame<W>(
    writer: &mut W,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, codec::write_frame(writer, envelope))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

/// Runs the handler on a blocking worker; a panicking handler becomes a 500
async fn dispatch(handler: Arc<dyn RequestHandler>, request: Envelope) -> Reply {
    let endpoint = request.endpoint.clone();
    match tokio::task::spawn_blocking(move || handler.handle(request)).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(endpoint = %endpoint, error = %e, "Handler failed");
            Reply::error(500, "internal error while handling request")
        }
    }
}

/// HTTP server exposing every endpoint under a catch-all route
pub struct HttpConnector {
    listener: TcpListener,
    read_timeout: Duration,
    max_body_bytes: usize,
    handle: ConnectorHandle,
}

impl HttpConnector {
    pub async fn bind(
        addr: &str,
        read_timeout: Duration,
        max_body_bytes: usize,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            read_timeout,
            max_body_bytes,
            handle: ConnectorHandle::default(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    pub fn handle(&self) -> ConnectorHandle {
        self.handle.clone()
    }

    pub async fn run(self, handler: Arc<dyn RequestHandler>) -> Result<(), TransportError> {
        self.handle.start()?;
        info!(address = ?self.local_addr(), "HTTP connector listening");

        let limits = HttpLimits {
            read_timeout: self.read_timeout,
            max_body_bytes: self.max_body_bytes,
        };

        while self.handle.is_running() {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.handle.shutdown.notified() => break,
            };

            let (stream, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    handle_http_request(Arc::clone(&handler), limits, req)
                });

                // slow or stalled header senders are cut off like slow bodies
                if let Err(e) = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(limits.read_timeout)
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    error!(remote_addr = %remote_addr, error = %e, "Connection error");
                }
            });
        }

        self.handle.running.store(false, Ordering::SeqCst);
        info!("HTTP connector stopped");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct HttpLimits {
    read_timeout: Duration,
    max_body_bytes: usize,
}

async fn handle_http_request(
    handler: Arc<dyn RequestHandler>,
    limits: HttpLimits,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let endpoint = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    debug!(method = %req.method(), endpoint = %endpoint, "HTTP request received");

    let body = Limited::new(req.into_body(), limits.max_body_bytes).collect();
    let body = match tokio::time::timeout(limits.read_timeout, body).await {
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(e)) => {
            warn!(endpoint = %endpoint, error = %e, "Failed to read request body");
            return Ok(json_response(&Reply::error(400, format!("cannot read body: {}", e))));
        }
        Err(_) => {
            return Ok(json_response(&Reply::error(
                408,
                format!("request body not received within {:?}", limits.read_timeout),
            )))
        }
    };

    let data = match request_data(&body, query.as_deref()) {
        Ok(data) => data,
        Err(message) => return Ok(json_response(&Reply::error(400, message))),
    };

    let reply = dispatch(handler, Envelope::request(endpoint, data)).await;
    Ok(json_response(&reply))
}

/// JSON body if present, otherwise the query parameters, otherwise `{}`
pub(crate) fn request_data(body: &[u8], query: Option<&str>) -> Result<Value, String> {
    if body.iter().any(|b| !b.is_ascii_whitespace()) {
        return serde_json::from_slice(body).map_err(|e| format!("request body is not JSON: {}", e));
    }

    let params: Map<String, Value> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect()
        })
        .unwrap_or_default();
    Ok(Value::Object(params))
}

pub(crate) fn json_response(reply: &Reply) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&reply.body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() =
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// The connector an enclave process serves with, chosen at startup
pub enum ServerConnector {
    Socket(SocketConnector),
    Http(HttpConnector),
}

impl ServerConnector {
    /// Nitro: framed vsock. Simulation: HTTP, or framed TCP with `USE_RAW_SOCKET`.
    pub async fn from_config(config: &EnclaveConfig) -> Result<Self, TransportError> {
        let options = SocketOptions {
            read_timeout: config.read_timeout,
            max_frame_bytes: config.max_frame_bytes,
            keep_alive: false,
        };

        match (config.env_setup, config.use_raw_socket) {
            (EnvSetup::Nitro, _) => Ok(ServerConnector::Socket(
                SocketConnector::bind(SocketTarget::vsock_any(config.vsock_port), options).await?,
            )),
            (EnvSetup::Sim, true) => Ok(ServerConnector::Socket(
                SocketConnector::bind(SocketTarget::tcp("0.0.0.0", config.enclave_port), options)
                    .await?,
            )),
            (EnvSetup::Sim, false) => Ok(ServerConnector::Http(
                HttpConnector::bind(
                    &format!("0.0.0.0:{}", config.enclave_port),
                    config.read_timeout,
                    config.max_frame_bytes,
                )
                .await?,
            )),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerConnector::Socket(c) => c.local_addr(),
            ServerConnector::Http(c) => c.local_addr(),
        }
    }

    pub fn handle(&self) -> ConnectorHandle {
        match self {
            ServerConnector::Socket(c) => c.handle(),
            ServerConnector::Http(c) => c.handle(),
        }
    }

    pub async fn run(self, handler: Arc<dyn RequestHandler>) -> Result<(), TransportError> {
        match self {
            ServerConnector::Socket(c) => c.run(handler).await,
            ServerConnector::Http(c) => c.run(handler).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_data_prefers_json_body() {
        let data = request_data(br#"{"a":1}"#, Some("b=2")).unwrap();
        assert_eq!(data, json!({"a": 1}));
    }

    #[test]
    fn test_request_data_from_query() {
        let data = request_data(b"", Some("nonce=abc%20123&x=1")).unwrap();
        assert_eq!(data, json!({"nonce": "abc 123", "x": "1"}));
    }

    #[test]
    fn test_request_data_defaults_to_empty_object() {
        assert_eq!(request_data(b"  \n", None).unwrap(), json!({}));
    }

    #[test]
    fn test_request_data_rejects_non_json() {
        assert!(request_data(b"not json", None).is_err());
    }

    #[test]
    fn test_json_response_status() {
        let response = json_response(&Reply::error(409, "already finalized"));
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_handle_rejects_double_start() {
        let handle = ConnectorHandle::default();
        handle.start().unwrap();
        assert!(matches!(handle.start(), Err(TransportError::AlreadyRunning)));
        handle.stop();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_send_frame_times_out_when_peer_stops_reading() {
        // the peer half is kept alive but never read
        let (mut writer, _peer) = tokio::io::duplex(64);
        let envelope = Envelope::request("/status", json!({"padding": "x".repeat(4096)}));

        let result = send_frame(&mut writer, &envelope, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_http_connection_with_partial_headers_is_closed() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let connector = HttpConnector::bind("127.0.0.1:0", Duration::from_millis(300), 1024)
            .await
            .unwrap();
        let addr = connector.local_addr().unwrap();
        let handle = connector.handle();
        tokio::spawn(connector.run(Arc::new(|req: Envelope| Reply::ok(req.data))));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /status HTTP/1.1\r\nHost: x\r\n")
            .await
            .unwrap();

        // the server must hang up on its own; a reset counts as hanging up
        let mut buf = Vec::new();
        let closed =
            tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
        assert!(closed.is_ok(), "connection still open after header timeout");

        handle.stop();
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let connector = SocketConnector::bind(SocketTarget::tcp("127.0.0.1", 0), SocketOptions::default())
            .await
            .unwrap();
        let handle = connector.handle();
        let task = tokio::spawn(connector.run(Arc::new(|req: Envelope| Reply::ok(req.data))));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_running());
        handle.stop();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!handle.is_running());
    }
}
