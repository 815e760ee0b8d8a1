//! Parent-side HTTP proxy
//!
//! The parent instance is the only thing that can reach the enclave. It runs
//! an HTTP server on `PARENT_PORT`, turns every call into an envelope, sends
//! it through an [`EnclaveClient`] and relays the enclave's status and body.

use crate::client::EnclaveClient;
use crate::codec::{Envelope, Reply};
use crate::config::ParentConfig;
use crate::connector::{HttpConnector, RequestHandler};
use crate::error::TransportError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Probes before giving up on a freshly started enclave
pub const WAIT_RETRIES: u32 = 30;
pub const WAIT_INTERVAL: Duration = Duration::from_secs(2);

/// Forwards dispatched requests to the enclave.
///
/// Connectors call handlers on blocking worker threads, so each request
/// blocks on the async client through the runtime handle.
pub struct Forwarder {
    client: EnclaveClient,
    runtime: Handle,
}

impl Forwarder {
    /// Must be called from within a tokio runtime
    pub fn new(client: EnclaveClient) -> Self {
        Self {
            client,
            runtime: Handle::current(),
        }
    }
}

impl RequestHandler for Forwarder {
    fn handle(&self, request: Envelope) -> Reply {
        let endpoint = request.endpoint.clone();
        match self.runtime.block_on(self.client.send_request(&request)) {
            Ok(response) => {
                let reply = response.into_reply();
                debug!(endpoint = %endpoint, status = reply.status, "Relayed enclave reply");
                reply
            }
            Err(TransportError::Timeout(after)) => {
                warn!(endpoint = %endpoint, ?after, "Enclave did not answer in time");
                Reply::error(504, format!("enclave did not answer within {:?}", after))
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Failed to reach enclave");
                Reply::error(502, format!("failed to reach enclave: {}", e))
            }
        }
    }
}

/// Sends `INIT_DATA` to `/initialize` once the enclave answers probes
pub async fn initialize_enclave(
    client: &EnclaveClient,
    init_data: &[u8],
    retries: u32,
    interval: Duration,
) -> Result<Reply, TransportError> {
    if !client.wait_for_enclave(retries, interval).await {
        return Err(TransportError::Unreachable(retries));
    }

    let request = Envelope::request("/initialize", json!({ "data": BASE64.encode(init_data) }));
    let reply = client.send_request(&request).await?.into_reply();
    if reply.is_success() {
        info!(input_len = init_data.len(), "Enclave initialized");
    } else {
        warn!(status = reply.status, body = %reply.body, "Enclave rejected init data");
    }
    Ok(reply)
}

/// The parent proxy and its HTTP front-end
pub struct ParentProxy {
    connector: HttpConnector,
    client: EnclaveClient,
    init_data: Option<Vec<u8>>,
}

impl ParentProxy {
    pub async fn bind(config: &ParentConfig) -> Result<Self, TransportError> {
        let connector = HttpConnector::bind(
            &format!("0.0.0.0:{}", config.parent_port),
            config.request_timeout,
            config.max_frame_bytes,
        )
        .await?;

        Ok(Self {
            connector,
            client: EnclaveClient::from_config(config),
            init_data: config.init_data.clone(),
        })
    }

    pub fn connector(&self) -> &HttpConnector {
        &self.connector
    }

    /// Serves until stopped. Initialization runs alongside the front-end.
    pub async fn run(self) -> Result<(), TransportError> {
        if let Some(init_data) = self.init_data {
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    initialize_enclave(&client, &init_data, WAIT_RETRIES, WAIT_INTERVAL).await
                {
                    error!(error = %e, "Enclave initialization failed");
                }
            });
        }

        let forwarder: Arc<dyn RequestHandler> = Arc::new(Forwarder::new(self.client));
        self.connector.run(forwarder).await
    }
}
