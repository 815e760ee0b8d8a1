//! Enclave server
//!
//! Serves the dispatcher on the connector selected by `ENV_SETUP`:
//!
//! - **NITRO**: framed envelopes on vsock port `VSOCK_PORT`, keys and
//!   attestation from `/dev/nsm`
//! - **SIM** (default): HTTP on `ENCLAVE_PORT`, or framed TCP with
//!   `USE_RAW_SOCKET=1`, backed by the mock KMS

use anyhow::Result;
use enclave_bridge::apps::FibonacciApp;
use enclave_bridge::config::EnclaveConfig;
use enclave_bridge::connector::{RequestHandler, ServerConnector};
use enclave_bridge::enclave::{Dispatcher, EnclaveContext};
use enclave_bridge::kms::create_kms_service;
use enclave_bridge::logging::{init_tracing, LogFormat};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(LogFormat::from_env())?;

    let config = EnclaveConfig::from_env()?;
    info!(
        env_setup = %config.env_setup,
        raw_socket = config.use_raw_socket,
        debug = config.debug,
        "Starting enclave server..."
    );

    let kms = create_kms_service(&config.kms)?;
    let ctx = Arc::new(EnclaveContext::new(kms, config.debug));
    let dispatcher: Arc<dyn RequestHandler> =
        Arc::new(Dispatcher::new(ctx, Arc::new(FibonacciApp)));

    let connector = ServerConnector::from_config(&config).await?;
    let handle = connector.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            handle.stop();
        }
    });

    connector.run(dispatcher).await?;
    Ok(())
}
