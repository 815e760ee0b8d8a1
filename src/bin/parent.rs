//! Parent proxy
//!
//! Listens on `PARENT_PORT` and forwards every HTTP call to the enclave. With
//! `INIT_DATA` set, initializes the enclave once it becomes reachable.

use anyhow::Result;
use enclave_bridge::config::ParentConfig;
use enclave_bridge::logging::{init_tracing, LogFormat};
use enclave_bridge::parent::ParentProxy;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(LogFormat::from_env())?;

    let config = ParentConfig::from_env()?;
    info!(
        env_setup = %config.env_setup,
        port = config.parent_port,
        enclave_host = %config.enclave_host,
        enclave_cid = config.enclave_cid,
        has_init_data = config.init_data.is_some(),
        "Starting parent proxy..."
    );

    let proxy = ParentProxy::bind(&config).await?;
    let handle = proxy.connector().handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            handle.stop();
        }
    });

    proxy.run().await?;
    Ok(())
}
