pub mod admin;
pub mod dns;
pub mod doh;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{GatewayConfig, normalise_path};
use crate::gateway::Gateway;

/// Run every configured listener until Ctrl-C, then flush the tracker.
pub async fn run(config: &GatewayConfig, gateway: Gateway) -> Result<()> {
    let doh_addr: SocketAddr = config
        .server
        .doh_listen
        .parse()
        .context("Invalid DoH listener address")?;
    let doh_path = normalise_path(&config.server.doh_path);
    let tls = match (&config.server.tls_cert_path, &config.server.tls_key_path) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => None,
    };

    #[cfg(unix)]
    admin::reload_on_hangup(gateway.lists().clone());

    let result = tokio::try_join!(
        doh::run_doh_server(doh_addr, doh_path, tls, gateway.clone()),
        async {
            match &config.server.dns_listen {
                Some(addr) => dns::run_dns_server(addr, gateway.clone()).await,
                None => Ok(()),
            }
        },
        async {
            match &config.server.admin_listen {
                Some(addr) => admin::run_admin_server(addr, gateway.clone()).await,
                None => Ok(()),
            }
        },
    );

    gateway.shutdown().await;
    result.map(|_| ())
}

pub(crate) async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received; stopping listeners");
}
