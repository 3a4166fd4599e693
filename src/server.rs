//! TLS listener with health endpoints
//!
//! The listener presents whatever [`CertificateHolder`] holds at handshake
//! time, so CA rotations reach new connections without a restart and
//! existing connections keep the certificate they negotiated.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use rustls::ServerConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::serving::CertificateHolder;
use crate::{Error, Result};

/// Time in-flight requests get to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Health routes
///
/// `/healthz` always answers; `/readyz` answers 503 until a serving
/// certificate is loaded.
pub fn router(holder: Arc<CertificateHolder>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(holder)
}

async fn readyz(State(holder): State<Arc<CertificateHolder>>) -> (StatusCode, &'static str) {
    if holder.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "serving certificate not loaded")
    }
}

/// rustls configuration resolving the certificate from `holder` per handshake
pub fn tls_config(holder: Arc<CertificateHolder>) -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::internal("build TLS config", e))?
        .with_no_client_auth()
        .with_cert_resolver(holder);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Serve the health routes over TLS on `addr` until `cancel` fires
pub async fn serve(
    addr: SocketAddr,
    holder: Arc<CertificateHolder>,
    cancel: CancellationToken,
) -> Result<()> {
    let tls = RustlsConfig::from_config(Arc::new(tls_config(holder.clone())?));
    let handle = axum_server::Handle::new();

    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(addr = %addr, "starting TLS listener");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(router(holder).into_make_service())
        .await
        .map_err(|e| Error::internal("TLS listener", e))?;

    info!("TLS listener stopped");
    Ok(())
}
