use std::future::Future;
use std::io;
use std::net::SocketAddr;

use sqlchat_core::settings::ProxySettings;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::proxy::{router, ProxyState};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind proxy on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("proxy server stopped unexpectedly: {0}")]
    Serve(#[source] io::Error),
}

pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Binds `settings.bind_addr` and serves the proxy until `shutdown` resolves.
pub async fn serve(
    settings: ProxySettings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let listener = bind(&settings.bind_addr).await?;
    serve_on(listener, settings, shutdown).await
}

pub async fn serve_on(
    listener: TcpListener,
    settings: ProxySettings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let local_addr: Option<SocketAddr> = listener.local_addr().ok();
    if settings.api_key.is_none() {
        tracing::warn!("TEXT2SQL_API_KEY is not set; generation requests will fail");
    }
    tracing::info!(
        addr = ?local_addr,
        upstream = %settings.base_url,
        "text2sql proxy listening"
    );

    axum::serve(listener, router(ProxyState::new(settings)))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)?;

    tracing::info!("text2sql proxy stopped");
    Ok(())
}
