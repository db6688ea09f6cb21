//! TLS for the router listeners and the worker's tunnel dial.
//!
//! The router terminates TLS itself when `ssl_cert` and `ssl_key` are both
//! configured: [`serve`] runs either listener over plain TCP or through the
//! rustls acceptor from `axum-server`. The worker side uses `native-tls`, the
//! same backend `tokio-tungstenite` is built with, and trusts the configured
//! certificate as an extra root so a self-signed router certificate works.

use std::io;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::Connector;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("ssl_key is set without ssl_cert")]
    KeyWithoutCert,
    #[error("ssl_cert is set without ssl_key")]
    CertWithoutKey,
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to load certificate {path}: {source}")]
    Certificate { path: String, source: io::Error },
    #[error("invalid TLS material: {0}")]
    NativeTls(#[from] native_tls::Error),
}

impl TlsError {
    /// Mistakes in which options are set, as opposed to unreadable files.
    pub fn is_config(&self) -> bool {
        matches!(self, TlsError::KeyWithoutCert | TlsError::CertWithoutKey)
    }
}

/// Rustls config for the router listeners, or `None` for plain TCP.
///
/// Both paths must be set together.
pub async fn server_config(
    cert: Option<&str>,
    key: Option<&str>,
) -> Result<Option<RustlsConfig>, TlsError> {
    match (cert, key) {
        (None, None) => Ok(None),
        (Some(_), None) => Err(TlsError::CertWithoutKey),
        (None, Some(_)) => Err(TlsError::KeyWithoutCert),
        (Some(cert), Some(key)) => RustlsConfig::from_pem_file(cert, key)
            .await
            .map(Some)
            .map_err(|source| TlsError::Certificate {
                path: cert.to_string(),
                source,
            }),
    }
}

/// Connector for dialing the router, or `None` to use the system defaults.
pub fn connector(cert: Option<&str>, key: Option<&str>) -> Result<Option<Connector>, TlsError> {
    let Some(cert_path) = cert else {
        return match key {
            Some(_) => Err(TlsError::KeyWithoutCert),
            None => Ok(None),
        };
    };

    let cert_pem = read(cert_path)?;
    let mut builder = native_tls::TlsConnector::builder();
    builder.add_root_certificate(native_tls::Certificate::from_pem(&cert_pem)?);
    if let Some(key_path) = key {
        let key_pem = read(key_path)?;
        builder.identity(native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)?);
    }
    Ok(Some(Connector::NativeTls(builder.build()?)))
}

fn read(path: &str) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_string(),
        source,
    })
}

/// Serve `app` on `listener` until `stop` turns true. Open connections are
/// drained before returning.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    tls: Option<RustlsConfig>,
    mut stop: watch::Receiver<bool>,
) -> io::Result<()> {
    let Some(tls) = tls else {
        return axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|stop| *stop).await;
            })
            .await;
    };

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        let _ = stop.wait_for(|stop| *stop).await;
        debug!("TLS listener draining");
        shutdown.graceful_shutdown(None);
    });
    axum_server::from_tcp_rustls(listener.into_std()?, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use axum::routing::get;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    use super::*;

    pub(crate) const CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/router-cert.pem");
    pub(crate) const KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/router-key.pem");

    async fn echo(ws: axum::extract::ws::WebSocketUpgrade) -> axum::response::Response {
        ws.on_upgrade(|mut socket| async move {
            while let Some(Ok(msg)) = socket.recv().await {
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
        })
    }

    #[tokio::test]
    async fn half_configured_pairs_are_rejected() {
        let err = server_config(Some(CERT), None).await.unwrap_err();
        assert!(matches!(err, TlsError::CertWithoutKey));
        assert!(err.is_config());
        let err = server_config(None, Some(KEY)).await.unwrap_err();
        assert!(matches!(err, TlsError::KeyWithoutCert));
        assert!(server_config(None, None).await.unwrap().is_none());

        assert!(matches!(connector(None, Some(KEY)), Err(TlsError::KeyWithoutCert)));
        assert!(connector(None, None).unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_files_are_not_config_errors() {
        let err = server_config(Some("/nonexistent/cert.pem"), Some(KEY))
            .await
            .unwrap_err();
        assert!(matches!(err, TlsError::Certificate { .. }));
        assert!(!err.is_config());

        let err = connector(Some("/nonexistent/cert.pem"), None).err().unwrap();
        assert!(matches!(err, TlsError::Read { .. }));
    }

    #[tokio::test]
    async fn websocket_round_trips_over_tls() {
        let tls = server_config(Some(CERT), Some(KEY)).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let app = Router::new().route("/echo", get(echo));
        let server = tokio::spawn(serve(listener, app, tls, stop_rx));

        let (mut ws, _) = tokio_tungstenite::connect_async_tls_with_config(
            format!("wss://{addr}/echo"),
            None,
            false,
            connector(Some(CERT), None).unwrap(),
        )
        .await
        .unwrap();
        ws.send(Message::text("over-tls")).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::text("over-tls"));
        ws.close(None).await.unwrap();
        drop(ws);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn plain_dial_to_tls_listener_fails() {
        let tls = server_config(Some(CERT), Some(KEY)).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let app = Router::new().route("/echo", get(echo));
        tokio::spawn(serve(listener, app, tls, stop_rx));

        let attempt = tokio::time::timeout(
            Duration::from_secs(5),
            tokio_tungstenite::connect_async(format!("ws://{addr}/echo")),
        )
        .await
        .unwrap();
        assert!(attempt.is_err());
    }
}
