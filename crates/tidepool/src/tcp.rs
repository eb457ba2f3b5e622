//! TCP/TLS connection factory.
//!
//! A ready-made [`ConnectionFactory`] for connectors that speak their wire
//! protocol over a raw socket. It opens the transport and nothing more: the
//! protocol handshake and authentication belong to the connector.
//!
//! ```text
//! acquire(target)
//!   → TcpConnectionFactory::connect()
//!     → TCP connect (with timeout) → [TLS handshake per target.encryption]
//!       → TcpConnection handed to the borrower as AsyncRead + AsyncWrite
//! ```

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tidepool_core::{Encryption, TargetConfig};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::factory::{BoxFuture, ConnectionFactory};

// ── TcpConnection ────────────────────────────────────────────────────

/// A pooled socket: plain TCP or TLS over TCP.
pub enum TcpConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl TcpConnection {
    pub fn is_tls(&self) -> bool {
        matches!(self, TcpConnection::Tls(_))
    }

    /// The underlying TCP stream, beneath any TLS layer.
    pub fn tcp_stream(&self) -> &TcpStream {
        match self {
            TcpConnection::Plain(stream) => stream,
            TcpConnection::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("tls", &self.is_tls())
            .field("peer", &self.tcp_stream().peer_addr().ok())
            .finish()
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpConnection::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            TcpConnection::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TcpConnection::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            TcpConnection::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpConnection::Plain(stream) => Pin::new(stream).poll_flush(cx),
            TcpConnection::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpConnection::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            TcpConnection::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Peek one byte without blocking. Nothing to read means the peer is
/// quiet but connected; EOF or an error means it is gone.
async fn socket_alive(stream: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    std::future::poll_fn(|cx| {
        let mut buf = ReadBuf::new(&mut byte);
        match stream.poll_peek(cx, &mut buf) {
            Poll::Pending => Poll::Ready(true),
            Poll::Ready(Ok(n)) => Poll::Ready(n > 0),
            Poll::Ready(Err(_)) => Poll::Ready(false),
        }
    })
    .await
}

// ── TlsConfig ────────────────────────────────────────────────────────

/// Client-side TLS settings shared by every TLS connection the factory opens.
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
    /// Whether server certificates are verified. `strict` targets refuse
    /// configurations that do not.
    pub verified: bool,
}

impl TlsConfig {
    /// Verify servers against the Mozilla root store.
    pub fn with_webpki_roots() -> Result<Self, String> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("tls protocol version error: {e}"))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(config),
            verified: true,
        })
    }

    /// Accept any server certificate. For self-signed development servers
    /// only; `strict` targets reject it.
    pub fn insecure_no_verify() -> Result<Self, String> {
        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("tls protocol version error: {e}"))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
        .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(config),
            verified: false,
        })
    }
}

/// A caller-built configuration is assumed to verify certificates.
impl From<Arc<rustls::ClientConfig>> for TlsConfig {
    fn from(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            client_config,
            verified: true,
        }
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("verified", &self.verified)
            .finish_non_exhaustive()
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

// ── TcpConnectionFactory ─────────────────────────────────────────────

/// Factory opening TCP (optionally TLS) connections to each target.
#[derive(Debug)]
pub struct TcpConnectionFactory {
    /// Bound on the TCP connect plus the TLS handshake, each.
    connect_timeout: Duration,
    tls: Option<TlsConfig>,
}

impl TcpConnectionFactory {
    /// Plain TCP only. Targets with `required` or `strict` encryption fail.
    pub fn plain(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            tls: None,
        }
    }

    pub fn with_tls(connect_timeout: Duration, tls: TlsConfig) -> Self {
        Self {
            connect_timeout,
            tls: Some(tls),
        }
    }

    /// Pick the TLS configuration for a target's encryption mode, or `None`
    /// for plain TCP.
    fn tls_for(&self, target: &TargetConfig) -> Result<Option<&TlsConfig>, String> {
        match (target.encryption, &self.tls) {
            (Encryption::Disabled, _) => Ok(None),
            (Encryption::Preferred, tls) => Ok(tls.as_ref()),
            (Encryption::Required, Some(tls)) => Ok(Some(tls)),
            (Encryption::Strict, Some(tls)) if tls.verified => Ok(Some(tls)),
            (Encryption::Strict, Some(_)) => Err(format!(
                "{}: strict encryption requires certificate verification",
                target.address()
            )),
            (mode, None) => Err(format!(
                "{}: {mode} encryption requested but no tls configuration is available",
                target.address()
            )),
        }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    type Connection = TcpConnection;

    fn connect<'a>(
        &'a self,
        target: &'a TargetConfig,
    ) -> BoxFuture<'a, Result<TcpConnection, String>> {
        Box::pin(async move {
            let tls = self.tls_for(target)?;
            let addr = target.address();

            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| format!("tcp connect to {addr}: timed out after {:?}", self.connect_timeout))?
                .map_err(|e| format!("tcp connect to {addr}: {e}"))?;

            // Wire protocols exchange small messages; disable Nagle.
            let _ = stream.set_nodelay(true);

            tracing::debug!(
                host = %target.host,
                port = target.port,
                tls = tls.is_some(),
                "established tcp connection"
            );

            let Some(tls) = tls else {
                return Ok(TcpConnection::Plain(stream));
            };

            let server_name = rustls::pki_types::ServerName::try_from(target.host.as_str())
                .map_err(|e| format!("invalid tls server name '{}': {e}", target.host))?
                .to_owned();
            let connector = TlsConnector::from(Arc::clone(&tls.client_config));
            let stream = tokio::time::timeout(self.connect_timeout, connector.connect(server_name, stream))
                .await
                .map_err(|_| format!("tls handshake with {addr}: timed out"))?
                .map_err(|e| format!("tls handshake with {addr}: {e}"))?;

            Ok(TcpConnection::Tls(Box::new(stream)))
        })
    }

    fn is_healthy<'a>(&'a self, conn: &'a mut TcpConnection) -> BoxFuture<'a, bool> {
        Box::pin(async move { socket_alive(conn.tcp_stream()).await })
    }

    fn close(&self, mut conn: TcpConnection) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = conn.shutdown().await {
                tracing::debug!(error = %e, "error shutting down connection");
            }
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Echo server on a random port; accepts any number of connections.
    async fn start_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    fn local(addr: SocketAddr, encryption: Encryption) -> TargetConfig {
        TargetConfig::new("127.0.0.1", addr.port(), "testdb", "user").with_encryption(encryption)
    }

    #[tokio::test]
    async fn plain_connection_round_trips_bytes() {
        let addr = start_echo_server().await;
        let factory = TcpConnectionFactory::plain(Duration::from_secs(2));
        let mut conn = factory
            .connect(&local(addr, Encryption::Disabled))
            .await
            .unwrap();
        assert!(!conn.is_tls());

        let startup: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];
        conn.write_all(&startup).await.unwrap();
        let mut buf = [0u8; 8];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, startup);
    }

    #[tokio::test]
    async fn preferred_without_tls_config_falls_back_to_plain() {
        let addr = start_echo_server().await;
        let factory = TcpConnectionFactory::plain(Duration::from_secs(2));
        let conn = factory
            .connect(&local(addr, Encryption::Preferred))
            .await
            .unwrap();
        assert!(!conn.is_tls());
    }

    #[tokio::test]
    async fn required_without_tls_config_fails_before_dialing() {
        let factory = TcpConnectionFactory::plain(Duration::from_secs(2));
        let target = TargetConfig::new("127.0.0.1", 1, "db", "u").with_encryption(Encryption::Required);
        let err = factory.connect(&target).await.unwrap_err();
        assert!(err.contains("no tls configuration"), "{err}");
    }

    #[tokio::test]
    async fn strict_rejects_unverified_tls() {
        let tls = TlsConfig::insecure_no_verify().unwrap();
        let factory = TcpConnectionFactory::with_tls(Duration::from_secs(2), tls);
        let target = TargetConfig::new("127.0.0.1", 1, "db", "u").with_encryption(Encryption::Strict);
        let err = factory.connect(&target).await.unwrap_err();
        assert!(err.contains("certificate verification"), "{err}");
    }

    #[tokio::test]
    async fn refused_connection_reports_address() {
        // Bind then drop to find a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let factory = TcpConnectionFactory::plain(Duration::from_secs(2));
        let err = factory
            .connect(&local(addr, Encryption::Disabled))
            .await
            .unwrap_err();
        assert!(err.contains(&addr.port().to_string()), "{err}");
    }

    #[tokio::test]
    async fn health_check_detects_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = close_rx.await;
            drop(stream);
        });

        let factory = TcpConnectionFactory::plain(Duration::from_secs(2));
        let mut conn = factory
            .connect(&local(addr, Encryption::Disabled))
            .await
            .unwrap();
        assert!(factory.is_healthy(&mut conn).await);

        close_tx.send(()).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while factory.is_healthy(&mut conn).await {
            assert!(tokio::time::Instant::now() < deadline, "peer close never observed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn tls_connection_round_trips_bytes() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let server_cert = rustls::pki_types::CertificateDer::from(cert.der().to_vec());
        let server_key = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
        let server_config = rustls::ServerConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![server_cert], server_key)
        .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(stream).await.unwrap();
            let mut buf = [0u8; 64];
            let n = tls.read(&mut buf).await.unwrap();
            tls.write_all(&buf[..n]).await.unwrap();
            tls.flush().await.unwrap();
        });

        // The certificate is self-signed, so skip verification.
        let factory = TcpConnectionFactory::with_tls(
            Duration::from_secs(2),
            TlsConfig::insecure_no_verify().unwrap(),
        );
        let mut conn = factory
            .connect(&local(addr, Encryption::Required))
            .await
            .unwrap();
        assert!(conn.is_tls());

        conn.write_all(b"encrypted hello").await.unwrap();
        conn.flush().await.unwrap();
        let mut buf = [0u8; 15];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"encrypted hello");

        factory.close(conn).await;
    }

    #[test]
    fn webpki_config_is_verified() {
        assert!(TlsConfig::with_webpki_roots().unwrap().verified);
        assert!(!TlsConfig::insecure_no_verify().unwrap().verified);
    }
}
