//! QUIC endpoint setup and the accept loop
//!
//! The server uses an ephemeral self-signed certificate: its identity is
//! never authenticated and TLS is purely for encryption, so clients connect
//! with a verifier that accepts any certificate. Both sides negotiate the
//! `qrtc/1` ALPN string.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::Endpoint;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::AuthClient;
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::server::client::RelayClient;
use crate::server::connection::ConnectionHandler;
use crate::server::registry::ClientRegistry;

/// ALPN string negotiated by clients and server
pub const ALPN: &[u8] = b"qrtc/1";

/// Connections idle longer than this are dropped
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The QUIC relay server: one endpoint, one handler task per connection
pub struct RelayServer {
    endpoint: Endpoint,
    registry: Arc<ClientRegistry<RelayClient>>,
    auth: AuthClient,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Bind the QUIC endpoint and prepare the authorization client.
    pub fn bind(
        config: &Config,
        registry: Arc<ClientRegistry<RelayClient>>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let addr = SocketAddr::from(([0, 0, 0, 0], config.quic_port));
        let endpoint = Endpoint::server(server_config()?, addr)
            .map_err(|e| RelayError::config(format!("failed to bind QUIC endpoint: {}", e)))?;
        let auth = AuthClient::new(config.authorization_uri.clone())?;

        Ok(Self {
            endpoint,
            registry,
            auth,
            shutdown,
        })
    }

    /// The bound address; useful when the configured port is 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept connections until shutdown. A failing connection never stops
    /// the accept loop; its handler logs and swallows the error.
    pub async fn run(self) {
        info!(
            "QUIC endpoint listening on {}",
            self.endpoint.local_addr().map_or_else(
                |e| format!("<unknown: {}>", e),
                |addr| addr.to_string()
            )
        );

        loop {
            let incoming = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, closing endpoint");
                    break;
                }
                incoming = self.endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                info!("endpoint stopped accepting connections");
                break;
            };

            let registry = Arc::clone(&self.registry);
            let auth = self.auth.clone();
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        ConnectionHandler::new(connection, registry, auth, cancel)
                            .run()
                            .await
                    }
                    Err(e) => debug!("connection handshake failed: {}", e),
                }
            });
        }

        self.endpoint.close(0u32.into(), b"server shutdown");
        self.endpoint.wait_idle().await;
    }
}

/// Server TLS + transport configuration with a freshly generated
/// self-signed certificate.
fn server_config() -> Result<quinn::ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|e| RelayError::config(format!("failed to generate certificate: {}", e)))?;
    let cert_der = CertificateDer::from(cert.cert);
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| RelayError::config(format!("failed to configure TLS: {}", e)))?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(8u32.into());
    transport.max_concurrent_uni_streams(8u32.into());
    transport.max_idle_timeout(Some(quinn::IdleTimeout::from(quinn::VarInt::from_u32(
        IDLE_TIMEOUT.as_millis() as u32,
    ))));

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| RelayError::config(format!("failed to create QUIC config: {}", e)))?,
    ));
    server_config.transport_config(Arc::new(transport));
    Ok(server_config)
}

/// Client configuration matching the relay: `qrtc/1` ALPN and no server
/// certificate validation.
pub fn client_config() -> Result<quinn::ClientConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(AcceptAnyCertificate::new())
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| RelayError::config(format!("failed to create QUIC config: {}", e)))?,
    )))
}

/// Certificate verifier that accepts anything. The relay's certificate is
/// ephemeral and self-signed, so there is nothing to validate against.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<rustls::crypto::CryptoProvider>);

impl AcceptAnyCertificate {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use crate::protocol::{
        encode_authentication, encode_data_frame, encode_join_channel, read_relayed_frame,
    };
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;
    use tokio::time::timeout;

    const TEST_MESSAGE: &[u8] = b"Test Message";

    /// Spin up an authorization endpoint answering every request with
    /// `status`.
    async fn auth_stub(status: StatusCode) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/auth", post(move || async move { status }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/auth", addr)
    }

    /// Bind a relay on an ephemeral port and run it in the background.
    async fn start_relay(
        authorization_uri: String,
    ) -> (SocketAddr, Arc<ClientRegistry<RelayClient>>) {
        let config = Config {
            quic_port: 0,
            http_port: 0,
            authorization_uri,
            log_level: LogLevel::None,
        };
        let registry = Arc::new(ClientRegistry::new());
        let shutdown = CancellationToken::new();
        let server = RelayServer::bind(&config, Arc::clone(&registry), shutdown).unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(server.run());
        (SocketAddr::from(([127, 0, 0, 1], port)), registry)
    }

    struct TestClient {
        connection: quinn::Connection,
        control: quinn::SendStream,
        data_send: quinn::SendStream,
        data_recv: quinn::RecvStream,
        _endpoint: Endpoint,
    }

    impl TestClient {
        /// Connect, authenticate and open the data stream. The zero-length
        /// keep-alive makes the bidirectional stream visible to the server
        /// without producing any fan-out.
        async fn connect(addr: SocketAddr, username: &str, echo: bool) -> Self {
            let mut endpoint = Endpoint::client(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
            endpoint.set_default_client_config(client_config().unwrap());
            let connection = endpoint.connect(addr, "localhost").unwrap().await.unwrap();

            let mut control = connection.open_uni().await.unwrap();
            control
                .write_all(&encode_authentication(echo, username, "secret").unwrap())
                .await
                .unwrap();

            let (mut data_send, data_recv) = connection.open_bi().await.unwrap();
            data_send
                .write_all(&encode_data_frame(&[]).unwrap())
                .await
                .unwrap();

            Self {
                connection,
                control,
                data_send,
                data_recv,
                _endpoint: endpoint,
            }
        }

        async fn join(&mut self, channel: u32) {
            self.control
                .write_all(&encode_join_channel(channel))
                .await
                .unwrap();
        }

        async fn send(&mut self, payload: &[u8]) {
            self.data_send
                .write_all(&encode_data_frame(payload).unwrap())
                .await
                .unwrap();
        }

        async fn read_frame(&mut self) -> (u32, Bytes) {
            timeout(Duration::from_secs(5), read_relayed_frame(&mut self.data_recv))
                .await
                .expect("timed out waiting for a relayed frame")
                .unwrap()
        }

        /// Expect silence on the data stream for `wait`.
        async fn assert_no_frame(&mut self, wait: Duration) {
            let result = timeout(wait, read_relayed_frame(&mut self.data_recv)).await;
            assert!(result.is_err(), "unexpected frame: {:?}", result);
        }
    }

    /// The protocol has no acknowledgements, so tests observe the registry
    /// to know when the server has caught up.
    async fn wait_for_clients(registry: &ClientRegistry<RelayClient>, count: usize) {
        for _ in 0..250 {
            if registry.store_info().await.client_count == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {} registered clients", count);
    }

    async fn wait_for_channel(registry: &ClientRegistry<RelayClient>, client_id: u32, channel: u32) {
        for _ in 0..250 {
            let infos = registry.client_infos().await;
            if infos.get(&client_id).map(|entry| entry.channel) == Some(channel) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "timed out waiting for client {} to reach channel {}",
            client_id, channel
        );
    }

    #[tokio::test]
    async fn test_echo_mode_returns_own_frames() {
        let uri = auth_stub(StatusCode::OK).await;
        let (addr, registry) = start_relay(uri).await;

        let mut client = TestClient::connect(addr, "echo-user", true).await;
        wait_for_clients(&registry, 1).await;

        client.send(TEST_MESSAGE).await;
        let (sender, payload) = client.read_frame().await;
        assert_eq!(sender, 0);
        assert_eq!(&payload[..], TEST_MESSAGE);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_peers_but_not_the_sender() {
        let uri = auth_stub(StatusCode::OK).await;
        let (addr, registry) = start_relay(uri).await;

        // Connect one at a time so IDs are assigned 0, 1, 2.
        let mut a = TestClient::connect(addr, "a", false).await;
        wait_for_clients(&registry, 1).await;
        let mut b = TestClient::connect(addr, "b", false).await;
        wait_for_clients(&registry, 2).await;
        let mut c = TestClient::connect(addr, "c", false).await;
        wait_for_clients(&registry, 3).await;

        a.join(1).await;
        b.join(1).await;
        c.join(1).await;
        for id in 0..3 {
            wait_for_channel(&registry, id, 1).await;
        }

        a.send(TEST_MESSAGE).await;

        for receiver in [&mut b, &mut c] {
            let (sender, payload) = receiver.read_frame().await;
            assert_eq!(sender, 0);
            assert_eq!(&payload[..], TEST_MESSAGE);
        }
        a.assert_no_frame(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn test_mutual_broadcast_carries_correct_sender_ids() {
        let uri = auth_stub(StatusCode::OK).await;
        let (addr, registry) = start_relay(uri).await;

        let mut a = TestClient::connect(addr, "a", false).await;
        wait_for_clients(&registry, 1).await;
        let mut b = TestClient::connect(addr, "b", false).await;
        wait_for_clients(&registry, 2).await;
        let mut c = TestClient::connect(addr, "c", false).await;
        wait_for_clients(&registry, 3).await;

        for client in [&mut a, &mut b, &mut c] {
            client.join(1).await;
        }
        for id in 0..3 {
            wait_for_channel(&registry, id, 1).await;
        }

        for client in [&mut a, &mut b, &mut c] {
            client.send(TEST_MESSAGE).await;
        }

        for (own_id, client) in [(0u32, &mut a), (1, &mut b), (2, &mut c)] {
            let mut senders = Vec::new();
            for _ in 0..2 {
                let (sender, payload) = client.read_frame().await;
                assert_eq!(&payload[..], TEST_MESSAGE);
                senders.push(sender);
            }
            senders.sort_unstable();
            let expected: Vec<u32> = (0..3).filter(|id| *id != own_id).collect();
            assert_eq!(senders, expected, "client {} saw wrong senders", own_id);
        }
    }

    #[tokio::test]
    async fn test_authorization_rejection_aborts_connection() {
        let uri = auth_stub(StatusCode::UNAUTHORIZED).await;
        let (addr, registry) = start_relay(uri).await;

        let mut endpoint = Endpoint::client(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        endpoint.set_default_client_config(client_config().unwrap());
        let connection = endpoint.connect(addr, "localhost").unwrap().await.unwrap();

        let mut control = connection.open_uni().await.unwrap();
        control
            .write_all(&encode_authentication(false, "denied", "secret").unwrap())
            .await
            .unwrap();

        // The server aborts the connection once the callout answers 401.
        let closed = timeout(Duration::from_secs(5), connection.closed())
            .await
            .expect("connection was not aborted");
        assert!(
            matches!(closed, quinn::ConnectionError::ApplicationClosed(_)),
            "unexpected close reason: {:?}",
            closed
        );
        assert_eq!(registry.store_info().await.client_count, 0);
    }

    #[tokio::test]
    async fn test_channel_zero_relays_nothing() {
        let uri = auth_stub(StatusCode::OK).await;
        let (addr, registry) = start_relay(uri).await;

        let mut a = TestClient::connect(addr, "a", false).await;
        wait_for_clients(&registry, 1).await;
        let mut b = TestClient::connect(addr, "b", false).await;
        wait_for_clients(&registry, 2).await;

        // Both clients sit on the default quarantine channel.
        a.send(TEST_MESSAGE).await;
        b.assert_no_frame(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn test_rejoin_collapses_the_old_channel() {
        let uri = auth_stub(StatusCode::OK).await;
        let (addr, registry) = start_relay(uri).await;

        let mut a = TestClient::connect(addr, "a", false).await;
        wait_for_clients(&registry, 1).await;

        a.join(1).await;
        wait_for_channel(&registry, 0, 1).await;
        assert_eq!(registry.store_info().await.channel_count, 1);

        a.join(2).await;
        wait_for_channel(&registry, 0, 2).await;
        let info = registry.store_info().await;
        assert_eq!(info.channel_count, 1, "channel 1 must have collapsed");
        assert!(registry
            .client_infos()
            .await
            .values()
            .all(|entry| entry.channel != 1));
    }

    #[tokio::test]
    async fn test_unknown_control_messages_are_ignored() {
        let uri = auth_stub(StatusCode::OK).await;
        let (addr, registry) = start_relay(uri).await;

        let mut a = TestClient::connect(addr, "a", false).await;
        wait_for_clients(&registry, 1).await;
        let mut b = TestClient::connect(addr, "b", false).await;
        wait_for_clients(&registry, 2).await;

        a.join(1).await;
        b.join(1).await;
        wait_for_channel(&registry, 0, 1).await;
        wait_for_channel(&registry, 1, 1).await;

        // An unrecognized control type is parsed and ignored; the
        // connection keeps relaying.
        a.control.write_all(&[0xAA]).await.unwrap();
        a.send(TEST_MESSAGE).await;

        let (sender, payload) = b.read_frame().await;
        assert_eq!(sender, 0);
        assert_eq!(&payload[..], TEST_MESSAGE);
    }

    #[tokio::test]
    async fn test_oversize_data_frame_tears_the_connection_down() {
        let uri = auth_stub(StatusCode::OK).await;
        let (addr, registry) = start_relay(uri).await;

        let mut a = TestClient::connect(addr, "a", false).await;
        wait_for_clients(&registry, 1).await;

        // 2000 exceeds the largest Opus packet; the server must abort.
        a.data_send
            .write_all(&2000u16.to_le_bytes())
            .await
            .unwrap();

        let closed = timeout(Duration::from_secs(5), a.connection.closed())
            .await
            .expect("connection was not aborted");
        assert!(
            matches!(closed, quinn::ConnectionError::ApplicationClosed(_)),
            "unexpected close reason: {:?}",
            closed
        );
        wait_for_clients(&registry, 0).await;
    }
}
