//! The single persistent gRPC connection of a client

use crate::config::TransportMode;
use crate::context::Context;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::ServerName;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Uri};
use tracing::{debug, info, warn};

/// Pings are sent after this much inactivity
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection is considered dead when a ping is not acknowledged within this delay
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

const ALPN_H2: &[u8] = b"h2";

/// Address to dial for `network`
///
/// An address already ending with a port is used as-is. Otherwise the configured port wins,
/// falling back to the transport's well-known port.
pub fn resolve_address(network: &str, port: Option<u16>, transport: TransportMode) -> String {
    if has_port_suffix(network) {
        return network.to_string();
    }

    let port = port.unwrap_or_else(|| transport.default_port());
    format!("{network}:{port}")
}

fn has_port_suffix(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((_, port)) => (2..=5).contains(&port.len()) && port.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Builds the connection a [`ConnectionManager`] caches
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// Dials a tonic [`Channel`] with keepalive enabled
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    address: String,
    transport: TransportMode,
}

impl GrpcConnector {
    pub fn new(address: impl Into<String>, transport: TransportMode) -> Self {
        Self {
            address: address.into(),
            transport,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> TransportMode {
        self.transport
    }

    fn endpoint(&self) -> Result<Endpoint> {
        // With insecure TLS the handshake is done by our own connector, tonic sees plain text
        let scheme = match self.transport {
            TransportMode::PlainText | TransportMode::InsecureTls => "http",
            TransportMode::SecureTls => "https",
        };

        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", self.address))?
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);

        if self.transport == TransportMode::SecureTls {
            endpoint = endpoint.tls_config(ClientTlsConfig::new())?;
        }

        Ok(endpoint)
    }

    fn server_name(&self) -> Result<ServerName> {
        let host = self
            .address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _)| host)
            .trim_start_matches('[')
            .trim_end_matches(']');

        ServerName::try_from(host).map_err(|_| {
            ClientError::Configuration(format!("{host:?} is not a valid TLS server name"))
        })
    }

    async fn connect_insecure(&self, endpoint: Endpoint) -> Result<Channel> {
        warn!(address = %self.address, "Server certificate verification is disabled");

        let tls = TlsConnector::from(insecure_tls_config());
        let server_name = self.server_name()?;

        let connector = tower::service_fn(move |uri: Uri| {
            let tls = tls.clone();
            let server_name = server_name.clone();

            async move {
                let authority = uri
                    .authority()
                    .map(|authority| authority.as_str().to_string())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "endpoint has no authority"))?;

                let tcp = TcpStream::connect(authority).await?;
                tcp.set_nodelay(true)?;
                tls.connect(server_name, tcp).await
            }
        });

        Ok(endpoint.connect_with_connector(connector).await?)
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    type Connection = Channel;

    async fn connect(&self) -> Result<Channel> {
        info!(address = %self.address, transport = ?self.transport, "Dialing gRPC endpoint");
        let endpoint = self.endpoint()?;

        match self.transport {
            TransportMode::InsecureTls => self.connect_insecure(endpoint).await,
            TransportMode::PlainText | TransportMode::SecureTls => Ok(endpoint.connect().await?),
        }
    }
}

/// Accepts any server certificate, handshake signatures are still checked
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn insecure_tls_config() -> Arc<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    config.alpn_protocols.push(ALPN_H2.to_vec());

    Arc::new(config)
}

/// Lazily creates the connection, at most once
///
/// The fast path is lock free. Concurrent first callers are serialized so only one of them
/// constructs the connection. A failed construction is not cached, the next call retries it.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    connection: OnceLock<C::Connection>,
    init_lock: Mutex<()>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connection: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub async fn connection(&self, ctx: &Context) -> Result<C::Connection> {
        if let Some(connection) = self.connection.get() {
            return Ok(connection.clone());
        }

        let _guard = ctx
            .run(async { Ok::<_, ClientError>(self.init_lock.lock().await) })
            .await?;

        // It might have been set while we were waiting for the lock
        if let Some(connection) = self.connection.get() {
            return Ok(connection.clone());
        }

        debug!("Connection not established yet, creating it");
        let connection = ctx.run(self.connector.connect()).await?;

        Ok(self.connection.get_or_init(|| connection).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts constructions, failing the first `failures` ones
    struct CountingConnector {
        constructions: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    impl CountingConnector {
        fn new(failures: usize, delay: Duration) -> Self {
            Self {
                constructions: AtomicUsize::new(0),
                failures,
                delay,
            }
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Connection = usize;

        async fn connect(&self) -> Result<usize> {
            let attempt = self.constructions.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;

            if attempt <= self.failures {
                return Err(ClientError::Configuration(format!("attempt {attempt} failed")));
            }

            Ok(attempt)
        }
    }

    #[test]
    fn test_resolve_address() {
        let cases = [
            ("mainnet.eos.dfuse.io", None, TransportMode::SecureTls, "mainnet.eos.dfuse.io:443"),
            ("mainnet.eos.dfuse.io", None, TransportMode::PlainText, "mainnet.eos.dfuse.io:9000"),
            ("mainnet.eos.dfuse.io", Some(8443), TransportMode::SecureTls, "mainnet.eos.dfuse.io:8443"),
            ("mainnet.eos.dfuse.io", Some(8443), TransportMode::PlainText, "mainnet.eos.dfuse.io:8443"),
            ("localhost:13023", Some(8443), TransportMode::PlainText, "localhost:13023"),
            ("localhost:13023", None, TransportMode::SecureTls, "localhost:13023"),
            ("localhost:1", None, TransportMode::PlainText, "localhost:1:9000"),
        ];

        for (network, port, transport, expected) in cases {
            assert_eq!(resolve_address(network, port, transport), expected, "{network} {port:?}");
        }
    }

    #[test]
    fn test_endpoint_scheme_follows_transport() {
        let cases = [
            (TransportMode::PlainText, "http"),
            (TransportMode::InsecureTls, "http"),
            (TransportMode::SecureTls, "https"),
        ];

        for (transport, scheme) in cases {
            let connector = GrpcConnector::new("testnet.eos.dfuse.io:443", transport);
            let endpoint = connector.endpoint().unwrap();
            assert_eq!(endpoint.uri().scheme_str(), Some(scheme), "{transport:?}");
            assert_eq!(endpoint.uri().authority().unwrap().as_str(), "testnet.eos.dfuse.io:443");
        }
    }

    #[test]
    fn test_server_name() {
        let connector = GrpcConnector::new("localhost:13023", TransportMode::InsecureTls);
        assert_eq!(
            connector.server_name().unwrap(),
            ServerName::try_from("localhost").unwrap()
        );

        let connector = GrpcConnector::new("127.0.0.1:13023", TransportMode::InsecureTls);
        assert!(matches!(connector.server_name().unwrap(), ServerName::IpAddress(_)));

        let connector = GrpcConnector::new("[::1]:13023", TransportMode::InsecureTls);
        assert!(matches!(connector.server_name().unwrap(), ServerName::IpAddress(_)));

        let connector = GrpcConnector::new("bad host:13023", TransportMode::InsecureTls);
        assert!(matches!(connector.server_name(), Err(ClientError::Configuration(_))));
    }

    #[test]
    fn test_insecure_tls_accepts_any_certificate() {
        let verified = SkipServerVerification.verify_server_cert(
            &rustls::Certificate(vec![0xde, 0xad, 0xbe, 0xef]),
            &[],
            &ServerName::try_from("localhost").unwrap(),
            &mut std::iter::empty(),
            &[],
            SystemTime::now(),
        );
        assert!(verified.is_ok());

        assert_eq!(insecure_tls_config().alpn_protocols, vec![ALPN_H2.to_vec()]);
    }

    #[tokio::test]
    async fn test_insecure_tls_dial_failure_is_reported() {
        // Nothing listens there, the connector error surfaces as a transport error
        let connector = GrpcConnector::new("127.0.0.1:10", TransportMode::InsecureTls);
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)), "{err:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connection_constructed_once() {
        let manager = Arc::new(ConnectionManager::new(CountingConnector::new(
            0,
            Duration::from_millis(50),
        )));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.connection(&Context::background()).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 1);
        }

        assert_eq!(manager.connector().constructions.load(Ordering::SeqCst), 1);

        // Later calls take the fast path
        assert_eq!(manager.connection(&Context::background()).await.unwrap(), 1);
        assert_eq!(manager.connector().constructions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_construction_is_retried() {
        let manager = ConnectionManager::new(CountingConnector::new(1, Duration::ZERO));

        assert!(manager.connection(&Context::background()).await.is_err());
        assert_eq!(manager.connection(&Context::background()).await.unwrap(), 2);
        assert_eq!(manager.connection(&Context::background()).await.unwrap(), 2);
        assert_eq!(manager.connector().constructions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_construction_honours_context() {
        let manager = ConnectionManager::new(CountingConnector::new(0, Duration::from_secs(60)));
        let ctx = Context::background().with_timeout(Duration::from_secs(1));

        let err = manager.connection(&ctx).await.unwrap_err();
        assert!(matches!(err, ClientError::Context(ContextError::DeadlineExceeded)));

        // Nothing was cached by the abandoned attempt
        assert!(manager.connection.get().is_none());
    }
}
