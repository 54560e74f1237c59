// End-to-end proxy scenarios over real sockets with self-signed certificates.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use kemgate::config::AppConfig;
use kemgate::credentials::CertificateBundle;
use kemgate::middleware::{JwtValidator, RateLimiter};
use kemgate::proxy::Dispatcher;
use kemgate::tls::context::TlsContextManager;
use kemgate::tls::hybrid::X25519_KYBER768;
use rustls::crypto::ring;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, ServerName};
use sha2::{Digest, Sha256};

struct TestCert {
    cert_pem: String,
    key_pem: String,
    der: CertificateDer<'static>,
}

impl TestCert {
    /// Serialize exactly once: rcgen re-signs on every serialize call, so
    /// the DER is derived from the one PEM we keep.
    fn generate() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_pem = cert.serialize_pem().unwrap();
        let key_pem = cert.serialize_private_key_pem();
        let mut slice = cert_pem.as_bytes();
        let der = rustls_pemfile::certs(&mut slice)
            .next()
            .unwrap()
            .unwrap();
        Self {
            cert_pem,
            key_pem,
            der,
        }
    }

    fn bundle(&self) -> CertificateBundle {
        CertificateBundle::from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes(), None)
            .unwrap()
    }

    fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.der.as_ref()))
    }
}

struct TestProxy {
    addr: SocketAddr,
    contexts: Arc<TlsContextManager>,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<kemgate::error::ProxyResult<()>>,
}

impl TestProxy {
    async fn start(cert: &TestCert, upstream: SocketAddr, tune: impl FnOnce(&mut AppConfig)) -> Self {
        let mut config = AppConfig::default();
        config.backend.host = upstream.ip().to_string();
        config.backend.port = upstream.port();
        config.rate_limiter.rate_limit = 1000;
        config.proxy.shutdown_grace_secs = 5;
        tune(&mut config);
        let config = Arc::new(config);

        let contexts = Arc::new(TlsContextManager::new(
            TlsContextManager::build(&cert.bundle(), false, None).unwrap(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limiter.rate_limit,
            config.rate_limiter.per_seconds,
        ));
        let auth = JwtValidator::from_settings(&config.auth).unwrap().map(Arc::new);

        let dispatcher =
            Arc::new(Dispatcher::new(config, contexts.clone(), limiter, auth).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.clone().run(listener, shutdown_rx));

        Self {
            addr,
            contexts,
            dispatcher,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

fn client_config(trusted: &[&TestCert]) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in trusted {
        roots.add(cert.der.clone()).unwrap();
    }
    Arc::new(
        ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

fn hybrid_client_config(trusted: &[&TestCert]) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in trusted {
        roots.add(cert.der.clone()).unwrap();
    }
    let mut provider = ring::default_provider();
    provider.kx_groups = vec![X25519_KYBER768];
    Arc::new(
        ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

async fn tls_connect(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let connector = TlsConnector::from(config);
    let server_name = ServerName::try_from("localhost").unwrap();
    connector.connect(server_name, tcp).await
}

/// Plain echo upstream: copies every byte back, then closes.
async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

fn random_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

async fn wait_until_drained(dispatcher: &Dispatcher) {
    for _ in 0..100 {
        if dispatcher.active_connections() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connections never drained");
}

#[tokio::test(flavor = "multi_thread")]
async fn classical_passthrough_is_byte_exact() {
    let cert = TestCert::generate();
    let upstream = spawn_echo_upstream().await;
    let proxy = TestProxy::start(&cert, upstream, |_| {}).await;

    let stream = tls_connect(proxy.addr, client_config(&[&cert])).await.unwrap();

    // write and read concurrently; a 1 MiB echo overflows every buffer in
    // the chain if the client refuses to read while writing
    let payload = random_payload(1024 * 1024);
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let writer = async {
        write_half.write_all(&payload).await.unwrap();
        write_half.shutdown().await.unwrap();
    };
    let reader = async {
        let mut echoed = Vec::with_capacity(payload.len());
        read_half.read_to_end(&mut echoed).await.unwrap();
        echoed
    };
    let ((), echoed) = tokio::join!(writer, reader);
    assert_eq!(echoed, payload);

    wait_until_drained(&proxy.dispatcher).await;
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hybrid_handshake_negotiates_compound_group() {
    let cert = TestCert::generate();
    let upstream = spawn_echo_upstream().await;
    let proxy = TestProxy::start(&cert, upstream, |_| {}).await;

    // rotate in a hybrid context backed by freshly generated KEM material
    let material =
        kemgate_crypto::kem::generate_keypair(kemgate_crypto::KemAlgorithm::Kyber768).unwrap();
    let hybrid_ctx =
        TlsContextManager::build(&cert.bundle(), true, Some(&material)).unwrap();
    assert!(hybrid_ctx.hybrid);
    proxy.contexts.publish(hybrid_ctx);

    // this client offers ONLY the compound group; the handshake cannot
    // succeed unless the server negotiates it
    let mut stream = tls_connect(proxy.addr, hybrid_client_config(&[&cert]))
        .await
        .unwrap();

    stream.write_all(b"quantum ping").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"quantum ping");

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hybrid_only_client_fails_against_classical_context() {
    let cert = TestCert::generate();
    let upstream = spawn_echo_upstream().await;
    let proxy = TestProxy::start(&cert, upstream, |_| {}).await;

    // classical-only server, hybrid-only client: no common group
    let result = tls_connect(proxy.addr, hybrid_client_config(&[&cert])).await;
    assert!(result.is_err());

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limit_denies_the_third_connection() {
    let cert = TestCert::generate();
    let upstream = spawn_echo_upstream().await;
    let proxy = TestProxy::start(&cert, upstream, |c| {
        c.rate_limiter.rate_limit = 2;
        c.rate_limiter.per_seconds = 60;
    })
    .await;

    let config = client_config(&[&cert]);
    for _ in 0..2 {
        let mut stream = tls_connect(proxy.addr, config.clone()).await.unwrap();
        stream.write_all(b"ok").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ok");
    }

    // the connection is closed before the handshake completes
    let third = tls_connect(proxy.addr, config).await;
    assert!(third.is_err());

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hot_rotation_preserves_in_flight_connections() {
    let cert_a = TestCert::generate();
    let cert_b = TestCert::generate();
    let upstream = spawn_echo_upstream().await;
    let proxy = TestProxy::start(&cert_a, upstream, |_| {}).await;

    let config = client_config(&[&cert_a, &cert_b]);

    // connection 1 handshakes under A and stays open across the rotation
    let mut old_conn = tls_connect(proxy.addr, config.clone()).await.unwrap();
    let presented_a = {
        let (_, session) = old_conn.get_ref();
        hex::encode(Sha256::digest(
            session.peer_certificates().unwrap()[0].as_ref(),
        ))
    };
    assert_eq!(presented_a, cert_a.fingerprint());

    // lifecycle publish: new bundle goes live atomically
    proxy
        .contexts
        .publish(TlsContextManager::build(&cert_b.bundle(), false, None).unwrap());

    // new connections observe B
    let mut new_conn = tls_connect(proxy.addr, config.clone()).await.unwrap();
    let presented_b = {
        let (_, session) = new_conn.get_ref();
        hex::encode(Sha256::digest(
            session.peer_certificates().unwrap()[0].as_ref(),
        ))
    };
    assert_eq!(presented_b, cert_b.fingerprint());

    // the pre-rotation connection still relays bytes without error
    old_conn.write_all(b"still alive").await.unwrap();
    old_conn.shutdown().await.unwrap();
    let mut buf = Vec::new();
    old_conn.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"still alive");

    new_conn.shutdown().await.unwrap();
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_down_closes_connection_after_handshake() {
    let cert = TestCert::generate();

    // bind-then-drop guarantees a refusing port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_upstream = listener.local_addr().unwrap();
    drop(listener);

    let proxy = TestProxy::start(&cert, dead_upstream, |c| {
        c.backend.connect_timeout_secs = 2;
    })
    .await;

    // handshake succeeds, then the proxy closes on the failed dial
    let mut stream = tls_connect(proxy.addr, client_config(&[&cert])).await.unwrap();
    let mut buf = [0u8; 16];
    let outcome = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await;
    match outcome {
        Ok(Ok(0)) => {}       // clean close
        Ok(Ok(n)) => panic!("unexpected {n} bytes from a dead upstream"),
        Ok(Err(_)) => {}      // reset is also acceptable
        Err(_) => panic!("proxy kept the connection open with a dead upstream"),
    }

    // the listener is still healthy afterwards
    assert!(TcpStream::connect(proxy.addr).await.is_ok());
    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn half_close_lets_the_reverse_direction_finish() {
    let cert = TestCert::generate();

    // upstream that answers only after seeing the client's FIN
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                socket.read_to_end(&mut request).await.unwrap();
                socket.write_all(b"late reply: ").await.unwrap();
                socket.write_all(&request).await.unwrap();
                socket.shutdown().await.unwrap();
            });
        }
    });

    let proxy = TestProxy::start(&cert, upstream, |_| {}).await;
    let mut stream = tls_connect(proxy.addr, client_config(&[&cert])).await.unwrap();

    stream.write_all(b"request body").await.unwrap();
    stream.shutdown().await.unwrap(); // client FIN; reverse path stays open

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"late reply: request body");

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bearer_prefilter_gates_connections() {
    let cert = TestCert::generate();
    let upstream = spawn_echo_upstream().await;
    let proxy = TestProxy::start(&cert, upstream, |c| {
        c.auth.secret_key = Some("e2e-secret".to_string());
    })
    .await;

    let token = {
        use jsonwebtoken::{encode, EncodingKey, Header};
        let claims = serde_json::json!({
            "sub": "client",
            "exp": chrono::Utc::now().timestamp() + 600,
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"e2e-secret"),
        )
        .unwrap()
    };

    // valid token: the whole first chunk is forwarded upstream and echoed
    let request = format!("GET / HTTP/1.1\r\nAuthorization: Bearer {token}\r\n\r\n");
    let mut stream = tls_connect(proxy.addr, client_config(&[&cert])).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, request.as_bytes());

    // bad token: the proxy closes without relaying anything
    let mut stream = tls_connect(proxy.addr, client_config(&[&cert])).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nAuthorization: Bearer nope\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0, "rejected connection must not relay data");

    proxy.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_finishes_in_flight_transfer() {
    let cert = TestCert::generate();
    let upstream = spawn_echo_upstream().await;
    let proxy = TestProxy::start(&cert, upstream, |_| {}).await;

    let stream = tls_connect(proxy.addr, client_config(&[&cert])).await.unwrap();
    let payload = random_payload(256 * 1024);
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let shutdown = &proxy.shutdown;
    let writer = async {
        write_half.write_all(&payload[..64 * 1024]).await.unwrap();

        // shutdown lands mid-transfer: accepts stop, this connection drains
        shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        write_half.write_all(&payload[64 * 1024..]).await.unwrap();
        write_half.shutdown().await.unwrap();
    };
    let reader = async {
        let mut echoed = Vec::new();
        read_half.read_to_end(&mut echoed).await.unwrap();
        echoed
    };
    let ((), echoed) = tokio::join!(writer, reader);
    assert_eq!(echoed, payload);

    // the accept loop exits cleanly once drained
    let run_result = proxy.task.await.unwrap();
    assert!(run_result.is_ok());

    // and no further connections are accepted
    assert!(tls_connect(proxy.addr, client_config(&[&cert])).await.is_err());
}
