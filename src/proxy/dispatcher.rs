// src/proxy/dispatcher.rs - Accept loop and per-connection state machine
//
// Per connection: middleware predicates, TLS handshake under a single
// context snapshot, upstream dial, then the bidirectional relay. Errors
// are connection-scoped; nothing here ever touches another connection or
// the published TLS context.

use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{DenyReason, JwtValidator, RateLimiter, Verdict};
use crate::monitoring::metrics;
use crate::proxy::relay::{self, RELAY_BUFFER_SIZE};
use crate::tls::context::{build_upstream_client, TlsContextManager};

pub struct Dispatcher {
    config: Arc<AppConfig>,
    contexts: Arc<TlsContextManager>,
    limiter: Arc<RateLimiter>,
    auth: Option<Arc<JwtValidator>>,
    upstream_tls: Option<Arc<ClientConfig>>,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    accepting: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<AppConfig>,
        contexts: Arc<TlsContextManager>,
        limiter: Arc<RateLimiter>,
        auth: Option<Arc<JwtValidator>>,
    ) -> ProxyResult<Self> {
        let upstream_tls = if config.backend.use_tls {
            Some(build_upstream_client(&config.backend)?)
        } else {
            None
        };
        let max_connections = config.proxy.max_connections;

        Ok(Self {
            config,
            contexts,
            limiter,
            auth,
            upstream_tls,
            permits: Arc::new(Semaphore::new(max_connections)),
            active: Arc::new(AtomicUsize::new(0)),
            accepting: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Liveness flag read by the health surface.
    pub fn accepting_flag(&self) -> Arc<AtomicBool> {
        self.accepting.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept loop. Returns after the shutdown signal flips and in-flight
    /// connections have drained (or the grace deadline forced them).
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> ProxyResult<()> {
        self.accepting.store(true, Ordering::SeqCst);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        metrics::increment_request_counter();
                        match self.permits.clone().try_acquire_owned() {
                            Ok(permit) => {
                                let dispatcher = self.clone();
                                tasks.spawn(async move {
                                    dispatcher.handle_connection(stream, peer).await;
                                    drop(permit);
                                });
                            }
                            Err(_) => {
                                tracing::warn!(%peer, "connection limit reached, closing");
                                metrics::increment_rejected_counter();
                                drop(stream);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                Some(_finished) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.changed() => {
                    tracing::info!("shutdown signal received, accept loop stopping");
                    break;
                }
            }
        }

        self.accepting.store(false, Ordering::SeqCst);
        self.drain(tasks).await;
        Ok(())
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        let grace = Duration::from_secs(self.config.proxy.shutdown_grace_secs);
        tracing::info!(in_flight = tasks.len(), grace_secs = grace.as_secs(), "draining connections");

        let drained = timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            let remaining = tasks.len();
            tracing::warn!(remaining, "grace deadline reached, force-closing");
            for _ in 0..remaining {
                metrics::increment_error_counter();
            }
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let connection_id = Uuid::new_v4();
        let started = std::time::Instant::now();
        self.active.fetch_add(1, Ordering::SeqCst);
        metrics::connection_opened();

        match self.serve_connection(stream, peer).await {
            Ok((bytes_c2s, bytes_s2c)) => {
                tracing::debug!(
                    %connection_id, %peer, bytes_c2s, bytes_s2c,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "connection closed"
                );
            }
            Err(e) => {
                if e.should_log_as_error() {
                    tracing::error!(%connection_id, %peer, kind = e.kind(), error = %e, "connection failed");
                } else {
                    tracing::warn!(%connection_id, %peer, kind = e.kind(), error = %e, "connection rejected");
                }
                match &e {
                    ProxyError::RateLimited { .. } => metrics::increment_rate_limited_counter(),
                    ProxyError::Unauthorized(_) => metrics::increment_rejected_counter(),
                    _ => metrics::increment_error_counter(),
                }
            }
        }

        metrics::observe_request_latency(started.elapsed().as_secs_f64());
        metrics::connection_closed();
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn serve_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> ProxyResult<(u64, u64)> {
        // middleware predicates run before any TLS work is spent
        if let Verdict::Deny(reason) = self.limiter.check(peer.ip()) {
            return Err(match reason {
                DenyReason::RateLimited => ProxyError::RateLimited {
                    client: peer.ip().to_string(),
                },
                DenyReason::Unauthorized => {
                    ProxyError::Unauthorized("denied by middleware".into())
                }
            });
        }

        // one snapshot per connection: the handshake completes under this
        // context even if a newer one is published mid-flight
        let ctx = self.contexts.snapshot();
        let acceptor = TlsAcceptor::from(ctx.server_config.clone());
        let handshake_timeout = Duration::from_secs(self.config.tls.handshake_timeout_secs);

        stream.set_nodelay(true).ok();
        let mut tls_stream = timeout(handshake_timeout, acceptor.accept(stream))
            .await
            .map_err(|_| {
                ProxyError::Handshake(format!(
                    "timed out after {}s",
                    handshake_timeout.as_secs()
                ))
            })?
            .map_err(|e| ProxyError::Handshake(e.to_string()))?;

        // optional bearer pre-filter on the first cleartext chunk; the
        // chunk itself is forwarded upstream untouched
        let mut initial: Option<Vec<u8>> = None;
        if let Some(auth) = &self.auth {
            let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
            let n = timeout(handshake_timeout, tls_stream.read(&mut buf))
                .await
                .map_err(|_| ProxyError::Unauthorized("no data before auth deadline".into()))?
                .map_err(|e| ProxyError::Handshake(e.to_string()))?;
            buf.truncate(n);

            match auth.check_initial_bytes(&buf) {
                Verdict::Allow => initial = Some(buf),
                Verdict::Deny(_) => {
                    return Err(ProxyError::Unauthorized("bearer token rejected".into()))
                }
            }
        }

        // dial the backend
        let upstream_addr = self.config.backend.upstream_addr();
        let connect_timeout = Duration::from_secs(self.config.backend.connect_timeout_secs);
        let upstream = timeout(connect_timeout, TcpStream::connect(&upstream_addr))
            .await
            .map_err(|_| ProxyError::Upstream(format!("connect to {upstream_addr} timed out")))?
            .map_err(|e| ProxyError::Upstream(format!("{upstream_addr}: {e}")))?;
        upstream.set_nodelay(true).ok();

        match &self.upstream_tls {
            Some(client_config) => {
                let connector = TlsConnector::from(client_config.clone());
                let server_name = ServerName::try_from(self.config.backend.upstream_host())
                    .map_err(|e| ProxyError::Upstream(format!("invalid upstream host: {e}")))?;
                let upstream = timeout(connect_timeout, connector.connect(server_name, upstream))
                    .await
                    .map_err(|_| ProxyError::Upstream("upstream TLS handshake timed out".into()))?
                    .map_err(|e| ProxyError::Upstream(format!("upstream TLS handshake: {e}")))?;
                self.relay_both(tls_stream, upstream, initial).await
            }
            None => self.relay_both(tls_stream, upstream, initial).await,
        }
    }

    /// Spawn-free bidirectional relay: both directions run concurrently on
    /// this task, each with its own buffer and lifetime.
    async fn relay_both<C, U>(
        &self,
        client: C,
        upstream: U,
        initial: Option<Vec<u8>>,
    ) -> ProxyResult<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);

        let (c2s, s2c) = tokio::join!(
            relay::copy_half(client_read, upstream_write, initial.as_deref()),
            relay::copy_half(upstream_read, client_write, None),
        );

        match (c2s, s2c) {
            (Ok(bytes_c2s), Ok(bytes_s2c)) => Ok((bytes_c2s, bytes_s2c)),
            (Err(e), _) | (_, Err(e)) => {
                Err(ProxyError::Upstream(format!("relay aborted: {e}")))
            }
        }
    }
}
