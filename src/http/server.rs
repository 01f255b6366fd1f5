//! HTTP/HTTPS server lifecycle.
//!
//! [`Server::serve`] builds the pipeline (once), then spawns two tasks: the
//! accept loop, and a stop listener waiting on a one-shot signal. [`Server::stop`]
//! fires that signal; the listener then stops accepting and gives in-flight
//! requests the grace period to finish before their connections are closed.
//!
//! Supports three TLS modes:
//! - ACME: Automatic Let's Encrypt certificates
//! - Manual: User-provided certificate files
//! - None: Plain HTTP

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures::StreamExt;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};

use crate::config::{HttpConfig, TlsMode};
use crate::error::ServerError;
use crate::pipeline::{compose, Pipeline};
use crate::registry::Registry;

use super::redirect;
use super::shutdown;

/// At most one serve error, one stop error and one duplicate-serve report are
/// ever queued per channel.
pub const ERROR_CHANNEL_CAPACITY: usize = 4;

/// Outcome of binding the listener: unset while the bind is pending, then the
/// bound address, or `None` if the listener never came up.
type Bound = Option<Option<SocketAddr>>;

/// Owns the listener and its lifecycle. Serves at most once.
pub struct Server {
    config: Arc<HttpConfig>,
    registry: Arc<Registry>,
    pipeline: Pipeline,
    handle: Handle,
    redirect_handle: Handle,
    bound: Arc<watch::Sender<Bound>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    stop_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Server {
    pub fn new(config: HttpConfig, registry: Arc<Registry>) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (bound, _) = watch::channel(None);
        Self {
            config: Arc::new(config),
            registry,
            pipeline: Pipeline::new(),
            handle: Handle::new(),
            redirect_handle: Handle::new(),
            bound: Arc::new(bound),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx: Mutex::new(Some(stop_rx)),
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// The composed request pipeline, built on first call and reused after.
    pub fn pipeline(&self) -> Router {
        self.pipeline.get_or_build(|| {
            let router = compose(&self.config.middleware, &self.registry);
            with_timeouts(router, &self.config)
        })
    }

    /// Start serving in the background.
    ///
    /// Errors from the listener and from shutdown arrive on the returned channel,
    /// which closes once the server has stopped. A server serves at most once;
    /// later calls only report [`ServerError::AlreadyServing`].
    pub fn serve(&self) -> mpsc::Receiver<ServerError> {
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let app = self.pipeline();

        let Some(stop_rx) = self.stop_rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            report(&errors_tx, ServerError::AlreadyServing);
            return errors_rx;
        };

        let (served_tx, served_rx) = oneshot::channel();

        tokio::spawn(serve(
            app,
            Arc::clone(&self.config),
            self.handle.clone(),
            self.redirect_handle.clone(),
            Arc::clone(&self.bound),
            errors_tx.clone(),
            served_tx,
        ));

        tokio::spawn(shutdown(
            stop_rx,
            served_rx,
            self.handle.clone(),
            self.redirect_handle.clone(),
            self.config.graceful_timeout(),
            errors_tx,
        ));

        errors_rx
    }

    /// Signal the server to stop. Returns immediately; later calls do nothing.
    ///
    /// Stopping before `serve` makes the server shut down as soon as it starts.
    pub fn stop(&self) {
        let stop_tx = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match stop_tx {
            Some(stop_tx) => {
                let _ = stop_tx.send(());
            }
            None => tracing::debug!("Stop already requested"),
        }
    }

    /// Address the listener is bound to, waiting for the bind if it is still
    /// pending. Must be called after [`Server::serve`].
    ///
    /// `None` if binding failed or the server stopped before listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut bound = self.bound.subscribe();
        let addr = match bound.wait_for(Option::is_some).await {
            Ok(state) => (*state).flatten(),
            Err(_) => None,
        };
        addr
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }
}

fn report(errors: &mpsc::Sender<ServerError>, error: ServerError) {
    if let Err(e) = errors.try_send(error) {
        tracing::error!(error = %e, "Server error dropped");
    }
}

fn with_timeouts(mut router: Router, config: &HttpConfig) -> Router {
    if let Some(read_timeout) = config.read_timeout() {
        router = router.layer(RequestBodyTimeoutLayer::new(read_timeout));
    }
    if let Some(write_timeout) = config.write_timeout() {
        router = router.layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            write_timeout,
        ));
    }
    router
}

/// Apply header and connection limits to the hyper connection builder.
fn configure_connections(builder: &mut Builder<TokioExecutor>, config: &HttpConfig) {
    let mut http1 = builder.http1();
    http1.timer(TokioTimer::new());
    if let Some(max_buf_size) = config.header_buf_size() {
        http1.max_buf_size(max_buf_size);
    }
    if let Some(read_header_timeout) = config.read_header_timeout() {
        http1.header_read_timeout(read_header_timeout);
    }

    if let Some(idle_timeout) = config.idle_timeout() {
        builder
            .http2()
            .timer(TokioTimer::new())
            .keep_alive_interval(idle_timeout)
            .keep_alive_timeout(idle_timeout);
    }
}

/// Accept loop. Publishes the bind outcome on `bound`, and resolves `served`
/// once the listener is closed, whatever the reason.
async fn serve(
    app: Router,
    config: Arc<HttpConfig>,
    handle: Handle,
    redirect_handle: Handle,
    bound: Arc<watch::Sender<Bound>>,
    errors: mpsc::Sender<ServerError>,
    served: oneshot::Sender<()>,
) {
    // A failed bind is never reported by `Handle::listening` to late callers;
    // it is published below once `start_server` returns.
    let listening = tokio::spawn({
        let handle = handle.clone();
        let bound = Arc::clone(&bound);
        async move {
            if let Some(addr) = handle.listening().await {
                bound.send_replace(Some(Some(addr)));
            }
        }
    });

    if let Err(e) = start_server(app, &config, handle, redirect_handle).await {
        tracing::error!(error = %e, "HTTP server failed");
        report(&errors, e);
    }

    listening.abort();
    bound.send_if_modified(|state| match state {
        Some(_) => false,
        None => {
            *state = Some(None);
            true
        }
    });
    let _ = served.send(());
}

/// Start the HTTP/HTTPS server based on configuration.
///
/// Returns when the listener has closed.
async fn start_server(
    app: Router,
    config: &HttpConfig,
    handle: Handle,
    redirect_handle: Handle,
) -> Result<(), ServerError> {
    let addr = config.socket_addr()?;

    match config.tls_mode() {
        TlsMode::None => start_plain_server(app, addr, config, handle).await,
        TlsMode::Manual { cert_file, key_file } => {
            start_manual_tls_server(app, addr, &cert_file, &key_file, config, handle, redirect_handle)
                .await
        }
        TlsMode::Acme { dir_cache, hosts } => {
            start_acme_server(app, addr, dir_cache, hosts, config, handle, redirect_handle).await
        }
    }
}

/// Start a plain HTTP server (no TLS).
async fn start_plain_server(
    app: Router,
    addr: SocketAddr,
    config: &HttpConfig,
    handle: Handle,
) -> Result<(), ServerError> {
    tracing::info!(%addr, "Starting HTTP server (no TLS)");

    let mut server = axum_server::bind(addr).handle(handle);
    configure_connections(server.http_builder(), config);

    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(ServerError::Serve)
}

/// Start HTTPS server with user-provided certificates.
async fn start_manual_tls_server(
    app: Router,
    addr: SocketAddr,
    cert_path: &str,
    key_path: &str,
    config: &HttpConfig,
    handle: Handle,
    redirect_handle: Handle,
) -> Result<(), ServerError> {
    tracing::info!(%addr, cert = %cert_path, key = %key_path, "Starting HTTPS server (manual certs)");
    install_crypto_provider();

    let rustls_config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|e| ServerError::TlsConfig(format!("Failed to load certificates: {}", e)))?;

    shutdown::setup_reload_handler(rustls_config.clone(), cert_path.to_string(), key_path.to_string());

    if config.redirect_http {
        redirect::spawn_redirect_server(addr.ip(), config.redirect_port, addr.port(), redirect_handle);
    }

    let mut server = axum_server::bind_rustls(addr, rustls_config).handle(handle);
    configure_connections(server.http_builder(), config);

    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(ServerError::Serve)
}

/// Start HTTPS server with automatic ACME (Let's Encrypt) certificates.
///
/// Certificates for `hosts` are ordered on demand, answered through the
/// TLS-ALPN-01 challenge, and cached in `dir_cache`.
async fn start_acme_server(
    app: Router,
    addr: SocketAddr,
    dir_cache: String,
    hosts: Vec<String>,
    config: &HttpConfig,
    handle: Handle,
    redirect_handle: Handle,
) -> Result<(), ServerError> {
    let production = config.acme_production;
    let env_name = if production { "production" } else { "staging" };
    tracing::info!(
        %addr,
        hosts = ?hosts,
        cache = %dir_cache,
        environment = %env_name,
        "Starting HTTPS server (ACME)"
    );

    if !production {
        tracing::warn!(
            "Using Let's Encrypt staging environment - certificates will NOT be trusted by browsers. \
             Set acme_production = true for production use."
        );
    }
    install_crypto_provider();

    // Create cache directory if it doesn't exist
    std::fs::create_dir_all(&dir_cache).map_err(|e| {
        ServerError::TlsConfig(format!("Failed to create ACME cache directory '{}': {}", dir_cache, e))
    })?;

    let mut acme = AcmeConfig::new(hosts);
    if let Some(email) = &config.acme_email {
        acme = acme.contact_push(format!("mailto:{}", email));
    }
    let mut acme_state = acme
        .cache(DirCache::new(dir_cache))
        .directory_lets_encrypt(production)
        .state();

    let acceptor = acme_state.axum_acceptor(acme_state.default_rustls_config());

    // Spawn ACME event loop for certificate renewal
    tokio::spawn(async move {
        loop {
            match acme_state.next().await {
                Some(Ok(event)) => {
                    tracing::info!(event = ?event, "ACME event");
                }
                Some(Err(err)) => {
                    tracing::error!(error = %err, "ACME error");
                }
                None => {
                    tracing::debug!("ACME state stream ended");
                    break;
                }
            }
        }
    });

    if config.redirect_http {
        redirect::spawn_redirect_server(addr.ip(), config.redirect_port, addr.port(), redirect_handle);
    }

    let mut server = axum_server::bind(addr).handle(handle).acceptor(acceptor);
    configure_connections(server.http_builder(), config);

    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(ServerError::Serve)
}

/// Several rustls providers can end up compiled in; pin the process default.
fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Stop listener. Waits for the stop signal, then drains within `grace`.
async fn shutdown(
    stop: oneshot::Receiver<()>,
    served: oneshot::Receiver<()>,
    handle: Handle,
    redirect_handle: Handle,
    grace: Duration,
    errors: mpsc::Sender<ServerError>,
) {
    if stop.await.is_err() {
        // The server was dropped without being stopped.
        return;
    }

    tracing::info!(grace = ?grace, "HTTP server stopping");

    // The grace period is enforced here rather than by the handles, so that
    // `served` only resolves once every connection has finished or been cut.
    handle.graceful_shutdown(None);
    redirect_handle.graceful_shutdown(None);

    let mut served = served;
    if tokio::time::timeout(grace, &mut served).await.is_err() {
        let open = handle.connection_count();
        if open > 0 {
            let error = ServerError::Stop(format!(
                "Grace period of {:?} elapsed with {} connections still open",
                grace, open
            ));
            tracing::error!(error = %error, "Forcing connections closed");
            report(&errors, error);
        }

        handle.shutdown();
        redirect_handle.shutdown();
        let _ = served.await;
    }

    tracing::info!("HTTP server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RouteHandler;
    use axum::routing::get;

    struct Hello;

    impl RouteHandler for Hello {
        fn name(&self) -> &str {
            "hello"
        }

        fn register(&self, router: Router) -> Router {
            router.route("/", get(|| async { "hello" }))
        }
    }

    fn local_server(grace_secs: u64) -> Server {
        let registry = Registry::new();
        registry.add_handler(Hello);
        let config = HttpConfig {
            address: "127.0.0.1:0".to_string(),
            graceful_timeout_seconds: grace_secs,
            ..HttpConfig::default()
        };
        Server::new(config, Arc::new(registry))
    }

    async fn drain(mut errors: mpsc::Receiver<ServerError>) -> Vec<ServerError> {
        let mut collected = Vec::new();
        let deadline = Duration::from_secs(10);
        while let Ok(Some(e)) = tokio::time::timeout(deadline, errors.recv()).await {
            collected.push(e);
        }
        collected
    }

    #[tokio::test]
    async fn test_stop_before_serve_shuts_down_immediately() {
        let server = local_server(5);
        server.stop();

        let errors = server.serve();
        let errors = tokio::time::timeout(Duration::from_secs(5), drain(errors))
            .await
            .expect("server did not stop");
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        tokio::time::timeout(Duration::from_secs(5), server.local_addr())
            .await
            .expect("local_addr did not resolve after stop");
    }

    #[tokio::test]
    async fn test_second_serve_reports_already_serving() {
        let server = local_server(5);
        let first = server.serve();
        assert!(server.local_addr().await.is_some());

        let mut second = server.serve();
        assert!(matches!(second.recv().await, Some(ServerError::AlreadyServing)));
        assert!(second.recv().await.is_none());

        server.stop();
        assert!(drain(first).await.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_stop_is_noop() {
        let server = local_server(5);
        let errors = server.serve();
        server.local_addr().await;

        server.stop();
        server.stop();
        assert!(drain(errors).await.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_built_once() {
        let server = local_server(5);
        assert!(!server.pipeline.is_built());

        let _router = server.pipeline();
        assert!(server.pipeline.is_built());
        let errors = server.serve();
        server.stop();
        drain(errors).await;
        assert!(server.pipeline.is_built());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let config = HttpConfig {
            address: addr.to_string(),
            ..HttpConfig::default()
        };
        let server = Server::new(config, Arc::new(Registry::new()));
        let mut errors = server.serve();

        assert!(matches!(errors.recv().await, Some(ServerError::Serve(_))));
        let addr = tokio::time::timeout(Duration::from_secs(5), server.local_addr())
            .await
            .expect("local_addr did not resolve after a failed bind");
        assert!(addr.is_none());
        server.stop();
        assert!(drain(errors).await.is_empty());
    }

    struct Stalled;

    impl RouteHandler for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        fn register(&self, router: Router) -> Router {
            router.route(
                "/stalled",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "late"
                }),
            )
        }
    }

    #[tokio::test]
    async fn test_write_timeout_answers_408() {
        use tower::ServiceExt;

        let registry = Registry::new();
        registry.add_handler(Stalled);
        let config = HttpConfig {
            write_timeout_seconds: 1,
            ..HttpConfig::default()
        };
        let server = Server::new(config, Arc::new(registry));

        let request = http::Request::builder()
            .uri("/stalled")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            server.pipeline().oneshot(request),
        )
        .await
        .expect("write timeout did not fire")
        .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
