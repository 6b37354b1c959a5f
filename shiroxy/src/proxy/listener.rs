//! Frontend listeners
//!
//! One accept loop per configured bind. Secure binds terminate TLS with a
//! store-backed SNI resolver (or a fixed key pair for single-target
//! binds); plain binds serve the ACME challenge path and the metrics
//! exposition. Requests then flow host -> tag -> balancer -> forwarder,
//! with transport failures retried on other servers. A per-request
//! recovery boundary turns panics into the templated error page.

use crate::config::{BindTarget, Config, FrontendBind, SingleTargetMode};
use crate::domains::{DomainStatus, DomainStore};
use crate::error::{Result, ShiroxyError};
use crate::proxy::balancer::{LoadBalancer, MAX_RETRIES};
use crate::proxy::forwarder::{empty_body, full_body, is_upgrade_request, Forwarder, ProxyBody};
use crate::proxy::tls;
use crate::public;
use bytes::Bytes;
use futures::FutureExt;
use http::header::{CONTENT_TYPE, HOST, LOCATION};
use http::{Method, StatusCode, Uri};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

pub struct Frontend {
    binds: Vec<FrontendBind>,
    http_to_https: bool,
    has_secure_443: bool,
    store: Arc<DomainStore>,
    balancer: Arc<LoadBalancer>,
    forwarder: Arc<Forwarder>,
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    domain_not_found_page: String,
    proxy_not_ready_page: String,
}

impl Frontend {
    pub fn new(
        config: &Config,
        store: Arc<DomainStore>,
        balancer: Arc<LoadBalancer>,
        forwarder: Arc<Forwarder>,
        registry: Registry,
    ) -> Self {
        let requests_total = IntCounterVec::new(
            Opts::new("shiroxy_http_requests_total", "Total requests served"),
            &["method", "status"],
        )
        .expect("Failed to create requests_total metric");
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "shiroxy_http_request_duration_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ]),
            &["method", "status"],
        )
        .expect("Failed to create request_duration metric");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("Failed to register requests_total");
        registry
            .register(Box::new(request_duration.clone()))
            .expect("Failed to register request_duration");

        let has_secure_443 = config.frontend.bind.iter().any(|b| b.port == 443 && b.secure);

        Self {
            binds: config.frontend.bind.clone(),
            http_to_https: config.frontend.http_to_https,
            has_secure_443,
            store,
            balancer,
            forwarder,
            registry,
            requests_total,
            request_duration,
            domain_not_found_page: public::render_error_page(
                public::DOMAIN_NOT_FOUND_ERROR,
                &config.default.error_responses,
            ),
            proxy_not_ready_page: public::render_error_page(
                public::PROXY_NOT_READY,
                &config.default.error_responses,
            ),
        }
    }

    /// Bind every configured frontend and spawn its accept loop. Bind or
    /// TLS setup failures are fatal at startup. Returns the bound
    /// addresses alongside the loop handles.
    pub async fn spawn_binds(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<(SocketAddr, JoinHandle<()>)>> {
        let mut handles = Vec::new();

        for bind in self.binds.clone() {
            let tls_acceptor = self.tls_acceptor_for(&bind)?;
            let addr = format!("{}:{}", bind.host, bind.port);
            let listener = TcpListener::bind(&addr).await.map_err(|e| {
                ShiroxyError::Config(format!("binding {addr}: {e}"))
            })?;
            let local_addr = listener
                .local_addr()
                .map_err(|e| ShiroxyError::Config(format!("resolving {addr}: {e}")))?;

            info!(
                addr = %local_addr,
                secure = bind.secure,
                target = ?bind.target,
                "Frontend listening"
            );

            let frontend = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            let bind_port = bind.port;

            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = listener.accept() => {
                            let (stream, peer) = match result {
                                Ok(pair) => pair,
                                Err(e) => {
                                    warn!(error = %e, "Accept failed");
                                    continue;
                                }
                            };

                            let frontend = Arc::clone(&frontend);
                            let tls_acceptor = tls_acceptor.clone();
                            tokio::spawn(async move {
                                match tls_acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            frontend
                                                .serve_connection(tls_stream, true, bind_port, peer)
                                                .await;
                                        }
                                        Err(e) => {
                                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                                        }
                                    },
                                    None => {
                                        frontend
                                            .serve_connection(stream, false, bind_port, peer)
                                            .await;
                                    }
                                }
                            });
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!(port = bind_port, "Frontend shutting down");
                                break;
                            }
                        }
                    }
                }
            });
            handles.push((local_addr, handle));
        }

        Ok(handles)
    }

    fn tls_acceptor_for(&self, bind: &FrontendBind) -> Result<Option<TlsAcceptor>> {
        if !bind.secure {
            return Ok(None);
        }

        let verify = bind.secure_setting.secure_verify;
        let server_config = match bind.target {
            BindTarget::Multiple => tls::multi_target_config(Arc::clone(&self.store), verify)?,
            BindTarget::Single => match bind.secure_setting.single_target_mode {
                Some(SingleTargetMode::CertAndKey) => tls::single_target_file_config(
                    Path::new(&bind.secure_setting.cert_and_key.cert),
                    Path::new(&bind.secure_setting.cert_and_key.key),
                    verify,
                )?,
                Some(SingleTargetMode::ShiroxyShingleSecure) => tls::single_target_store_config(
                    Arc::clone(&self.store),
                    bind.secure_setting.cert_and_key.domain.clone(),
                    verify,
                )?,
                None => {
                    return Err(ShiroxyError::Config(format!(
                        "bind :{} is single-target secure without a single_target_mode",
                        bind.port
                    )))
                }
            },
        };

        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    }

    async fn serve_connection<S>(
        self: &Arc<Self>,
        stream: S,
        secure: bool,
        bind_port: u16,
        peer: SocketAddr,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let frontend = Arc::clone(self);
        let service = service_fn(move |req| {
            let frontend = Arc::clone(&frontend);
            async move {
                Ok::<_, Infallible>(frontend.handle(req, secure, bind_port, peer).await)
            }
        });

        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
        {
            debug!(peer = %peer, error = %e, "Connection closed with error");
        }
    }

    /// Per-request entry point with the recovery boundary and request
    /// metrics around it.
    pub(crate) async fn handle<B>(
        self: Arc<Self>,
        req: Request<B>,
        secure: bool,
        bind_port: u16,
        peer: SocketAddr,
    ) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let started = Instant::now();
        let method = req.method().to_string();

        let frontend = Arc::clone(&self);
        let outcome = AssertUnwindSafe(frontend.handle_inner(req, secure, bind_port, peer))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(_panic) => {
                error!("Recovered from panic in request handler");
                self.error_page(StatusCode::BAD_REQUEST, &self.domain_not_found_page)
            }
        };

        let status = response.status().as_u16().to_string();
        self.requests_total
            .with_label_values(&[&method, &status])
            .inc();
        self.request_duration
            .with_label_values(&[&method, &status])
            .observe(started.elapsed().as_secs_f64());

        response
    }

    async fn handle_inner<B>(
        self: Arc<Self>,
        req: Request<B>,
        secure: bool,
        bind_port: u16,
        peer: SocketAddr,
    ) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let path = req.uri().path().to_string();

        // ACME challenges are answered on plain binds before any redirect
        // so validation succeeds even with http_to_https on.
        if !secure {
            if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
                return self.serve_challenge(token);
            }

            if path == "/metrics" && req.method() == Method::GET {
                return self.serve_metrics();
            }
        }

        let host_header = host_of(&req);

        if self.http_to_https && bind_port == 80 && !secure && self.has_secure_443 {
            return redirect_to_https(&host_header, req.uri());
        }

        let client_ip = peer.ip().to_string();
        let domain = strip_port(&host_header);

        let mut tag = String::new();
        if !domain.is_empty() && domain.parse::<IpAddr>().is_err() {
            match self.store.get(&domain) {
                Ok(record) => {
                    if !secure && record.status == DomainStatus::Inactive {
                        // No certificate yet; the domain is not routable.
                        return self
                            .error_page(StatusCode::NOT_FOUND, &self.domain_not_found_page);
                    }
                    tag = record.metadata.get("tags").cloned().unwrap_or_default();
                }
                Err(_) => {
                    return self.error_page(StatusCode::NOT_FOUND, &self.domain_not_found_page);
                }
            }
        }

        if is_upgrade_request(req.headers()) {
            return self.handle_upgrade(req, &client_ip, &tag).await;
        }

        let (parts, body) = req.into_parts();

        // A request without a body can be replayed, so transport failures
        // retry on other servers up to the bounded count. A streamed body
        // is one-shot: the failing server is still marked dead, but the
        // request cannot be resent. Nothing has been written to the
        // client at retry time, so replays are safe.
        if body.is_end_stream() {
            let mut last_error = None;
            for _ in 0..=MAX_RETRIES {
                let server = match self.balancer.select(&client_ip, &tag) {
                    Ok(server) => server,
                    Err(e) => {
                        last_error = Some(e);
                        break;
                    }
                };

                match self
                    .forwarder
                    .forward(&parts, empty_body(), &server, &client_ip, secure)
                    .await
                {
                    Ok(response) => {
                        self.balancer.release(&tag, &server.id);
                        return response;
                    }
                    Err(ShiroxyError::Transport(cause)) => {
                        warn!(server = %server.id, error = %cause, "Transport failure, retrying");
                        self.balancer.mark_dead(&server.id);
                        self.balancer.release(&tag, &server.id);
                        last_error = Some(ShiroxyError::Transport(cause));
                    }
                    Err(e) => {
                        self.balancer.release(&tag, &server.id);
                        last_error = Some(e);
                        break;
                    }
                }
            }

            return self.proxy_error_page(last_error);
        }

        let server = match self.balancer.select(&client_ip, &tag) {
            Ok(server) => server,
            Err(e) => return self.proxy_error_page(Some(e)),
        };

        // Stream the inbound body to the upstream through the pooled
        // staging buffer.
        let body = self.forwarder.spool_request(body);
        let result = self
            .forwarder
            .forward(&parts, body, &server, &client_ip, secure)
            .await;
        self.balancer.release(&tag, &server.id);

        match result {
            Ok(response) => response,
            Err(ShiroxyError::Transport(cause)) => {
                warn!(server = %server.id, error = %cause, "Transport failure on streamed request");
                self.balancer.mark_dead(&server.id);
                self.proxy_error_page(Some(ShiroxyError::Transport(cause)))
            }
            Err(e) => self.proxy_error_page(Some(e)),
        }
    }

    fn proxy_error_page(&self, error: Option<ShiroxyError>) -> Response<ProxyBody> {
        match error {
            Some(ShiroxyError::NoServers(_)) => {
                self.error_page(StatusCode::SERVICE_UNAVAILABLE, &self.proxy_not_ready_page)
            }
            _ => self.error_page(StatusCode::BAD_GATEWAY, &self.proxy_not_ready_page),
        }
    }

    async fn handle_upgrade<B>(
        &self,
        req: Request<B>,
        client_ip: &str,
        tag: &str,
    ) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let server = match self.balancer.select(client_ip, tag) {
            Ok(server) => server,
            Err(_) => {
                return self
                    .error_page(StatusCode::SERVICE_UNAVAILABLE, &self.proxy_not_ready_page)
            }
        };

        let result = self.forwarder.tunnel(req, &server).await;
        self.balancer.release(tag, &server.id);

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!(server = %server.id, error = %e, "Upgrade tunnel failed");
                self.balancer.mark_dead(&server.id);
                self.error_page(StatusCode::BAD_GATEWAY, &self.proxy_not_ready_page)
            }
        }
    }

    fn serve_challenge(&self, token: &str) -> Response<ProxyBody> {
        match self.store.challenge_key_for_token(token) {
            Some(key) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain")
                .body(full_body(key))
                .unwrap_or_else(|_| Response::new(empty_body())),
            None => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header(CONTENT_TYPE, "text/plain")
                .body(full_body("challenge not found"))
                .unwrap_or_else(|_| Response::new(empty_body())),
        }
    }

    fn serve_metrics(&self) -> Response<ProxyBody> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return self.error_page(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable");
        }

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(full_body(buffer))
            .unwrap_or_else(|_| Response::new(empty_body()))
    }

    fn error_page(&self, status: StatusCode, body: &str) -> Response<ProxyBody> {
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/html")
            .body(full_body(body.to_string()))
            .unwrap_or_else(|_| Response::new(empty_body()))
    }
}

/// Host from the Host header (HTTP/1.1) or the URI authority (HTTP/2).
fn host_of<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Strip a trailing port, handling bracketed IPv6 literals.
fn strip_port(host: &str) -> String {
    let host = host.trim();
    if let Some(stripped) = host.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return stripped[..end].to_string();
        }
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) && !name.contains(':') => {
            name.to_string()
        }
        _ => host.to_string(),
    }
}

/// 301 to the same host and path over https, with the inbound port
/// stripped and the raw query preserved.
fn redirect_to_https(host: &str, uri: &Uri) -> Response<ProxyBody> {
    let host = strip_port(host);
    let path = uri.path();
    let location = match uri.query() {
        Some(query) => format!("https://{host}{path}?{query}"),
        None => format!("https://{host}{path}"),
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::proxy::balancer::Server;
    use crate::proxy::buffer_pool::BufferPool;
    use http_body_util::{BodyExt, Full};

    fn test_config(toml_extra: &str) -> Config {
        let toml = format!(
            r#"
                [frontend]
                {toml_extra}

                [[frontend.bind]]
                port = 8080

                [backend]
            "#
        );
        toml::from_str(&toml).unwrap()
    }

    static INIT: std::sync::Once = std::sync::Once::new();

    fn init_crypto() {
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn frontend_with(config: &Config, servers: Vec<Server>) -> Arc<Frontend> {
        init_crypto();
        let registry = Registry::new();
        let store = Arc::new(DomainStore::in_memory());
        let balancer = Arc::new(LoadBalancer::new(
            config.backend.balance,
            config.backend.tag_rule,
            config.backend.no_server_action,
            servers,
        ));
        let forwarder = Arc::new(Forwarder::new(&registry, Arc::new(BufferPool::default())));
        Arc::new(Frontend::new(
            config,
            store,
            balancer,
            forwarder,
            registry,
        ))
    }

    fn peer() -> SocketAddr {
        "10.9.9.9:55555".parse().unwrap()
    }

    fn get(uri: &str, host: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(HOST, host)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("127.0.0.1:8080"), "127.0.0.1");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[tokio::test]
    async fn test_redirect_strips_port_and_keeps_query() {
        let mut config = test_config("http_to_https = true");
        config.frontend.bind[0].port = 443;
        config.frontend.bind[0].secure = true;
        let frontend = frontend_with(&config, vec![]);

        let response = frontend
            .handle(
                get("/a/b?x=1&y=2", "example.com:80"),
                false,
                80,
                peer(),
            )
            .await;

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://example.com/a/b?x=1&y=2"
        );
    }

    #[tokio::test]
    async fn test_challenge_served_before_redirect() {
        let mut config = test_config("http_to_https = true");
        config.frontend.bind[0].port = 443;
        config.frontend.bind[0].secure = true;
        let frontend = frontend_with(&config, vec![]);

        let mut record = crate::domains::DomainRecord::new(
            "example.com".into(),
            "ops@example.com".into(),
            Default::default(),
        );
        record.dns_challenge_key = "tok.auth".into();
        frontend.store.put(record).await.unwrap();
        frontend.store.set_challenge_token("tok", "example.com");

        let response = frontend
            .handle(
                get("/.well-known/acme-challenge/tok", "example.com:80"),
                false,
                80,
                peer(),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"tok.auth");
    }

    #[tokio::test]
    async fn test_unknown_challenge_token_is_404() {
        let config = test_config("");
        let frontend = frontend_with(&config, vec![]);

        let response = frontend
            .handle(
                get("/.well-known/acme-challenge/missing", "example.com"),
                false,
                80,
                peer(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_domain_serves_error_page() {
        let config = test_config("");
        let frontend = frontend_with(&config, vec![]);

        let response = frontend
            .handle(get("/", "nowhere.example.com"), false, 8080, peer())
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8_lossy(&body);
        assert!(html.contains("Oops! Page not found."));
    }

    #[tokio::test]
    async fn test_no_servers_serves_not_ready_page() {
        let config = test_config("");
        let frontend = frontend_with(&config, vec![]);

        let response = frontend
            .handle(get("/", "127.0.0.1:8080"), false, 8080, peer())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("Proxy not ready."));
    }

    #[tokio::test]
    async fn test_metrics_exposition_on_plain_bind() {
        let config = test_config("");
        let frontend = frontend_with(&config, vec![]);

        // Serve one request first so the counters carry samples.
        let _ = Arc::clone(&frontend)
            .handle(get("/", "nowhere.example.com"), false, 8080, peer())
            .await;

        let response = frontend
            .handle(get("/metrics", "127.0.0.1:8080"), false, 8080, peer())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("# HELP"));
        assert!(text.contains("shiroxy_http_requests_total"));
    }
}
