//! Backend request forwarding
//!
//! Clones the inbound request into an outbound form: hop-by-hop headers
//! stripped, URL rewritten onto the selected server, X-Forwarded-*
//! applied, then sent through a shared pooled client. Bodies are never
//! buffered whole: request and response payloads stream chunk by chunk
//! through the pooled staging buffer, with gzip applied incrementally
//! when the response qualifies. Transport failures surface as
//! `ShiroxyError::Transport` so the caller can mark the server dead and
//! retry elsewhere. Protocol upgrades bypass stripping and tunnel raw
//! bytes in both directions.

use crate::error::{Result, ShiroxyError};
use crate::proxy::balancer::Server;
use crate::proxy::buffer_pool::BufferPool;
use crate::proxy::compression::{self, StreamingGzip};
use bytes::Bytes;
use futures::SinkExt;
use http::header::{
    HeaderMap, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_TYPE, HOST, UPGRADE, VARY,
};
use http::uri::Uri;
use http::StatusCode;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Deadline for connecting and receiving the upstream response head.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = BoxBody<Bytes, ShiroxyError>;

type PooledClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>;

/// An empty proxy body.
pub fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|e| match e {}).boxed()
}

/// A fully buffered proxy body, for error pages and other local
/// responses.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// Transport pool bookkeeping: connection churn at the granularity the
/// pooled client exposes, in-flight requests, and a rolling mean latency.
pub struct PoolStats {
    connections_created: IntCounter,
    connections_closed: IntCounter,
    connections_reused: IntCounter,
    in_flight: IntGauge,
    latency: Histogram,
    total_requests: AtomicU64,
    total_latency_micros: AtomicU64,
    seen_hosts: Mutex<HashSet<String>>,
}

/// Serializable stats view for the analytics surface.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub connections_created: u64,
    pub connections_closed: u64,
    pub connections_reused: u64,
    pub in_flight: i64,
    pub total_requests: u64,
    pub average_request_duration_micros: u64,
}

impl PoolStats {
    pub fn new(registry: &Registry) -> Self {
        let connections_created = IntCounter::with_opts(Opts::new(
            "shiroxy_upstream_connections_created_total",
            "Upstream connections opened",
        ))
        .expect("Failed to create connections_created metric");
        let connections_closed = IntCounter::with_opts(Opts::new(
            "shiroxy_upstream_connections_closed_total",
            "Upstream connections dropped after transport failure",
        ))
        .expect("Failed to create connections_closed metric");
        let connections_reused = IntCounter::with_opts(Opts::new(
            "shiroxy_upstream_connections_reused_total",
            "Requests served over a pooled upstream connection",
        ))
        .expect("Failed to create connections_reused metric");
        let in_flight = IntGauge::with_opts(Opts::new(
            "shiroxy_upstream_in_flight",
            "Upstream requests currently in flight",
        ))
        .expect("Failed to create in_flight metric");
        let latency = Histogram::with_opts(
            HistogramOpts::new(
                "shiroxy_upstream_request_duration_seconds",
                "Upstream time-to-response-head in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ]),
        )
        .expect("Failed to create latency metric");

        registry
            .register(Box::new(connections_created.clone()))
            .expect("Failed to register connections_created");
        registry
            .register(Box::new(connections_closed.clone()))
            .expect("Failed to register connections_closed");
        registry
            .register(Box::new(connections_reused.clone()))
            .expect("Failed to register connections_reused");
        registry
            .register(Box::new(in_flight.clone()))
            .expect("Failed to register in_flight");
        registry
            .register(Box::new(latency.clone()))
            .expect("Failed to register latency");

        Self {
            connections_created,
            connections_closed,
            connections_reused,
            in_flight,
            latency,
            total_requests: AtomicU64::new(0),
            total_latency_micros: AtomicU64::new(0),
            seen_hosts: Mutex::new(HashSet::new()),
        }
    }

    fn begin(&self, host: &str) {
        self.in_flight.inc();
        let mut seen = self.seen_hosts.lock().unwrap();
        if seen.insert(host.to_string()) {
            self.connections_created.inc();
        } else {
            self.connections_reused.inc();
        }
    }

    fn complete(&self, started: Instant, ok: bool) {
        self.in_flight.dec();
        let elapsed = started.elapsed();
        self.latency.observe(elapsed.as_secs_f64());
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if !ok {
            self.connections_closed.inc();
        }
    }

    fn forget_host(&self, host: &str) {
        self.seen_hosts.lock().unwrap().remove(host);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let total_micros = self.total_latency_micros.load(Ordering::Relaxed);
        PoolStatsSnapshot {
            connections_created: self.connections_created.get(),
            connections_closed: self.connections_closed.get(),
            connections_reused: self.connections_reused.get(),
            in_flight: self.in_flight.get(),
            total_requests: total,
            average_request_duration_micros: if total == 0 { 0 } else { total_micros / total },
        }
    }
}

pub struct Forwarder {
    client: PooledClient,
    stats: Arc<PoolStats>,
    buffer_pool: Arc<BufferPool>,
}

impl Forwarder {
    pub fn new(registry: &Registry, buffer_pool: Arc<BufferPool>) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        // Keep-alive pooling with bounded idle connections per backend.
        let client: PooledClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(120))
            .pool_max_idle_per_host(100)
            .build(https);

        Self {
            client,
            stats: Arc::new(PoolStats::new(registry)),
            buffer_pool,
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Stage an inbound request body through the pooled buffer so it
    /// streams to the upstream instead of being collected.
    pub fn spool_request<B>(&self, body: B) -> ProxyBody
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        spool_body(body, Arc::clone(&self.buffer_pool), false)
    }

    /// Forward a request to the server. The response head is awaited
    /// under the upstream deadline; the body then streams back through
    /// the pooled buffer, gzipped on the fly when it qualifies.
    pub async fn forward(
        &self,
        parts: &http::request::Parts,
        body: ProxyBody,
        server: &Server,
        client_ip: &str,
        inbound_tls: bool,
    ) -> Result<Response<ProxyBody>> {
        let accept_encoding = parts
            .headers
            .get(ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let request = build_outbound(parts, body, server, client_ip, inbound_tls)?;
        let host = server
            .url
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();

        self.stats.begin(&host);
        let started = Instant::now();

        let outcome = tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(request)).await;
        let result = match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ShiroxyError::Transport(e.to_string())),
            Err(_) => Err(ShiroxyError::Transport(format!(
                "upstream exceeded {}s deadline",
                UPSTREAM_TIMEOUT.as_secs()
            ))),
        };

        let ok = result.is_ok();
        self.stats.complete(started, ok);
        if !ok {
            self.stats.forget_host(&host);
        }

        let (mut response_parts, body) = result?.into_parts();

        debug!(
            server = %server.id,
            status = response_parts.status.as_u16(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Upstream responded"
        );

        strip_hop_by_hop(&mut response_parts.headers);

        // Gzip text-like payloads on the way through. The decision is
        // made on headers alone; the body itself streams.
        let content_type = response_parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let compress = !body.is_end_stream()
            && !response_parts.headers.contains_key(CONTENT_ENCODING)
            && compression::accepts_gzip(&accept_encoding)
            && compression::is_compressible_content_type(content_type);
        if compress {
            response_parts
                .headers
                .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            response_parts
                .headers
                .insert(VARY, HeaderValue::from_static("Accept-Encoding"));
            response_parts.headers.remove(CONTENT_LENGTH);
        }

        let body = spool_body(body, Arc::clone(&self.buffer_pool), compress);
        Ok(Response::from_parts(response_parts, body))
    }

    /// Tunnel a protocol upgrade: hop-by-hop stripping is skipped and raw
    /// bytes flow both ways until either side closes.
    pub async fn tunnel<B>(
        &self,
        mut req: Request<B>,
        server: &Server,
    ) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
    {
        let authority = server
            .url
            .authority()
            .cloned()
            .ok_or_else(|| ShiroxyError::Transport("server url has no authority".into()))?;
        let port = authority.port_u16().unwrap_or_else(|| {
            if server.url.scheme_str() == Some("https") {
                443
            } else {
                80
            }
        });

        let stream = TcpStream::connect((authority.host(), port))
            .await
            .map_err(|e| ShiroxyError::Transport(format!("connecting {authority}: {e}")))?;

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
                .await
                .map_err(|e| ShiroxyError::Transport(format!("handshake {authority}: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "Upgrade connection closed");
            }
        });

        let client_upgrade = hyper::upgrade::on(&mut req);

        let (parts, _body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut builder = Request::builder().method(parts.method.clone()).uri(path_and_query);
        for (name, value) in parts.headers.iter() {
            if name != HOST {
                builder = builder.header(name, value);
            }
        }
        builder = builder.header(HOST, authority.as_str());
        let outbound = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| ShiroxyError::Transport(format!("building upgrade request: {e}")))?;

        let mut response = tokio::time::timeout(UPSTREAM_TIMEOUT, sender.send_request(outbound))
            .await
            .map_err(|_| ShiroxyError::Transport("upgrade deadline exceeded".into()))?
            .map_err(|e| ShiroxyError::Transport(e.to_string()))?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            let pool = Arc::clone(&self.buffer_pool);
            tokio::spawn(async move {
                match (client_upgrade.await, upstream_upgrade.await) {
                    (Ok(client_io), Ok(upstream_io)) => {
                        tunnel_copy(TokioIo::new(client_io), TokioIo::new(upstream_io), pool)
                            .await;
                    }
                    (client, upstream) => {
                        debug!(
                            client_ok = client.is_ok(),
                            upstream_ok = upstream.is_ok(),
                            "Upgrade completion failed"
                        );
                    }
                }
            });
        }

        let (response_parts, _) = response.into_parts();
        Ok(Response::from_parts(response_parts, empty_body()))
    }
}

/// Whether the request asks for a protocol upgrade (websocket, h2c, ...).
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_has_upgrade = headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|s| {
                s.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false)
    });
    let upgrade_nonempty = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.is_empty())
        .unwrap_or(false);

    connection_has_upgrade && upgrade_nonempty
}

/// Remove the hop-by-hop set from a header map. The set is exact.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let to_remove: Vec<_> = headers
        .keys()
        .filter(|name| common::is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in to_remove {
        headers.remove(name);
    }
}

/// Rewrite the inbound URI onto the target server: scheme and authority
/// from the server record, single-slash path join preserving raw-path
/// escaping, query strings concatenated with `&` when both are present.
pub fn rewrite_uri(target: &Uri, inbound: &Uri) -> Result<Uri> {
    let scheme = target
        .scheme()
        .cloned()
        .ok_or_else(|| ShiroxyError::Transport("target url has no scheme".into()))?;
    let authority = target
        .authority()
        .cloned()
        .ok_or_else(|| ShiroxyError::Transport("target url has no authority".into()))?;

    let path = common::single_joining_slash(target.path(), inbound.path());
    let query = common::merge_raw_queries(
        target.query().unwrap_or(""),
        inbound.query().unwrap_or(""),
    );
    let path_and_query = if query.is_empty() {
        path
    } else {
        format!("{path}?{query}")
    };

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ShiroxyError::Transport(format!("rewriting url: {e}")))
}

/// Build the outbound request: hop-by-hop and Host dropped, rewritten
/// URI, X-Forwarded-For appended (preserving prior values),
/// X-Forwarded-Host and X-Forwarded-Proto set.
pub(crate) fn build_outbound(
    parts: &http::request::Parts,
    body: ProxyBody,
    server: &Server,
    client_ip: &str,
    inbound_tls: bool,
) -> Result<Request<ProxyBody>> {
    let uri = rewrite_uri(&server.url, &parts.uri)?;

    let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);

    let original_host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    for (name, value) in parts.headers.iter() {
        let name_str = name.as_str();
        if name_str == "host"
            || name_str == X_FORWARDED_FOR
            || common::is_hop_by_hop_header(name_str)
        {
            continue;
        }
        builder = builder.header(name, value);
    }

    // Append the client to any prior X-Forwarded-For chain.
    let prior: Vec<String> = parts
        .headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    let forwarded_for = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };

    builder = builder
        .header(X_FORWARDED_FOR, forwarded_for)
        .header(X_FORWARDED_HOST, &original_host)
        .header(
            X_FORWARDED_PROTO,
            if inbound_tls { "https" } else { "http" },
        );

    if let Some(authority) = server.url.authority() {
        builder = builder.header(HOST, authority.as_str());
    }

    builder
        .body(body)
        .map_err(|e| ShiroxyError::Transport(format!("building outbound request: {e}")))
}

/// Stream a body through a pooled staging buffer, optionally gzipping on
/// the way. Data frames are copied chunk by chunk via the buffer like the
/// tunnel path; trailer frames pass through untouched. The buffer goes
/// back to the pool when the stream ends.
fn spool_body<B>(body: B, pool: Arc<BufferPool>, compress: bool) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::fmt::Display + Send,
{
    let (mut tx, rx) = futures::channel::mpsc::channel::<
        std::result::Result<Frame<Bytes>, ShiroxyError>,
    >(2);

    tokio::spawn(async move {
        let mut body = Box::pin(body);
        let mut buf = pool.get();
        let mut encoder = compress.then(StreamingGzip::new);

        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    let _ = tx
                        .send(Err(ShiroxyError::Transport(format!("body stream: {e}"))))
                        .await;
                    pool.put(buf);
                    return;
                }
            };

            match frame.into_data() {
                Ok(data) => {
                    for chunk in data.chunks(buf.len()) {
                        // Stage through the pooled buffer.
                        buf[..chunk.len()].copy_from_slice(chunk);
                        let staged = &buf[..chunk.len()];

                        let out = match encoder.as_mut() {
                            Some(encoder) => match encoder.write(staged) {
                                Ok(ready) => {
                                    if ready.is_empty() {
                                        continue;
                                    }
                                    Bytes::from(ready)
                                }
                                Err(e) => {
                                    let _ = tx
                                        .send(Err(ShiroxyError::Transport(format!(
                                            "compressing body: {e}"
                                        ))))
                                        .await;
                                    pool.put(buf);
                                    return;
                                }
                            },
                            None => Bytes::copy_from_slice(staged),
                        };

                        if tx.send(Ok(Frame::data(out))).await.is_err() {
                            // Client went away; drop the upstream body.
                            pool.put(buf);
                            return;
                        }
                    }
                }
                Err(frame) => {
                    // Trailers flush any pending compressed output first.
                    if let Some(encoder) = encoder.as_mut() {
                        if let Ok(tail) = encoder.finish() {
                            if !tail.is_empty()
                                && tx.send(Ok(Frame::data(Bytes::from(tail)))).await.is_err()
                            {
                                pool.put(buf);
                                return;
                            }
                        }
                    }
                    if tx.send(Ok(frame)).await.is_err() {
                        pool.put(buf);
                        return;
                    }
                }
            }
        }

        if let Some(mut encoder) = encoder.take() {
            match encoder.finish() {
                Ok(tail) => {
                    if !tail.is_empty() {
                        let _ = tx.send(Ok(Frame::data(Bytes::from(tail)))).await;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(ShiroxyError::Transport(format!(
                            "finishing compression: {e}"
                        ))))
                        .await;
                }
            }
        }
        pool.put(buf);
    });

    StreamBody::new(rx).boxed()
}

async fn tunnel_copy<A, B>(a: A, b: B, pool: Arc<BufferPool>)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let mut forward = tokio::spawn(copy_with_pool(a_read, b_write, Arc::clone(&pool)));
    let mut backward = tokio::spawn(copy_with_pool(b_read, a_write, pool));

    // Either side closing tears down the whole tunnel.
    tokio::select! {
        _ = &mut forward => backward.abort(),
        _ = &mut backward => forward.abort(),
    }
}

async fn copy_with_pool<R, W>(mut reader: R, mut writer: W, pool: Arc<BufferPool>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    pool.put(buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use std::io::Read;
    use std::sync::Once;
    use tokio::net::TcpListener;

    static INIT: Once = Once::new();

    fn init_crypto() {
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn test_server(url: &str) -> Server {
        let server = Server::new(
            "s1".into(),
            url,
            &format!("{url}/health"),
            vec![],
        )
        .unwrap();
        server.set_alive(true);
        server
    }

    fn parts_for(uri: &str, headers: &[(&str, &str)]) -> http::request::Parts {
        let mut builder = Request::builder().method("GET").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn test_rewrite_uri_joins_paths() {
        let target: Uri = "http://10.0.0.1:8080/base".parse().unwrap();
        let inbound: Uri = "/dir/file".parse().unwrap();
        let rewritten = rewrite_uri(&target, &inbound).unwrap();
        assert_eq!(rewritten.to_string(), "http://10.0.0.1:8080/base/dir/file");
    }

    #[test]
    fn test_rewrite_uri_merges_queries() {
        let target: Uri = "http://10.0.0.1:8080/?env=prod".parse().unwrap();
        let inbound: Uri = "/search?q=1".parse().unwrap();
        let rewritten = rewrite_uri(&target, &inbound).unwrap();
        assert_eq!(
            rewritten.to_string(),
            "http://10.0.0.1:8080/search?env=prod&q=1"
        );
    }

    #[test]
    fn test_rewrite_uri_preserves_escaping() {
        let target: Uri = "http://10.0.0.1:8080".parse().unwrap();
        let inbound: Uri = "/a%20b/c?q=x%26y".parse().unwrap();
        let rewritten = rewrite_uri(&target, &inbound).unwrap();
        assert_eq!(rewritten.to_string(), "http://10.0.0.1:8080/a%20b/c?q=x%26y");
    }

    #[test]
    fn test_outbound_strips_hop_by_hop_and_host() {
        let server = test_server("http://10.0.0.1:8080");
        let parts = parts_for(
            "/x",
            &[
                ("host", "front.example.com"),
                ("connection", "keep-alive"),
                ("keep-alive", "timeout=5"),
                ("transfer-encoding", "chunked"),
                ("upgrade", "websocket"),
                ("proxy-authorization", "Basic xyz"),
                ("te", "trailers"),
                ("trailer", "Expires"),
                ("proxy-authenticate", "Basic"),
                ("x-custom", "kept"),
            ],
        );

        let out = build_outbound(&parts, empty_body(), &server, "10.1.1.1", false).unwrap();
        let headers = out.headers();
        for name in [
            "connection",
            "keep-alive",
            "transfer-encoding",
            "upgrade",
            "proxy-authorization",
            "proxy-authenticate",
            "te",
            "trailer",
        ] {
            assert!(headers.get(name).is_none(), "{name} must be stripped");
        }
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        assert_eq!(headers.get("host").unwrap(), "10.0.0.1:8080");
    }

    #[test]
    fn test_outbound_sets_forwarded_headers() {
        let server = test_server("http://10.0.0.1:8080");
        let parts = parts_for("/x", &[("host", "front.example.com")]);

        let out = build_outbound(&parts, empty_body(), &server, "10.1.1.1", true).unwrap();
        assert_eq!(out.headers().get(X_FORWARDED_FOR).unwrap(), "10.1.1.1");
        assert_eq!(
            out.headers().get(X_FORWARDED_HOST).unwrap(),
            "front.example.com"
        );
        assert_eq!(out.headers().get(X_FORWARDED_PROTO).unwrap(), "https");
    }

    #[test]
    fn test_outbound_appends_to_prior_forwarded_for() {
        let server = test_server("http://10.0.0.1:8080");
        let parts = parts_for(
            "/x",
            &[("host", "h"), ("x-forwarded-for", "203.0.113.7")],
        );

        let out = build_outbound(&parts, empty_body(), &server, "10.1.1.1", false).unwrap();
        assert_eq!(
            out.headers().get(X_FORWARDED_FOR).unwrap(),
            "203.0.113.7, 10.1.1.1"
        );
    }

    #[test]
    fn test_is_upgrade_request() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(!is_upgrade_request(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&headers));

        headers.insert(
            CONNECTION,
            HeaderValue::from_static("keep-alive, Upgrade"),
        );
        assert!(is_upgrade_request(&headers));
    }

    #[tokio::test]
    async fn test_spool_body_streams_through_pool() {
        // A body larger than the staging buffer comes out identical.
        let pool = Arc::new(BufferPool::new(64));
        let payload = Bytes::from("0123456789abcdef".repeat(100));
        let body = full_body(payload.clone());

        let spooled = spool_body(body, pool, false);
        let collected = spooled.collect().await.unwrap().to_bytes();
        assert_eq!(collected, payload);
    }

    #[tokio::test]
    async fn test_spool_body_gzip_round_trips() {
        let pool = Arc::new(BufferPool::new(64));
        let payload = b"compress me please ".repeat(200);
        let body = full_body(Bytes::from(payload.clone()));

        let spooled = spool_body(body, pool, true);
        let compressed = spooled.collect().await.unwrap().to_bytes();
        assert!(compressed.len() < payload.len());

        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    async fn spawn_backend<F>(handler: F) -> std::net::SocketAddr
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, hyper::Error>(handler(req)) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_returns_upstream_body() {
        let addr = spawn_backend(|_req| {
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain")
                .body(Full::new(Bytes::from("upstream-response")))
                .unwrap()
        })
        .await;

        init_crypto();
        let registry = Registry::new();
        let forwarder = Forwarder::new(&registry, Arc::new(BufferPool::default()));
        let server = test_server(&format!("http://{addr}"));
        let parts = parts_for("/", &[("host", "front")]);

        let response = forwarder
            .forward(&parts, empty_body(), &server, "10.0.0.1", false)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"upstream-response");
    }

    #[tokio::test]
    async fn test_forward_streams_request_body() {
        // Backend echoes the request body back.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let service = service_fn(|req: Request<Incoming>| async move {
                let body = req.into_body().collect().await.unwrap().to_bytes();
                Ok::<_, hyper::Error>(Response::new(Full::new(body)))
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await;
        });

        init_crypto();
        let registry = Registry::new();
        let forwarder = Forwarder::new(&registry, Arc::new(BufferPool::default()));
        let server = test_server(&format!("http://{addr}"));

        let (parts, body) = Request::builder()
            .method("POST")
            .uri("/echo")
            .header("host", "front")
            .body(Full::new(Bytes::from("post-data post-data")))
            .unwrap()
            .into_parts();
        let body = forwarder.spool_request(body);

        let response = forwarder
            .forward(&parts, body, &server, "10.0.0.1", false)
            .await
            .unwrap();
        let echoed = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&echoed[..], b"post-data post-data");
    }

    #[tokio::test]
    async fn test_forward_strips_response_hop_by_hop() {
        let addr = spawn_backend(|_req| {
            Response::builder()
                .status(StatusCode::OK)
                .header("keep-alive", "timeout=5")
                .header("x-kept", "yes")
                .body(Full::new(Bytes::from("ok")))
                .unwrap()
        })
        .await;

        init_crypto();
        let registry = Registry::new();
        let forwarder = Forwarder::new(&registry, Arc::new(BufferPool::default()));
        let server = test_server(&format!("http://{addr}"));
        let parts = parts_for("/", &[("host", "front")]);

        let response = forwarder
            .forward(&parts, empty_body(), &server, "10.0.0.1", false)
            .await
            .unwrap();
        assert!(response.headers().get("keep-alive").is_none());
        assert_eq!(response.headers().get("x-kept").unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_forward_gzips_text_when_accepted() {
        let payload = "<html>".repeat(100);
        let payload_for_backend = payload.clone();
        let addr = spawn_backend(move |_req| {
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/html")
                .body(Full::new(Bytes::from(payload_for_backend.clone())))
                .unwrap()
        })
        .await;

        init_crypto();
        let registry = Registry::new();
        let forwarder = Forwarder::new(&registry, Arc::new(BufferPool::default()));
        let server = test_server(&format!("http://{addr}"));
        let parts = parts_for("/", &[("host", "front"), ("accept-encoding", "gzip")]);

        let response = forwarder
            .forward(&parts, empty_body(), &server, "10.0.0.1", false)
            .await
            .unwrap();
        assert_eq!(response.headers().get(CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(response.headers().get(VARY).unwrap(), "Accept-Encoding");

        // The streamed body decodes back to the upstream payload.
        let compressed = response.into_body().collect().await.unwrap().to_bytes();
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_forward_never_gzips_binary() {
        let addr = spawn_backend(|_req| {
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "image/png")
                .body(Full::new(Bytes::from(vec![0u8; 512])))
                .unwrap()
        })
        .await;

        init_crypto();
        let registry = Registry::new();
        let forwarder = Forwarder::new(&registry, Arc::new(BufferPool::default()));
        let server = test_server(&format!("http://{addr}"));
        let parts = parts_for("/", &[("host", "front"), ("accept-encoding", "gzip")]);

        let response = forwarder
            .forward(&parts, empty_body(), &server, "10.0.0.1", false)
            .await
            .unwrap();
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_forward_connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        init_crypto();
        let registry = Registry::new();
        let forwarder = Forwarder::new(&registry, Arc::new(BufferPool::default()));
        let server = test_server(&format!("http://{addr}"));
        let parts = parts_for("/", &[("host", "front")]);

        let err = forwarder
            .forward(&parts, empty_body(), &server, "10.0.0.1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ShiroxyError::Transport(_)));
    }
}
