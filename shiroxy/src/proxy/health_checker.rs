//! Background health checking
//!
//! Owns the lifecycle of every server's alive bit. Each tick snapshots
//! the server list and probes every member independently with a HEAD
//! request whose timeout is strictly below the tick interval. A 2xx
//! response sets alive; anything else (transport error, non-2xx, timeout)
//! clears it. The first completed probe per server lifecycle emits a
//! one-time registration webhook. Probes never cancel in-flight user
//! requests.

use crate::proxy::balancer::{LoadBalancer, Server};
use crate::webhook::WebhookDispatcher;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use prometheus::{CounterVec, IntGaugeVec, Opts, Registry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

type ProbeClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Per-probe timeout, strictly less than the tick interval.
fn probe_timeout(interval: Duration) -> Duration {
    let scaled = interval.mul_f64(0.8);
    scaled.min(Duration::from_secs(10))
}

pub struct HealthChecker {
    interval_tx: mpsc::UnboundedSender<Duration>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl HealthChecker {
    /// Spawn the checking loop. Metrics register into the given registry.
    pub fn start(
        balancer: Arc<LoadBalancer>,
        webhooks: Arc<WebhookDispatcher>,
        interval: Duration,
        registry: &Registry,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let backend_alive = IntGaugeVec::new(
            Opts::new(
                "shiroxy_backend_alive",
                "Backend liveness (1=alive, 0=dead)",
            ),
            &["server"],
        )
        .expect("Failed to create backend_alive metric");
        let probes_total = CounterVec::new(
            Opts::new(
                "shiroxy_health_probes_total",
                "Total health probes by result",
            ),
            &["server", "result"], // result = success | failure | timeout
        )
        .expect("Failed to create probes_total metric");

        registry
            .register(Box::new(backend_alive.clone()))
            .expect("Failed to register backend_alive");
        registry
            .register(Box::new(probes_total.clone()))
            .expect("Failed to register probes_total");

        let (interval_tx, mut interval_rx) = mpsc::unbounded_channel::<Duration>();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client: ProbeClient = Client::builder(TokioExecutor::new()).build(https);

        let handle = tokio::spawn(async move {
            let mut period = interval;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut probes: JoinSet<()> = JoinSet::new();

            info!(interval_secs = period.as_secs(), "Health checker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let servers = balancer.servers();
                        let timeout = probe_timeout(period);
                        for server in servers {
                            let client = client.clone();
                            let webhooks = Arc::clone(&webhooks);
                            let backend_alive = backend_alive.clone();
                            let probes_total = probes_total.clone();
                            probes.spawn(async move {
                                probe(server, client, timeout, webhooks, backend_alive, probes_total)
                                    .await;
                            });
                        }
                    }
                    Some(new_period) = interval_rx.recv() => {
                        period = new_period;
                        ticker = tokio::time::interval_at(
                            tokio::time::Instant::now() + period,
                            period,
                        );
                        info!(interval_secs = period.as_secs(), "Health check interval updated");
                    }
                    Some(_) = probes.join_next(), if !probes.is_empty() => {}
                    _ = &mut stop_rx => break,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            // Drain in-flight probes before returning.
            while probes.join_next().await.is_some() {}
            info!("Health checker stopped");
        });

        Self {
            interval_tx,
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    /// Replace the tick period; subsequent ticks use the new duration.
    pub fn update_interval(&self, period: Duration) {
        let _ = self.interval_tx.send(period);
    }

    /// Terminate the loop, blocking until in-flight probes drain.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let _ = self.handle.await;
    }
}

async fn probe(
    server: Arc<Server>,
    client: ProbeClient,
    timeout: Duration,
    webhooks: Arc<WebhookDispatcher>,
    backend_alive: IntGaugeVec,
    probes_total: CounterVec,
) {
    let request = Request::builder()
        .method(Method::HEAD)
        .uri(server.health_check_url.clone())
        .body(Full::new(Bytes::new()));

    let request = match request {
        Ok(request) => request,
        Err(e) => {
            warn!(server = %server.id, error = %e, "Failed to build probe request");
            return;
        }
    };

    let outcome = tokio::time::timeout(timeout, client.request(request)).await;
    let (healthy, result_label) = match &outcome {
        Ok(Ok(response)) if response.status().is_success() => (true, "success"),
        Ok(Ok(response)) => {
            debug!(
                server = %server.id,
                status = response.status().as_u16(),
                "Probe returned non-2xx"
            );
            (false, "failure")
        }
        Ok(Err(e)) => {
            debug!(server = %server.id, error = %e, "Probe transport error");
            (false, "failure")
        }
        Err(_) => {
            warn!(server = %server.id, timeout_ms = timeout.as_millis() as u64, "Probe timed out");
            (false, "timeout")
        }
    };

    server.set_alive(healthy);
    backend_alive
        .with_label_values(&[&server.id])
        .set(if healthy { 1 } else { 0 });
    probes_total
        .with_label_values(&[&server.id, result_label])
        .inc();

    // One registration event per server lifecycle, after the first
    // completed probe.
    if server.take_first_probe() {
        let event = if healthy {
            "backendserver.register.success"
        } else {
            "backendserver.register.failed"
        };
        let host = server
            .url
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        webhooks.fire(event, json!({ "host": host, "id": server.id }));
        info!(server = %server.id, healthy = healthy, "First probe completed");
    }
}
