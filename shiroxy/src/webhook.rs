//! Webhook event dispatcher
//!
//! Fire-and-forget delivery of lifecycle events to the globally
//! configured target. Events not listed in the configuration are dropped.
//! Failures are logged and never propagate to the caller.

use crate::config::WebhookConfig;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Payload POSTed to the webhook target.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event_name: String,
    pub data: serde_json::Value,
}

pub struct WebhookDispatcher {
    config: WebhookConfig,
    secret: String,
    tx: mpsc::UnboundedSender<WebhookPayload>,
}

impl WebhookDispatcher {
    /// Start the delivery task. `secret` comes from a restored snapshot
    /// when present, otherwise a fresh one is generated.
    pub fn start(config: WebhookConfig, secret: Option<String>) -> Self {
        let secret = secret
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let (tx, mut rx) = mpsc::unbounded_channel::<WebhookPayload>();

        let url = config.url.clone();
        let delivery_secret = secret.clone();
        tokio::spawn(async move {
            if url.is_empty() {
                // No target configured; drain and drop.
                while rx.recv().await.is_some() {}
                return;
            }

            let client: Client<HttpConnector, Full<Bytes>> =
                Client::builder(TokioExecutor::new()).build_http();

            while let Some(payload) = rx.recv().await {
                let body = match serde_json::to_vec(&payload) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, event = %payload.event_name, "Failed to encode webhook payload");
                        continue;
                    }
                };

                let request = Request::builder()
                    .method(Method::POST)
                    .uri(&url)
                    .header(CONTENT_TYPE, "application/json")
                    .header("x-shiroxy-secret", &delivery_secret)
                    .body(Full::new(Bytes::from(body)));

                let request = match request {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Failed to build webhook request");
                        continue;
                    }
                };

                match client.request(request).await {
                    Ok(response) => {
                        debug!(
                            event = %payload.event_name,
                            status = response.status().as_u16(),
                            "Webhook delivered"
                        );
                    }
                    Err(e) => {
                        warn!(event = %payload.event_name, error = %e, "Webhook delivery failed");
                    }
                }
            }
        });

        Self { config, secret, tx }
    }

    /// Queue an event for delivery. Unlisted events are dropped.
    pub fn fire(&self, event_name: &str, data: serde_json::Value) {
        if !self.config.events.iter().any(|e| e == event_name) {
            return;
        }
        let _ = self.tx.send(WebhookPayload {
            event_name: event_name.to_string(),
            data,
        });
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}
