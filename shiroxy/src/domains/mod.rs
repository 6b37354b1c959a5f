//! Domain lifecycle: registration, certificate issuance, metadata
//! updates, removal.

pub mod acme;
pub mod store;

pub use acme::AcmeIssuer;
pub use store::{decode_record, encode_record, DomainRecord, DomainStatus, DomainStore};

use crate::error::Result;
use crate::webhook::WebhookDispatcher;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Facade the admin surface calls into. Owns the store and the issuer,
/// and emits lifecycle webhooks.
pub struct DomainManager {
    store: Arc<DomainStore>,
    issuer: AcmeIssuer,
    webhooks: Arc<WebhookDispatcher>,
}

impl DomainManager {
    pub fn new(store: Arc<DomainStore>, issuer: AcmeIssuer, webhooks: Arc<WebhookDispatcher>) -> Self {
        Self {
            store,
            issuer,
            webhooks,
        }
    }

    pub fn store(&self) -> &Arc<DomainStore> {
        &self.store
    }

    /// Register a domain and drive certificate issuance. Returns the
    /// HTTP-01 key authorization of the order. The record is persisted
    /// before issuance starts, so a failed order leaves an `inactive`
    /// record that `force_ssl` can retry.
    pub async fn register(
        &self,
        domain: &str,
        email: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String> {
        match self.store.insert_new(domain, email, metadata).await {
            Ok(_) => {
                self.webhooks
                    .fire("domain-register-success", json!({ "domain": domain }));
            }
            Err(e) => {
                self.webhooks.fire(
                    "domain-register-failed",
                    json!({ "domain": domain, "reason": e.to_string() }),
                );
                return Err(e);
            }
        }

        self.issue(domain).await
    }

    /// Retry issuance for an existing record.
    pub async fn force_ssl(&self, domain: &str) -> Result<String> {
        self.store.get(domain)?;
        self.issue(domain).await
    }

    async fn issue(&self, domain: &str) -> Result<String> {
        match self.issuer.issue(&self.store, domain).await {
            Ok(challenge_key) => {
                self.webhooks
                    .fire("domain-ssl-success", json!({ "domain": domain }));
                Ok(challenge_key)
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Certificate issuance failed");
                self.webhooks.fire(
                    "domain-ssl-failed",
                    json!({ "domain": domain, "reason": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    pub async fn update(
        &self,
        domain: &str,
        metadata: HashMap<String, String>,
    ) -> Result<DomainRecord> {
        self.store.update_metadata(domain, metadata).await
    }

    pub async fn remove(&self, domain: &str) -> Result<()> {
        self.store.remove(domain).await
    }

    pub fn get(&self, domain: &str) -> Result<DomainRecord> {
        self.store.get(domain)
    }

    pub fn list(&self) -> Vec<DomainRecord> {
        self.store.list()
    }
}
