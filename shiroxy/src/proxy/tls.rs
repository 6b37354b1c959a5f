//! TLS termination with rustls and dynamic SNI
//!
//! Certificates for multi-target binds are resolved per ClientHello from
//! the domain store; a domain without an active record fails the
//! handshake. Single-target binds either load a fixed key pair from disk
//! or restrict the store-backed resolver to one server name.

use crate::config::SecureVerify;
use crate::domains::{DomainStatus, DomainStore};
use crate::error::{Result, ShiroxyError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Parse PEM chain and key into a rustls `CertifiedKey`.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey> {
    let mut cert_reader = BufReader::new(cert_pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ShiroxyError::Tls(format!("parsing certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ShiroxyError::Tls("no certificates found in PEM".into()));
    }

    let mut key_reader = BufReader::new(key_pem);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ShiroxyError::Tls(format!("parsing private key PEM: {e}")))?
        .ok_or_else(|| ShiroxyError::Tls("no private key found in PEM".into()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| ShiroxyError::Tls(format!("unusable private key: {e}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// SNI resolver backed by the domain store. The PEM pair is parsed per
/// handshake; records are small and handshakes already dominate.
pub struct DomainCertResolver {
    store: Arc<DomainStore>,
    /// When set, only this server name resolves (shiroxyshinglesecure).
    restrict_to: Option<String>,
}

impl DomainCertResolver {
    pub fn new(store: Arc<DomainStore>) -> Self {
        Self {
            store,
            restrict_to: None,
        }
    }

    pub fn restricted(store: Arc<DomainStore>, server_name: String) -> Self {
        Self {
            store,
            restrict_to: Some(server_name),
        }
    }

    fn resolve_for(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let domain = server_name.trim().to_lowercase();

        if let Some(only) = &self.restrict_to {
            if !only.eq_ignore_ascii_case(&domain) {
                debug!(domain = %domain, "SNI outside the configured server name");
                return None;
            }
        }

        let record = self.store.get(&domain).ok()?;
        if record.status != DomainStatus::Active {
            debug!(domain = %domain, "Domain not active, failing handshake");
            return None;
        }

        match certified_key_from_pem(&record.cert_chain_pem, &record.cert_key_pem) {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                warn!(domain = %domain, error = %e, "Stored certificate is unusable");
                None
            }
        }
    }
}

impl std::fmt::Debug for DomainCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainCertResolver")
            .field("restrict_to", &self.restrict_to)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for DomainCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        self.resolve_for(server_name)
    }
}

/// Resolver handing out one fixed certificate, for `certandkey` binds.
#[derive(Debug)]
struct StaticCertResolver {
    key: Arc<CertifiedKey>,
}

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }
}

fn config_builder(
    verify: SecureVerify,
) -> Result<rustls::ConfigBuilder<ServerConfig, rustls::server::WantsServerCert>> {
    let builder = ServerConfig::builder();
    let builder = match verify {
        SecureVerify::None => builder.with_no_client_auth(),
        SecureVerify::Optional | SecureVerify::Required => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = match verify {
                SecureVerify::Optional => verifier_builder.allow_unauthenticated().build(),
                _ => verifier_builder.build(),
            }
            .map_err(|e| ShiroxyError::Tls(format!("client auth verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
    };
    Ok(builder)
}

fn finish(config: &mut ServerConfig) {
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
}

/// TLS config for multi-target binds: every registered active domain is
/// servable, selected by SNI.
pub fn multi_target_config(store: Arc<DomainStore>, verify: SecureVerify) -> Result<ServerConfig> {
    let mut config =
        config_builder(verify)?.with_cert_resolver(Arc::new(DomainCertResolver::new(store)));
    finish(&mut config);
    Ok(config)
}

/// TLS config for `shiroxyshinglesecure`: store-backed but restricted to
/// one server name.
pub fn single_target_store_config(
    store: Arc<DomainStore>,
    server_name: String,
    verify: SecureVerify,
) -> Result<ServerConfig> {
    let resolver = DomainCertResolver::restricted(store, server_name);
    let mut config = config_builder(verify)?.with_cert_resolver(Arc::new(resolver));
    finish(&mut config);
    Ok(config)
}

/// TLS config for `certandkey`: key pair loaded from disk at bind time.
pub fn single_target_file_config(
    cert_path: &Path,
    key_path: &Path,
    verify: SecureVerify,
) -> Result<ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| ShiroxyError::Tls(format!("reading {}: {e}", cert_path.display())))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| ShiroxyError::Tls(format!("reading {}: {e}", key_path.display())))?;
    let key = certified_key_from_pem(&cert_pem, &key_pem)?;

    let mut config = config_builder(verify)?
        .with_cert_resolver(Arc::new(StaticCertResolver { key: Arc::new(key) }));
    finish(&mut config);
    Ok(config)
}
