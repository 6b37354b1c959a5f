//! ACME certificate issuance
//!
//! Drives the RFC 8555 flow against the configured directory: one shared
//! account for every domain, a single `dns` identifier per order, HTTP-01
//! challenges served by the frontend listener, EC P-256 leaf keys, and
//! PEM chain download onto the domain record.

use crate::config::{Config, EnvironmentName};
use crate::domains::store::{DomainRecord, DomainStatus, DomainStore};
use crate::error::{AcmePhase, Result, ShiroxyError};
use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, HttpClient, Identifier,
    NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory (testing).
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Default directory for dev environments (local pebble).
pub const DEV_DIRECTORY: &str = "https://127.0.0.1:14000/dir";

/// Upper bound on waiting for validation and certificate issuance.
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Delay between order status polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

const CREDENTIALS_FILE: &str = "acme-account.json";

/// ACME issuer holding the shared account.
pub struct AcmeIssuer {
    directory_url: String,
    insecure_skip_verify: bool,
    credentials_path: PathBuf,
    /// Cached account plus its serialized credentials; created lazily on
    /// the first registration.
    account: Mutex<Option<(Account, Vec<u8>)>>,
}

impl AcmeIssuer {
    pub fn from_config(config: &Config) -> Self {
        let directory_url = if config.environment.acme_server_url.is_empty() {
            match config.environment.name {
                EnvironmentName::Dev => DEV_DIRECTORY.to_string(),
                _ => LETS_ENCRYPT_PRODUCTION.to_string(),
            }
        } else {
            config.environment.acme_server_url.clone()
        };

        Self {
            directory_url,
            insecure_skip_verify: config.acme_insecure_skip_verify(),
            credentials_path: PathBuf::from(&config.default.data_persistance_path)
                .join(CREDENTIALS_FILE),
            account: Mutex::new(None),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// Run the full issuance flow for a domain, returning the HTTP-01 key
    /// authorization used. On success the record is `Active` with the PEM
    /// chain and key installed; on failure the record stays `Inactive`
    /// and is retryable via force_ssl.
    pub async fn issue(&self, store: &Arc<DomainStore>, domain: &str) -> Result<String> {
        let record = store.get(domain)?;
        let (account, credential_bytes) = self.account_for(&record.email).await?;

        // The account key bytes ride on the record so a restored snapshot
        // can still prove ownership of its orders.
        let mut record = record;
        record.acme_account_key = credential_bytes;
        store.put(record.clone()).await?;

        match self.run_order(store, domain, &account, &mut record).await {
            Ok(challenge_key) => Ok(challenge_key),
            Err(e) => {
                // The order is over; the token index and the pending key
                // must not outlive it.
                store.clear_challenges_for_domain(domain);
                if !record.dns_challenge_key.is_empty() {
                    record.dns_challenge_key.clear();
                    if let Err(put_err) = store.put(record).await {
                        error!(domain = %domain, error = %put_err,
                            "Failed to clear challenge key after order failure");
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_order(
        &self,
        store: &Arc<DomainStore>,
        domain: &str,
        account: &Account,
        record: &mut DomainRecord,
    ) -> Result<String> {
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| ShiroxyError::acme(AcmePhase::Order, e))?;

        debug!(domain = %domain, "Created ACME order");

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| ShiroxyError::acme(AcmePhase::Authorization, e))?;

        let mut challenge_key = String::new();
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    ShiroxyError::acme(
                        AcmePhase::Challenge,
                        format!("no http-01 challenge offered for {domain}"),
                    )
                })?;

            let key_authorization = order.key_authorization(challenge);
            challenge_key = key_authorization.as_str().to_string();
            store.set_challenge_token(&challenge.token, domain);
            record.dns_challenge_key = challenge_key.clone();
            store.put(record.clone()).await?;

            info!(
                domain = %domain,
                token = %challenge.token,
                "Stored HTTP-01 challenge, signalling CA to validate"
            );

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| ShiroxyError::acme(AcmePhase::Challenge, e))?;
        }

        self.poll_until_ready(&mut order, domain).await?;

        // Fresh EC P-256 key for the leaf; SAN = {domain}.
        let key_pair = KeyPair::generate()
            .map_err(|e| ShiroxyError::acme(AcmePhase::Finalize, e))?;
        let params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| ShiroxyError::acme(AcmePhase::Finalize, e))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| ShiroxyError::acme(AcmePhase::Finalize, e))?;

        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| ShiroxyError::acme(AcmePhase::Finalize, e))?;
        }

        let chain_pem = self.download_chain(&mut order, domain).await?;
        validate_chain(&chain_pem)?;

        record.cert_chain_pem = chain_pem.into_bytes();
        record.cert_key_pem = key_pair.serialize_pem().into_bytes();
        record.dns_challenge_key.clear();
        record.status = DomainStatus::Active;
        store.put(record.clone()).await?;
        store.clear_challenges_for_domain(domain);

        info!(domain = %domain, "Certificate issued");
        Ok(challenge_key)
    }

    async fn poll_until_ready(
        &self,
        order: &mut instant_acme::Order,
        domain: &str,
    ) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() > VALIDATION_TIMEOUT {
                return Err(ShiroxyError::acme(
                    AcmePhase::Poll,
                    format!("validation for {domain} did not complete within {VALIDATION_TIMEOUT:?}"),
                ));
            }

            order
                .refresh()
                .await
                .map_err(|e| ShiroxyError::acme(AcmePhase::Poll, e))?;

            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    let detail = order
                        .state()
                        .error
                        .as_ref()
                        .map(|e| format!("{e:?}"))
                        .unwrap_or_else(|| "order became invalid".to_string());
                    error!(domain = %domain, detail = %detail, "ACME order invalid");
                    return Err(ShiroxyError::acme(AcmePhase::Poll, detail));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn download_chain(
        &self,
        order: &mut instant_acme::Order,
        domain: &str,
    ) -> Result<String> {
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() > VALIDATION_TIMEOUT {
                return Err(ShiroxyError::acme(
                    AcmePhase::Download,
                    format!("certificate for {domain} was not issued within {VALIDATION_TIMEOUT:?}"),
                ));
            }

            match order.certificate().await {
                Ok(Some(chain)) => return Ok(chain),
                Ok(None) => tokio::time::sleep(Duration::from_secs(1)).await,
                Err(e) => return Err(ShiroxyError::acme(AcmePhase::Download, e)),
            }
        }
    }

    /// Load the shared account from disk or register it with the CA.
    async fn account_for(&self, email: &str) -> Result<(Account, Vec<u8>)> {
        let mut cached = self.account.lock().await;
        if let Some((account, bytes)) = cached.as_ref() {
            return Ok((account.clone(), bytes.clone()));
        }

        if let Ok(raw) = tokio::fs::read(&self.credentials_path).await {
            let credentials: AccountCredentials = serde_json::from_slice(&raw)
                .map_err(|e| ShiroxyError::acme(AcmePhase::Account, e))?;
            let account = self
                .restore_account(credentials)
                .await
                .map_err(|e| ShiroxyError::acme(AcmePhase::Account, e))?;
            debug!("Restored ACME account from saved credentials");
            *cached = Some((account.clone(), raw.clone()));
            return Ok((account, raw));
        }

        let contact = format!("mailto:{email}");
        let contact_refs: &[&str] = &[&contact];
        let new_account = NewAccount {
            contact: contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = self
            .create_account(&new_account)
            .await
            .map_err(|e| ShiroxyError::acme(AcmePhase::Account, e))?;

        let bytes = serde_json::to_vec(&credentials)
            .map_err(|e| ShiroxyError::acme(AcmePhase::Account, e))?;

        if let Some(parent) = self.credentials_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        if let Err(e) = tokio::fs::write(&self.credentials_path, &bytes).await {
            error!(error = %e, path = %self.credentials_path.display(),
                "Failed to persist ACME account credentials");
        }

        info!(directory = %self.directory_url, "Registered ACME account");
        *cached = Some((account.clone(), bytes.clone()));
        Ok((account, bytes))
    }

    async fn create_account(
        &self,
        new_account: &NewAccount<'_>,
    ) -> std::result::Result<(Account, AccountCredentials), instant_acme::Error> {
        if self.insecure_skip_verify {
            Account::create_with_http(
                new_account,
                &self.directory_url,
                None,
                insecure_http_client(),
            )
            .await
        } else {
            Account::create(new_account, &self.directory_url, None).await
        }
    }

    async fn restore_account(
        &self,
        credentials: AccountCredentials,
    ) -> std::result::Result<Account, instant_acme::Error> {
        if self.insecure_skip_verify {
            Account::from_credentials_and_http(credentials, insecure_http_client()).await
        } else {
            Account::from_credentials(credentials).await
        }
    }
}

/// The directory certificate is not validated. Dev/test CAs only.
fn insecure_http_client() -> Box<dyn HttpClient> {
    let tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth();

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    let client: Client<_, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build(connector);
    Box::new(client)
}

/// Certificate verifier that accepts anything, for skip-verify mode.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Check the downloaded chain actually parses into X.509 certificates.
fn validate_chain(chain_pem: &str) -> Result<()> {
    let mut remaining = chain_pem.as_bytes();
    let mut count = 0usize;
    while !remaining.is_empty() {
        match x509_parser::pem::parse_x509_pem(remaining) {
            Ok((rest, pem)) => {
                x509_parser::parse_x509_certificate(&pem.contents).map_err(|e| {
                    ShiroxyError::acme(AcmePhase::Download, format!("chain certificate: {e}"))
                })?;
                count += 1;
                remaining = rest;
            }
            Err(_) if count > 0 => break,
            Err(e) => {
                return Err(ShiroxyError::acme(
                    AcmePhase::Download,
                    format!("chain PEM: {e}"),
                ))
            }
        }
    }
    if count == 0 {
        return Err(ShiroxyError::acme(
            AcmePhase::Download,
            "empty certificate chain",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with_env(name: &str, acme_url: &str) -> Config {
        let toml = format!(
            r#"
                [frontend]
                [[frontend.bind]]
                port = 8080

                [backend]

                [environment]
                name = "{name}"
                acme_server_url = "{acme_url}"
            "#
        );
        toml::from_str(&toml).unwrap()
    }

    #[test]
    fn test_directory_defaults_by_environment() {
        let issuer = AcmeIssuer::from_config(&config_with_env("dev", ""));
        assert_eq!(issuer.directory_url(), DEV_DIRECTORY);

        let issuer = AcmeIssuer::from_config(&config_with_env("prod", ""));
        assert_eq!(issuer.directory_url(), LETS_ENCRYPT_PRODUCTION);

        let issuer =
            AcmeIssuer::from_config(&config_with_env("stage", LETS_ENCRYPT_STAGING));
        assert_eq!(issuer.directory_url(), LETS_ENCRYPT_STAGING);
    }

    #[test]
    fn test_validate_chain_accepts_self_signed() {
        let key_pair = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        validate_chain(&cert.pem()).unwrap();
    }

    #[test]
    fn test_validate_chain_rejects_garbage() {
        assert!(validate_chain("not a pem").is_err());
        assert!(validate_chain("").is_err());
    }

    #[test]
    fn test_leaf_key_is_p256() {
        // KeyPair::generate defaults to ECDSA P-256, the leaf key type the
        // CSR is built with.
        let key_pair = KeyPair::generate().unwrap();
        assert!(key_pair
            .algorithm()
            .eq(&rcgen::PKCS_ECDSA_P256_SHA256));
    }
}
