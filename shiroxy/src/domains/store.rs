//! Domain record store
//!
//! Authoritative mapping of domain -> record (ACME keys, certificate
//! chain, status, metadata) plus the HTTP-01 challenge token index. The
//! in-memory copy is guarded by a read-biased lock; writers are rare
//! (registration, issuance completion, removal), readers are every TLS
//! handshake. The sqlite backing writes through and is loaded once at
//! startup, so the synchronous TLS resolver and the read path under
//! storage failure always have a cached copy to serve from.

use crate::config::{StorageConfig, StorageLocation};
use crate::error::{Result, ShiroxyError};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Version tag for the binary record encoding. Bump on breaking layout
/// changes; decode rejects unknown versions.
pub const RECORD_ENCODING_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Inactive,
    Active,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainStatus::Inactive => "inactive",
            DomainStatus::Active => "active",
        }
    }
}

/// Everything known about a registered domain. `status` is `Active` iff a
/// valid chain and key are installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain: String,
    pub email: String,
    pub status: DomainStatus,
    /// PKCS#8 DER of the ACME account key this record was issued under.
    #[serde(default)]
    pub acme_account_key: Vec<u8>,
    #[serde(default)]
    pub cert_chain_pem: Vec<u8>,
    #[serde(default)]
    pub cert_key_pem: Vec<u8>,
    /// HTTP-01 key authorization for the in-flight order; empty when no
    /// order is pending.
    #[serde(default)]
    pub dns_challenge_key: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DomainRecord {
    pub fn new(domain: String, email: String, metadata: HashMap<String, String>) -> Self {
        Self {
            domain,
            email,
            status: DomainStatus::Inactive,
            acme_account_key: Vec::new(),
            cert_chain_pem: Vec::new(),
            cert_key_pem: Vec::new(),
            dns_challenge_key: String::new(),
            metadata,
        }
    }

    /// Comma-joined tags from metadata, read by the balancer.
    pub fn tags(&self) -> Vec<String> {
        self.metadata
            .get("tags")
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize)]
struct VersionedRecord {
    version: u8,
    record: DomainRecord,
}

/// Encode a record with the versioned binary framing used by both the
/// sqlite backing and the shutdown snapshot.
pub fn encode_record(record: &DomainRecord) -> Result<Vec<u8>> {
    bincode::serialize(&VersionedRecord {
        version: RECORD_ENCODING_VERSION,
        record: record.clone(),
    })
    .map_err(|e| ShiroxyError::Storage(format!("encoding record: {e}")))
}

pub fn decode_record(bytes: &[u8]) -> Result<DomainRecord> {
    let versioned: VersionedRecord = bincode::deserialize(bytes)
        .map_err(|e| ShiroxyError::Storage(format!("decoding record: {e}")))?;
    if versioned.version != RECORD_ENCODING_VERSION {
        return Err(ShiroxyError::Storage(format!(
            "unsupported record encoding version {}",
            versioned.version
        )));
    }
    Ok(versioned.record)
}

enum Backing {
    Memory,
    Sqlite(SqlitePool),
}

/// Domain store with the challenge token index.
pub struct DomainStore {
    records: RwLock<HashMap<String, DomainRecord>>,
    /// token -> domain for in-flight HTTP-01 challenges. Entries live
    /// until the order resolves.
    challenge_tokens: RwLock<HashMap<String, String>>,
    backing: Backing,
}

impl DomainStore {
    /// Connect the configured backing. An unreachable sqlite database is
    /// fatal at startup.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let backing = match config.location {
            StorageLocation::Memory => Backing::Memory,
            StorageLocation::Sqlite => {
                let options = SqliteConnectOptions::from_str(&format!(
                    "sqlite://{}",
                    config.path
                ))
                .map_err(|e| ShiroxyError::Storage(format!("sqlite options: {e}")))?
                .create_if_missing(true);

                let pool = SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await
                    .map_err(|e| {
                        ShiroxyError::Storage(format!("connecting {}: {e}", config.path))
                    })?;

                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS domain_records (
                        domain TEXT PRIMARY KEY,
                        record BLOB NOT NULL
                    )",
                )
                .execute(&pool)
                .await
                .map_err(|e| ShiroxyError::Storage(format!("creating schema: {e}")))?;

                Backing::Sqlite(pool)
            }
        };

        let store = Self {
            records: RwLock::new(HashMap::new()),
            challenge_tokens: RwLock::new(HashMap::new()),
            backing,
        };
        store.load_all().await?;
        Ok(store)
    }

    /// In-memory store for tests and the `memory` backing.
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            challenge_tokens: RwLock::new(HashMap::new()),
            backing: Backing::Memory,
        }
    }

    async fn load_all(&self) -> Result<()> {
        if let Backing::Sqlite(pool) = &self.backing {
            let rows = sqlx::query("SELECT domain, record FROM domain_records")
                .fetch_all(pool)
                .await
                .map_err(|e| ShiroxyError::Storage(format!("loading records: {e}")))?;

            let mut records = self.records.write().unwrap();
            for row in rows {
                let domain: String = row.get("domain");
                let blob: Vec<u8> = row.get("record");
                match decode_record(&blob) {
                    Ok(record) => {
                        records.insert(domain, record);
                    }
                    Err(e) => warn!(domain = %domain, error = %e, "Skipping undecodable record"),
                }
            }
            info!(count = records.len(), "Loaded domain records from storage");
        }
        Ok(())
    }

    async fn write_through(&self, record: &DomainRecord) -> Result<()> {
        if let Backing::Sqlite(pool) = &self.backing {
            let blob = encode_record(record)?;
            sqlx::query(
                "INSERT INTO domain_records (domain, record) VALUES (?, ?)
                 ON CONFLICT(domain) DO UPDATE SET record = excluded.record",
            )
            .bind(&record.domain)
            .bind(blob)
            .execute(pool)
            .await
            .map_err(|e| ShiroxyError::Storage(format!("writing {}: {e}", record.domain)))?;
        }
        Ok(())
    }

    async fn delete_backing(&self, domain: &str) -> Result<()> {
        if let Backing::Sqlite(pool) = &self.backing {
            sqlx::query("DELETE FROM domain_records WHERE domain = ?")
                .bind(domain)
                .execute(pool)
                .await
                .map_err(|e| ShiroxyError::Storage(format!("deleting {domain}: {e}")))?;
        }
        Ok(())
    }

    /// Create the inactive record for a new registration. Fails on an
    /// empty domain or when the domain already holds an active
    /// certificate.
    pub async fn insert_new(
        &self,
        domain: &str,
        email: &str,
        metadata: HashMap<String, String>,
    ) -> Result<DomainRecord> {
        if domain.is_empty() {
            return Err(ShiroxyError::InvalidArgument(
                "domain must not be empty".into(),
            ));
        }

        let record = {
            let mut records = self.records.write().unwrap();
            if let Some(existing) = records.get(domain) {
                if existing.status == DomainStatus::Active {
                    return Err(ShiroxyError::InvalidArgument(format!(
                        "domain {domain} is already registered and active"
                    )));
                }
                // Retried registration reuses the inactive record.
                existing.clone()
            } else {
                let record = DomainRecord::new(domain.to_string(), email.to_string(), metadata);
                records.insert(domain.to_string(), record.clone());
                record
            }
        };

        self.write_through(&record).await?;
        debug!(domain = %domain, "Registered domain record");
        Ok(record)
    }

    /// Replace a record wholesale (issuance completion, snapshot merge).
    pub async fn put(&self, record: DomainRecord) -> Result<()> {
        {
            let mut records = self.records.write().unwrap();
            records.insert(record.domain.clone(), record.clone());
        }
        self.write_through(&record).await
    }

    /// Merge metadata keys into an existing record.
    pub async fn update_metadata(
        &self,
        domain: &str,
        metadata: HashMap<String, String>,
    ) -> Result<DomainRecord> {
        let record = {
            let mut records = self.records.write().unwrap();
            let record = records
                .get_mut(domain)
                .ok_or_else(|| ShiroxyError::NotFound(format!("domain {domain}")))?;
            record.metadata.extend(metadata);
            record.clone()
        };
        self.write_through(&record).await?;
        Ok(record)
    }

    pub async fn remove(&self, domain: &str) -> Result<()> {
        if domain.is_empty() {
            return Err(ShiroxyError::InvalidArgument(
                "domain must not be empty".into(),
            ));
        }
        {
            let mut records = self.records.write().unwrap();
            if records.remove(domain).is_none() {
                return Err(ShiroxyError::NotFound(format!("domain {domain}")));
            }
        }
        self.clear_challenges_for_domain(domain);
        self.delete_backing(domain).await?;
        info!(domain = %domain, "Removed domain");
        Ok(())
    }

    pub fn get(&self, domain: &str) -> Result<DomainRecord> {
        let records = self.records.read().unwrap();
        records
            .get(domain)
            .cloned()
            .ok_or_else(|| ShiroxyError::NotFound(format!("domain {domain}")))
    }

    pub fn list(&self) -> Vec<DomainRecord> {
        let records = self.records.read().unwrap();
        records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    // Challenge token index ------------------------------------------------

    /// Record a token -> domain association at challenge setup.
    pub fn set_challenge_token(&self, token: &str, domain: &str) {
        let mut tokens = self.challenge_tokens.write().unwrap();
        tokens.insert(token.to_string(), domain.to_string());
    }

    /// Dereference token -> domain -> dns_challenge_key for the challenge
    /// responder. `None` when the token or domain is unknown, or the key
    /// is empty.
    pub fn challenge_key_for_token(&self, token: &str) -> Option<String> {
        let domain = {
            let tokens = self.challenge_tokens.read().unwrap();
            tokens.get(token).cloned()?
        };
        let records = self.records.read().unwrap();
        let record = records.get(&domain)?;
        if record.dns_challenge_key.is_empty() {
            return None;
        }
        Some(record.dns_challenge_key.clone())
    }

    /// Drop every token pointing at the domain once its order resolves.
    pub fn clear_challenges_for_domain(&self, domain: &str) {
        let mut tokens = self.challenge_tokens.write().unwrap();
        tokens.retain(|_, d| d != domain);
    }
}
