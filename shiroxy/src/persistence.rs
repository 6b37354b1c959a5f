//! Shutdown snapshot and restore
//!
//! On graceful shutdown every domain record is framed with the versioned
//! binary encoding, wrapped in an envelope with the analytics JSON and
//! the webhook secret, base64-encoded, and atomically swapped into
//! `{persistence_dir}/{env}-persistence.shiroxy`. On startup a missing
//! file is not an error; present records merge into the store
//! last-write-wins.

use crate::domains::{decode_record, encode_record, DomainStore};
use crate::error::{Result, ShiroxyError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const ENVELOPE_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct ShutdownEnvelope {
    version: u8,
    /// Framed list of domain records, each in the store's binary encoding.
    domain_metadata: Vec<Vec<u8>>,
    /// Analytics snapshot as JSON bytes.
    system_data: Vec<u8>,
    webhook_secret: String,
}

pub fn snapshot_path(dir: &str, env: &str) -> PathBuf {
    Path::new(dir).join(format!("{env}-persistence.shiroxy"))
}

/// Serialize the store and atomically replace the snapshot file.
pub async fn write_snapshot(
    dir: &str,
    env: &str,
    store: &Arc<DomainStore>,
    analytics: serde_json::Value,
    webhook_secret: &str,
) -> Result<()> {
    let domain_metadata = store
        .list()
        .iter()
        .map(encode_record)
        .collect::<Result<Vec<_>>>()?;

    let envelope = ShutdownEnvelope {
        version: ENVELOPE_VERSION,
        domain_metadata,
        system_data: serde_json::to_vec(&analytics)
            .map_err(|e| ShiroxyError::Storage(format!("encoding analytics: {e}")))?,
        webhook_secret: webhook_secret.to_string(),
    };

    let encoded = bincode::serialize(&envelope)
        .map_err(|e| ShiroxyError::Storage(format!("encoding snapshot: {e}")))?;
    let payload = BASE64.encode(encoded);

    let path = snapshot_path(dir, env);
    tokio::fs::create_dir_all(dir).await?;

    // Write to a sibling temp file, then rename over the target so a
    // crash mid-write never corrupts an existing snapshot.
    let tmp = path.with_extension("shiroxy.tmp");
    tokio::fs::write(&tmp, payload.as_bytes()).await?;
    tokio::fs::rename(&tmp, &path).await?;

    info!(path = %path.display(), domains = store.len(), "Snapshot written");
    Ok(())
}

/// Restored snapshot contents that outlive the store merge.
#[derive(Debug)]
pub struct RestoredSnapshot {
    pub webhook_secret: String,
    pub system_data: serde_json::Value,
}

/// Read the snapshot if present and merge its records into the store.
pub async fn load_snapshot(
    dir: &str,
    env: &str,
    store: &Arc<DomainStore>,
) -> Result<Option<RestoredSnapshot>> {
    let path = snapshot_path(dir, env);
    let payload = match tokio::fs::read_to_string(&path).await {
        Ok(payload) => payload,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ShiroxyError::Storage(format!("reading snapshot: {e}"))),
    };

    let decoded = BASE64
        .decode(payload.trim())
        .map_err(|e| ShiroxyError::Storage(format!("decoding snapshot: {e}")))?;
    let envelope: ShutdownEnvelope = bincode::deserialize(&decoded)
        .map_err(|e| ShiroxyError::Storage(format!("parsing snapshot: {e}")))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(ShiroxyError::Storage(format!(
            "unsupported snapshot version {}",
            envelope.version
        )));
    }

    let mut restored = 0usize;
    for frame in &envelope.domain_metadata {
        match decode_record(frame) {
            Ok(record) => {
                // Last-write-wins over whatever the backing store holds.
                store.put(record).await?;
                restored += 1;
            }
            Err(e) => warn!(error = %e, "Skipping undecodable snapshot record"),
        }
    }

    let system_data =
        serde_json::from_slice(&envelope.system_data).unwrap_or(serde_json::Value::Null);

    info!(path = %path.display(), restored = restored, "Snapshot restored");
    Ok(Some(RestoredSnapshot {
        webhook_secret: envelope.webhook_secret,
        system_data,
    }))
}
