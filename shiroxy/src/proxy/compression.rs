//! Response body compression
//!
//! The engine gzips text-like upstream responses when the client accepts
//! it. Binary types are never compressed.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

/// Content types eligible for gzip: `text/*` plus the JSON, JavaScript,
/// and XML application types.
pub fn is_compressible_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    mime.starts_with("text/")
        || matches!(
            mime.as_str(),
            "application/json" | "application/javascript" | "application/xml"
        )
}

/// Whether the inbound `Accept-Encoding` header admits gzip.
pub fn accepts_gzip(accept_encoding: &str) -> bool {
    accept_encoding
        .split(',')
        .any(|token| token.trim().split(';').next().unwrap_or("").trim() == "gzip")
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Incremental gzip encoder for streamed bodies. Compressed output is
/// drained after every write so chunks flow to the client as the
/// upstream produces them.
pub struct StreamingGzip {
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl StreamingGzip {
    pub fn new() -> Self {
        Self {
            encoder: Some(GzEncoder::new(Vec::new(), Compression::default())),
        }
    }

    /// Feed a chunk, returning whatever compressed output is ready.
    pub fn write(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| std::io::Error::other("gzip stream already finished"))?;
        encoder.write_all(chunk)?;
        Ok(std::mem::take(encoder.get_mut()))
    }

    /// Flush the trailing gzip frame.
    pub fn finish(&mut self) -> std::io::Result<Vec<u8>> {
        match self.encoder.take() {
            Some(encoder) => encoder.finish(),
            None => Ok(Vec::new()),
        }
    }
}

impl Default for StreamingGzip {
    fn default() -> Self {
        Self::new()
    }
}
