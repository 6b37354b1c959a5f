use thiserror::Error;

/// Phase of the ACME flow an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmePhase {
    Account,
    Order,
    Authorization,
    Challenge,
    Poll,
    Finalize,
    Download,
}

impl std::fmt::Display for AcmePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            AcmePhase::Account => "account",
            AcmePhase::Order => "order",
            AcmePhase::Authorization => "authorization",
            AcmePhase::Challenge => "challenge",
            AcmePhase::Poll => "poll",
            AcmePhase::Finalize => "finalize",
            AcmePhase::Download => "download",
        };
        f.write_str(phase)
    }
}

/// Shiroxy error kinds. Transport errors are the only kind retried inside
/// the data plane; everything else surfaces to the caller or the
/// per-request recovery boundary.
#[derive(Error, Debug)]
pub enum ShiroxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("no servers available (tag {0:?})")]
    NoServers(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("ACME {phase} failed: {cause}")]
    Acme { phase: AcmePhase, cause: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShiroxyError {
    pub fn acme(phase: AcmePhase, cause: impl std::fmt::Display) -> Self {
        Self::Acme {
            phase,
            cause: cause.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShiroxyError>;
