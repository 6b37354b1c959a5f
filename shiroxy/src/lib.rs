//! shiroxy: HTTP/HTTPS reverse proxy and load balancer
//!
//! Terminates TLS for many domains at once with per-domain SNI
//! certificate resolution, selects healthy upstreams through pluggable
//! balancing policies (round-robin, least-connections, sticky-session)
//! over a tag index, and drives per-domain certificate issuance with an
//! ACME (RFC 8555) client and its HTTP-01 challenge responder.
//!
//! # Example configuration
//!
//! ```toml
//! [frontend]
//! http_to_https = true
//! mode = "http"
//!
//! [[frontend.bind]]
//! host = "0.0.0.0"
//! port = 443
//! secure = true
//! target = "multiple"
//!
//! [[frontend.bind]]
//! host = "0.0.0.0"
//! port = 80
//!
//! [backend]
//! balance = "round-robin"
//! health_check_trigger_duration = 5
//! tag_rule = "loose"
//! no_server_action = "loose"
//!
//! [[backend.servers]]
//! id = "web-1"
//! host = "10.0.1.10"
//! port = 8080
//! health_url = "http://10.0.1.10:8080/healthz"
//! tags = ["web"]
//! ```

pub mod analytics;
pub mod config;
pub mod domains;
pub mod error;
pub mod persistence;
pub mod proxy;
pub mod public;
pub mod webhook;

pub use config::Config;
pub use error::{Result, ShiroxyError};
