//! Configuration for the shiroxy daemon
//!
//! Loaded from a TOML file at startup. Every effect of a key is enforced
//! here or in the component that consumes it; validation failures are
//! fatal at startup.

use crate::error::{Result, ShiroxyError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Deployment environment. Selects ACME skip-verify defaults; passed
/// explicitly through construction, never read from a process global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentName {
    Dev,
    Stage,
    Prod,
}

impl EnvironmentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentName::Dev => "dev",
            EnvironmentName::Stage => "stage",
            EnvironmentName::Prod => "prod",
        }
    }
}

/// Load balancing policy, selected per `backend.balance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum BalancePolicy {
    #[serde(rename = "round-robin")]
    RoundRobin,
    #[serde(rename = "least-count")]
    LeastConnections,
    #[serde(rename = "sticky-session")]
    StickySession,
}

/// Whether an unknown tag falls back to the global group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagRule {
    Strict,
    Loose,
}

/// Whether the balancer serves while every backend is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoServerAction {
    Strict,
    Loose,
}

/// Outbound scheme used when rewriting requests for backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendMode {
    Http,
    Https,
}

impl FrontendMode {
    pub fn scheme(&self) -> &'static str {
        match self {
            FrontendMode::Http => "http",
            FrontendMode::Https => "https",
        }
    }
}

/// Bind target mode: one certificate for one name, or SNI multiplexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindTarget {
    Single,
    Multiple,
}

/// TLS client authentication policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecureVerify {
    None,
    Optional,
    Required,
}

impl Default for SecureVerify {
    fn default() -> Self {
        SecureVerify::None
    }
}

/// Certificate source for single-target secure binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SingleTargetMode {
    #[serde(rename = "certandkey")]
    CertAndKey,
    #[serde(rename = "shiroxyshinglesecure")]
    ShiroxyShingleSecure,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CertAndKey {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecureSetting {
    #[serde(default)]
    pub secure_verify: SecureVerify,
    pub single_target_mode: Option<SingleTargetMode>,
    #[serde(default)]
    pub cert_and_key: CertAndKey,
}

/// One frontend listener definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrontendBind {
    #[serde(default = "default_bind_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_bind_target")]
    pub target: BindTarget,
    #[serde(default)]
    pub secure_setting: SecureSetting,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_target() -> BindTarget {
    BindTarget::Multiple
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrontendConfig {
    #[serde(default)]
    pub bind: Vec<FrontendBind>,
    #[serde(default)]
    pub http_to_https: bool,
    #[serde(default = "default_frontend_mode")]
    pub mode: FrontendMode,
}

fn default_frontend_mode() -> FrontendMode {
    FrontendMode::Http
}

/// Static backend server definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendServerConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Probed by the health checker; validated at admission.
    pub health_url: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "default_balance")]
    pub balance: BalancePolicy,
    /// Probe interval in seconds.
    #[serde(default = "default_health_check_trigger")]
    pub health_check_trigger_duration: u64,
    #[serde(default = "default_tag_rule")]
    pub tag_rule: TagRule,
    #[serde(default = "default_no_server_action")]
    pub no_server_action: NoServerAction,
    #[serde(default)]
    pub servers: Vec<BackendServerConfig>,
}

fn default_balance() -> BalancePolicy {
    BalancePolicy::RoundRobin
}

fn default_health_check_trigger() -> u64 {
    5
}

fn default_tag_rule() -> TagRule {
    TagRule::Loose
}

fn default_no_server_action() -> NoServerAction {
    NoServerAction::Loose
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ErrorResponses {
    #[serde(default)]
    pub page_button_name: String,
    #[serde(default)]
    pub page_button_url: String,
}

/// Domain record storage backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_location")]
    pub location: StorageLocation,
    /// Database path for the sqlite backing.
    #[serde(default)]
    pub path: String,
}

fn default_storage_location() -> StorageLocation {
    StorageLocation::Memory
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            location: StorageLocation::Memory,
            path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UserConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DefaultConfig {
    #[serde(default)]
    pub error_responses: ErrorResponses,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_persistence_path")]
    pub data_persistance_path: String,
    #[serde(default)]
    pub user: UserConfig,
}

fn default_persistence_path() -> String {
    ".".to_string()
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            error_responses: ErrorResponses::default(),
            storage: StorageConfig::default(),
            data_persistance_path: default_persistence_path(),
            user: UserConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_environment_name")]
    pub name: EnvironmentName,
    #[serde(default)]
    pub acme_server_url: String,
    /// Bypasses directory certificate validation for test CAs only.
    /// Forced off outside dev.
    #[serde(default)]
    pub acme_insecure_skip_verify: bool,
}

fn default_environment_name() -> EnvironmentName {
    EnvironmentName::Dev
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: default_environment_name(),
            acme_server_url: String::new(),
            acme_insecure_skip_verify: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    /// Only listed events are delivered.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub frontend: FrontendConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub default: DefaultConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl Config {
    /// Read and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ShiroxyError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| ShiroxyError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frontend.bind.is_empty() {
            return Err(ShiroxyError::Config(
                "at least one frontend bind is required".into(),
            ));
        }

        for bind in &self.frontend.bind {
            if bind.secure
                && bind.target == BindTarget::Single
                && bind.secure_setting.single_target_mode.is_none()
            {
                return Err(ShiroxyError::Config(format!(
                    "bind :{} is single-target secure but secure_setting.single_target_mode is unset",
                    bind.port
                )));
            }
        }

        if self.frontend.http_to_https {
            let has_port_80 = self.frontend.bind.iter().any(|b| b.port == 80 && !b.secure);
            let has_secure_443 = self.frontend.bind.iter().any(|b| b.port == 443 && b.secure);
            if has_port_80 && !has_secure_443 {
                return Err(ShiroxyError::Config(
                    "http_to_https requires a secure bind on port 443".into(),
                ));
            }
        }

        for server in &self.backend.servers {
            if server.id.is_empty() {
                return Err(ShiroxyError::Config("backend server id is empty".into()));
            }
            if server.host.is_empty() {
                return Err(ShiroxyError::Config(format!(
                    "backend server {} has an empty host",
                    server.id
                )));
            }
            server.health_url.parse::<http::Uri>().map_err(|e| {
                ShiroxyError::Config(format!(
                    "backend server {} health_url {:?}: {e}",
                    server.id, server.health_url
                ))
            })?;
        }

        if self.default.storage.location == StorageLocation::Sqlite
            && self.default.storage.path.is_empty()
        {
            return Err(ShiroxyError::Config(
                "storage.location = \"sqlite\" requires storage.path".into(),
            ));
        }

        if self.backend.health_check_trigger_duration == 0 {
            return Err(ShiroxyError::Config(
                "health_check_trigger_duration must be at least 1 second".into(),
            ));
        }

        Ok(())
    }

    /// Skip-verify is honored only in dev; stage and prod always validate
    /// the ACME directory certificate.
    pub fn acme_insecure_skip_verify(&self) -> bool {
        self.environment.name == EnvironmentName::Dev
            && self.environment.acme_insecure_skip_verify
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [frontend]
            http_to_https = false
            mode = "http"

            [[frontend.bind]]
            host = "127.0.0.1"
            port = 8080
            secure = false
            target = "multiple"

            [backend]
            balance = "round-robin"
            health_check_trigger_duration = 5
            tag_rule = "loose"
            no_server_action = "loose"

            [[backend.servers]]
            id = "s1"
            host = "127.0.0.1"
            port = 9001
            health_url = "http://127.0.0.1:9001/"
            tags = ["web"]
        "#
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.backend.balance, BalancePolicy::RoundRobin);
        assert_eq!(config.backend.tag_rule, TagRule::Loose);
        assert_eq!(config.frontend.mode, FrontendMode::Http);
        assert_eq!(config.backend.servers.len(), 1);
        assert_eq!(config.backend.servers[0].tags, vec!["web"]);
        assert_eq!(config.default.storage.location, StorageLocation::Memory);
    }

    #[test]
    fn test_balance_policy_names() {
        for (name, expected) in [
            ("round-robin", BalancePolicy::RoundRobin),
            ("least-count", BalancePolicy::LeastConnections),
            ("sticky-session", BalancePolicy::StickySession),
        ] {
            let parsed: BalancePolicy =
                serde_json::from_str(&format!("\"{name}\"")).unwrap();
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn test_single_target_requires_mode() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.frontend.bind[0].secure = true;
        config.frontend.bind[0].target = BindTarget::Single;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("single_target_mode"));
    }

    #[test]
    fn test_redirect_requires_secure_443() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.frontend.http_to_https = true;
        config.frontend.bind[0].port = 80;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_health_url_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.backend.servers[0].health_url = "not a url at all \u{7f}".into();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_skip_verify_only_in_dev() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.environment.acme_insecure_skip_verify = true;

        config.environment.name = EnvironmentName::Dev;
        assert!(config.acme_insecure_skip_verify());

        config.environment.name = EnvironmentName::Prod;
        assert!(!config.acme_insecure_skip_verify());
    }

    #[test]
    fn test_sqlite_requires_path() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.default.storage.location = StorageLocation::Sqlite;

        assert!(config.validate().is_err());

        config.default.storage.path = "shiroxy.db".into();
        assert!(config.validate().is_ok());
    }
}
