//! Configuration management

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Hard ceiling on certificate lifetime (24 hours).
///
/// Short-lived certificates are the whole point: there is no revocation
/// path, so a leaked certificate must age out quickly.
pub const MAX_CERT_DURATION_SECS: u64 = 24 * 60 * 60;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server listener configuration
    pub server: ServerConfig,
    /// Certificate authority configuration
    pub ca: CaConfig,
    /// ID token verification configuration
    pub id_token: IdTokenConfig,
    /// Generated client artifact configuration
    pub artifacts: ArtifactConfig,
    /// Authorization table: email -> issuance policy
    pub allowed_users: HashMap<String, UserPolicy>,
    /// Host certificate allow-globs (empty disables host issuance)
    pub allowed_hosts: Vec<String>,
    /// Client-side (`login`) configuration
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (SHORTCERT_ prefix)
        figment = figment.merge(Env::prefixed("SHORTCERT_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants that serde cannot express.
    ///
    /// Called from [`Config::load`]; a failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let ttl = self.ca.generate_cert_duration_seconds;
        if ttl == 0 {
            return Err(Error::Config(
                "ca.generate_cert_duration_seconds must be positive".to_string(),
            ));
        }
        if ttl > MAX_CERT_DURATION_SECS {
            return Err(Error::Config(format!(
                "ca.generate_cert_duration_seconds must be <= {MAX_CERT_DURATION_SECS}"
            )));
        }

        if self.server.server_cert_path.is_some() != self.server.server_key_path.is_some() {
            return Err(Error::Config(
                "server.server_cert_path and server.server_key_path must be set together"
                    .to_string(),
            ));
        }

        // Two entries that collide on email (case-insensitively) would make
        // issuance order-dependent; reject at load time instead.
        let mut seen: HashSet<String> = HashSet::new();
        for (email, policy) in &self.allowed_users {
            let normalized = email.trim().to_lowercase();
            if normalized.is_empty() {
                return Err(Error::Config("allowed_users contains an empty email".to_string()));
            }
            if !seen.insert(normalized.clone()) {
                return Err(Error::Config(format!(
                    "allowed_users contains duplicate email (case-insensitive): {normalized}"
                )));
            }
            if policy.username.is_empty() {
                return Err(Error::Config(format!(
                    "allowed_users entry for {email} has an empty username"
                )));
            }
        }

        Ok(())
    }
}

/// Server listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port the issuance API listens on
    pub listen_port: u16,
    /// PEM certificate presented by the server (TLS terminated in-process
    /// when set; plaintext otherwise, for fronted deployments)
    pub server_cert_path: Option<String>,
    /// PEM private key matching `server_cert_path`
    pub server_key_path: Option<String>,
    /// Port for the plain-HTTP host-certificate bridge (unset disables it)
    pub http_listen_port: Option<u16>,
    /// Reverse-proxy config file consumed by the host-cert bridge deployment
    pub caddy_file_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            listen_port: 8017,
            server_cert_path: None,
            server_key_path: None,
            http_listen_port: None,
            caddy_file_path: None,
        }
    }
}

/// Certificate authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Path to the CA private key (OpenSSH format)
    pub ca_key_path: String,
    /// Comment appended to the CA line in generated `known_hosts` entries
    pub ca_comment: String,
    /// Lifetime of issued certificates, in seconds
    pub generate_cert_duration_seconds: u64,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            ca_key_path: "/etc/shortcert/ca".to_string(),
            ca_comment: "shortcert-ca".to_string(),
            generate_cert_duration_seconds: 60 * 60 * 12,
        }
    }
}

/// ID token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdTokenConfig {
    /// Hosted domain (`hd` claim) tokens must carry
    pub allowed_domain: String,
    /// OAuth client id (`aud` claim) tokens must carry
    pub allowed_client_id: String,
    /// Provider JWKS document URL
    pub keyset_url: String,
    /// Timeout for one key-set fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for IdTokenConfig {
    fn default() -> Self {
        Self {
            allowed_domain: String::new(),
            allowed_client_id: String::new(),
            keyset_url: "https://www.googleapis.com/oauth2/v3/certs".to_string(),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Generated client artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Host glob the issued certificate is scoped to (e.g. `*.corp.example.com`)
    pub client_config_scope: String,
    /// Extra `ssh_config` lines appended inside the generated `Host` block
    pub additional_ssh_configuration_line: Vec<String>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            client_config_scope: "*".to_string(),
            additional_ssh_configuration_line: Vec::new(),
        }
    }
}

/// Per-user issuance policy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UserPolicy {
    /// Local username; always the first certificate principal
    pub username: String,
    /// Additional principals appended after the username
    pub extra_principals: Vec<String>,
    /// Certificate permissions (name -> value, empty value for flags).
    ///
    /// OpenSSH-defined critical options (`force-command`, `source-address`,
    /// `verify-required`) become critical options; everything else becomes
    /// an extension such as `permit-pty`.
    pub cert_permissions: BTreeMap<String, String>,
}

/// TLS credential selection for the client's connection to the server.
///
/// A closed set of three modes; deliberately a tagged enum rather than
/// anything pluggable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ClientTls {
    /// Trust exactly one baked-in PEM certificate
    BakedIn {
        /// PEM-encoded server (or root) certificate
        cert_pem: String,
    },
    /// Use the system root store
    #[default]
    SystemCa,
    /// Skip verification entirely (testing only)
    InsecureSkipVerify,
}

/// Client-side (`login`) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Issuance server base URL, e.g. `https://ca.corp.example.com:8017`
    pub server_url: String,
    /// TLS credential mode for the server connection
    pub tls: ClientTls,
    /// Hosted domain expected in ID tokens (matches the server's setting)
    pub hosted_domain: String,
    /// OAuth client id used for the browser dance
    pub client_id: String,
    /// OAuth client "secret" (not actually secret for installed apps)
    pub client_secret: String,
    /// OAuth authorization endpoint
    pub auth_uri: String,
    /// OAuth token endpoint
    pub token_uri: String,
    /// Name of the cached-credentials file in the user's home directory
    pub credential_file_name: String,
    /// Basename of the generated key under `~/.ssh` (e.g. `id_corp_shortlived`)
    pub shortlived_key_name: String,
    /// Section identifier used in `known_hosts` / `config` splice markers
    pub section_identifier: String,
    /// Skip the machine suitability check (e.g. FileVault on macOS)
    pub override_machine_policy: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            tls: ClientTls::default(),
            hosted_domain: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_uri: "https://accounts.google.com/o/oauth2/token".to_string(),
            credential_file_name: ".shortcert-token".to_string(),
            shortlived_key_name: "id_shortcert".to_string(),
            section_identifier: "SHORTCERT-CA".to_string(),
            override_machine_policy: false,
        }
    }
}
