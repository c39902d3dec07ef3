//! Client artifact assembly — `known_hosts` and `ssh_config` material.
//!
//! The server tells the client two things alongside every certificate: which
//! CA to trust for the configured host scope, and the `ssh_config` block
//! that points SSH at the short-lived key. Paths are the client's business;
//! the `$CERTNAME` placeholder is substituted client-side and never resolved
//! here.

use ssh_key::PublicKey;

use crate::config::ArtifactConfig;
use crate::Result;

/// Pre-rendered artifact lines, fixed for the process lifetime.
pub struct ArtifactAssembler {
    trust_line: String,
    config_lines: Vec<String>,
}

impl ArtifactAssembler {
    /// Render the artifact lines once from configuration and the CA key.
    pub fn new(config: &ArtifactConfig, ca_public: &PublicKey, ca_comment: &str) -> Result<Self> {
        let mut ca_line_key = ca_public.clone();
        ca_line_key.set_comment(ca_comment);
        let trust_line = format!(
            "@cert-authority {} {}",
            config.client_config_scope,
            ca_line_key.to_openssh()?
        );

        let mut config_lines = vec![
            format!("Host {}", config.client_config_scope),
            "    IdentityFile $CERTNAME".to_string(),
            "    CertificateFile $CERTNAME-cert.pub".to_string(),
        ];
        for line in &config.additional_ssh_configuration_line {
            config_lines.push(format!("    {line}"));
        }

        Ok(Self {
            trust_line,
            config_lines,
        })
    }

    /// The `known_hosts` trust lines (exactly one).
    #[must_use]
    pub fn trust_lines(&self) -> Vec<String> {
        vec![self.trust_line.clone()]
    }

    /// The `ssh_config` block, `Host` line first.
    #[must_use]
    pub fn config_lines(&self) -> Vec<String> {
        self.config_lines.clone()
    }
}
