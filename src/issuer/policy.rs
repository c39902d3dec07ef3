//! Authorization policy — maps verified identities to issuance decisions.
//!
//! The user table is loaded once at startup from `allowed_users` and is
//! immutable for the process lifetime. Lookup is by lowercased email. Host
//! certificates use a separate allow-glob table: the only question is
//! whether any glob covers the requested hostname.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use super::verify::VerifiedIdentity;
use crate::config::{Config, UserPolicy};
use crate::{Error, Result};

/// Certificate attributes OpenSSH defines as critical options; everything
/// else in `cert_permissions` is carried as an extension.
const CRITICAL_OPTION_NAMES: [&str; 3] = ["force-command", "source-address", "verify-required"];

/// What an authenticated request is allowed to have signed.
#[derive(Debug, Clone)]
pub struct AuthorizationDecision {
    /// Certificate principals, ordered and deduplicated; for user
    /// certificates the local username always comes first
    pub principals: Vec<String>,
    /// Critical options, by name
    pub critical_options: BTreeMap<String, String>,
    /// Extensions, by name
    pub extensions: BTreeMap<String, String>,
    /// Certificate lifetime
    pub ttl: Duration,
}

/// The loaded authorization tables.
pub struct PolicyTable {
    users: HashMap<String, UserPolicy>,
    host_globs: Vec<String>,
    ttl: Duration,
}

impl PolicyTable {
    /// Build the table from validated configuration.
    ///
    /// Email keys are normalized to lowercase here; duplicates were already
    /// rejected by [`Config::validate`].
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let users = config
            .allowed_users
            .iter()
            .map(|(email, policy)| (email.trim().to_lowercase(), policy.clone()))
            .collect();

        Self {
            users,
            host_globs: config.allowed_hosts.clone(),
            ttl: Duration::from_secs(config.ca.generate_cert_duration_seconds),
        }
    }

    /// `true` when at least one host allow-glob is configured.
    #[must_use]
    pub fn host_issuance_enabled(&self) -> bool {
        !self.host_globs.is_empty()
    }

    /// Resolve the issuance decision for a verified user identity.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] when no policy entry covers the email.
    pub fn resolve_user(&self, identity: &VerifiedIdentity) -> Result<AuthorizationDecision> {
        let policy = self
            .users
            .get(&identity.email.to_lowercase())
            .ok_or_else(|| Error::Forbidden(format!("no policy entry for {}", identity.email)))?;

        let mut principals = Vec::with_capacity(1 + policy.extra_principals.len());
        principals.push(policy.username.clone());
        for extra in &policy.extra_principals {
            if !principals.contains(extra) {
                principals.push(extra.clone());
            }
        }

        let mut critical_options = BTreeMap::new();
        let mut extensions = BTreeMap::new();
        for (name, value) in &policy.cert_permissions {
            if CRITICAL_OPTION_NAMES.contains(&name.as_str()) {
                critical_options.insert(name.clone(), value.clone());
            } else {
                extensions.insert(name.clone(), value.clone());
            }
        }

        debug!(email = %identity.email, principals = ?principals, "User policy resolved");
        Ok(AuthorizationDecision {
            principals,
            critical_options,
            extensions,
            ttl: self.ttl,
        })
    }

    /// Resolve the issuance decision for a host certificate request.
    ///
    /// # Errors
    ///
    /// [`Error::Forbidden`] when no allow-glob covers the hostname.
    pub fn resolve_host(&self, hostname: &str) -> Result<AuthorizationDecision> {
        let covered = self
            .host_globs
            .iter()
            .any(|glob| glob_matches(glob, hostname));
        if !covered {
            return Err(Error::Forbidden(format!(
                "hostname {hostname} not covered by any allow-glob"
            )));
        }

        debug!(hostname = %hostname, "Host policy resolved");
        Ok(AuthorizationDecision {
            principals: vec![hostname.to_string()],
            critical_options: BTreeMap::new(),
            extensions: BTreeMap::new(),
            ttl: self.ttl,
        })
    }
}

/// Match `name` against `glob`, where `*` matches any run of characters
/// (including none). No other metacharacters are recognized.
fn glob_matches(glob: &str, name: &str) -> bool {
    let mut segments = glob.split('*');
    let Some(first) = segments.next() else {
        return name.is_empty();
    };

    // No wildcard at all: exact match.
    if !glob.contains('*') {
        return glob == name;
    }

    let mut rest = match name.strip_prefix(first) {
        Some(rest) => rest,
        None => return false,
    };

    let mut segments: Vec<&str> = segments.collect();
    let last = segments.pop().unwrap_or("");

    for segment in segments {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }

    rest.ends_with(last)
}
