//! Certificate issuance — OIDC identity to short-lived SSH certificates.
//!
//! The issuance pipeline:
//!
//! ```text
//! Request arrives
//!   -> Token Verifier (key-set cache behind it)   -- offline claim checks
//!   -> Policy Resolver                            -- email -> principals
//!   -> CA Signer                                  -- serial, nonce, signature
//!   -> Artifact Assembler                         -- known_hosts / ssh_config lines
//! ```
//!
//! [`CertIssuer`] wires the pipeline up from configuration at startup and is
//! the only constructor the server uses. The CA private key lives inside the
//! signer and is passed nowhere else; there are no ambient globals.

pub mod artifacts;
pub mod audit;
pub mod keyset;
pub mod minter;
pub mod policy;
pub mod signer;
pub mod verify;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use crate::config::Config;
use crate::Result;

pub use artifacts::ArtifactAssembler;
pub use audit::AuditEvent;
pub use keyset::{KeySetCache, ProviderKey};
pub use minter::{CertMinter, MintOutcome};
pub use policy::{AuthorizationDecision, PolicyTable};
pub use signer::{CaSigner, CertDraft};
pub use verify::{TokenVerifier, VerifiedIdentity};

/// The assembled issuance pipeline.
pub struct CertIssuer {
    /// The minter orchestrating verification, policy, and signing
    pub minter: Arc<CertMinter>,
    /// CA public key line (with the configured comment), served to clients
    pub ca_public_key: String,
}

impl CertIssuer {
    /// Build the pipeline from validated configuration.
    ///
    /// Loads the CA key and renders the static artifacts; fails fast on any
    /// configuration problem so the process exits non-zero at startup.
    pub fn from_config(config: &Config) -> Result<Self> {
        let keyset = Arc::new(KeySetCache::new(
            config.id_token.keyset_url.clone(),
            config.id_token.fetch_timeout,
        )?);
        let verifier = TokenVerifier::new(keyset);
        let policy = PolicyTable::from_config(config);
        let signer = Arc::new(CaSigner::load(&config.ca.ca_key_path)?);
        let artifacts =
            ArtifactAssembler::new(&config.artifacts, &signer.public_key(), &config.ca.ca_comment)?;

        let mut ca_public = signer.public_key();
        ca_public.set_comment(&config.ca.ca_comment);
        let ca_public_key = ca_public.to_openssh()?;

        let minter = Arc::new(CertMinter::new(
            verifier,
            policy,
            signer,
            artifacts,
            config.id_token.allowed_client_id.clone(),
            config.id_token.allowed_domain.clone(),
        ));

        Ok(Self {
            minter,
            ca_public_key,
        })
    }
}
