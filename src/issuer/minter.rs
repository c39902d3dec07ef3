//! Certificate minting — orchestration of verify, authorize, and sign.
//!
//! One minter per process. A user issuance request flows through:
//!
//! 1. ID token verification (with bounded clock-skew retry);
//! 2. client public key parsing and acceptance checks;
//! 3. policy resolution;
//! 4. draft construction and CA signing;
//! 5. artifact assembly.
//!
//! Steps 1–3 have no side effects, so a request cancelled before signing
//! leaves nothing behind. Signing consumes a serial; a connection torn down
//! afterwards does not roll it back.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use ssh_key::certificate::CertType;
use ssh_key::public::KeyData;
use ssh_key::PublicKey;
use tracing::info;

use super::artifacts::ArtifactAssembler;
use super::policy::{AuthorizationDecision, PolicyTable};
use super::signer::{CaSigner, CertDraft};
use super::verify::TokenVerifier;
use crate::{Error, Result};

/// Tolerance subtracted from `valid_after` so a certificate is usable on
/// hosts whose clocks run slightly behind the CA's.
const VALIDITY_BACKDATE_SECS: u64 = 60;

/// Clock-skew retries per issuance request.
const CLOCK_SKEW_RETRIES: u32 = 5;

/// Smallest acceptable RSA modulus, in bits.
const MIN_RSA_BITS: usize = 2048;

/// A successfully minted certificate plus its client-side artifacts.
#[derive(Debug, Clone)]
pub struct MintOutcome {
    /// The certificate in authorized-keys form
    /// (`<alg>-cert-v01@openssh.com <base64> <key-id>`)
    pub certificate: String,
    /// `known_hosts` CA trust lines
    pub trust_lines: Vec<String>,
    /// `ssh_config` block lines, `$CERTNAME` unresolved
    pub config_lines: Vec<String>,
    /// Key id embedded in the certificate (for the audit trail)
    pub key_id: String,
    /// Assigned serial (for the audit trail)
    pub serial: u64,
    /// Certificate principals (for the audit trail)
    pub principals: Vec<String>,
}

/// The certificate minter.
pub struct CertMinter {
    verifier: TokenVerifier,
    policy: PolicyTable,
    signer: Arc<CaSigner>,
    artifacts: ArtifactAssembler,
    expected_audience: String,
    expected_hosted_domain: String,
}

impl CertMinter {
    /// Assemble the minter from its parts.
    #[must_use]
    pub fn new(
        verifier: TokenVerifier,
        policy: PolicyTable,
        signer: Arc<CaSigner>,
        artifacts: ArtifactAssembler,
        expected_audience: String,
        expected_hosted_domain: String,
    ) -> Self {
        Self {
            verifier,
            policy,
            signer,
            artifacts,
            expected_audience,
            expected_hosted_domain,
        }
    }

    /// `true` when host-certificate issuance is configured.
    #[must_use]
    pub fn host_issuance_enabled(&self) -> bool {
        self.policy.host_issuance_enabled()
    }

    /// Issue a user certificate for a validated ID token and client key.
    ///
    /// # Errors
    ///
    /// The §7 taxonomy: token failures (including key-set trouble) surface
    /// with their kind preserved, unacceptable keys as
    /// [`Error::BadPublicKey`], missing policy as [`Error::Forbidden`], and
    /// signing trouble as [`Error::SigningFailed`].
    pub async fn issue_user_cert(&self, id_token: &str, public_key_b64: &str) -> Result<MintOutcome> {
        let identity = self
            .verifier
            .verify_with_clock_retry(
                id_token,
                &self.expected_audience,
                &self.expected_hosted_domain,
                CLOCK_SKEW_RETRIES,
            )
            .await?;

        let client_key = parse_client_key(public_key_b64)?;
        let decision = self.policy.resolve_user(&identity)?;

        let key_id = format!("user:{}", identity.email);
        let outcome = self.sign_and_assemble(CertType::User, key_id, client_key, decision)?;

        info!(email = %identity.email, "User certificate issued");
        Ok(outcome)
    }

    /// Issue a host certificate.
    ///
    /// Proof of control over `hostname` is the fronting proxy's problem;
    /// this path only enforces the allow-glob policy.
    pub async fn issue_host_cert(&self, hostname: &str, public_key_b64: &str) -> Result<MintOutcome> {
        let hostname = hostname.trim().to_lowercase();
        if hostname.is_empty() {
            return Err(Error::Forbidden("empty hostname".to_string()));
        }

        let client_key = parse_client_key(public_key_b64)?;
        let decision = self.policy.resolve_host(&hostname)?;

        let key_id = format!("host:{hostname}");
        let outcome = self.sign_and_assemble(CertType::Host, key_id, client_key, decision)?;

        info!(hostname = %hostname, "Host certificate issued");
        Ok(outcome)
    }

    fn sign_and_assemble(
        &self,
        cert_type: CertType,
        key_id: String,
        public_key: PublicKey,
        decision: AuthorizationDecision,
    ) -> Result<MintOutcome> {
        let now = unix_now();
        let draft = CertDraft {
            cert_type,
            key_id,
            public_key,
            principals: decision.principals,
            valid_after: now.saturating_sub(VALIDITY_BACKDATE_SECS),
            valid_before: now + decision.ttl.as_secs(),
            critical_options: decision.critical_options,
            extensions: decision.extensions,
        };

        let certificate = self.signer.sign(&draft)?;
        let encoded = certificate
            .to_openssh()
            .map_err(|e| Error::SigningFailed(format!("certificate encoding: {e}")))?;

        Ok(MintOutcome {
            certificate: encoded,
            trust_lines: self.artifacts.trust_lines(),
            config_lines: self.artifacts.config_lines(),
            key_id: draft.key_id,
            serial: certificate.serial(),
            principals: draft.principals,
        })
    }
}

/// Parse and vet a client public key from its base64 wire-format blob.
fn parse_client_key(public_key_b64: &str) -> Result<PublicKey> {
    let blob = BASE64_STANDARD
        .decode(public_key_b64.trim())
        .map_err(|_| Error::BadPublicKey("public key is not valid base64".to_string()))?;
    let key = PublicKey::from_bytes(&blob)
        .map_err(|e| Error::BadPublicKey(format!("unparseable public key: {e}")))?;

    match key.key_data() {
        KeyData::Rsa(rsa) => {
            let bits = rsa
                .n
                .as_positive_bytes()
                .map(|b| b.len() * 8)
                .ok_or_else(|| Error::BadPublicKey("malformed RSA modulus".to_string()))?;
            if bits < MIN_RSA_BITS {
                return Err(Error::BadPublicKey(format!(
                    "RSA keys must be at least {MIN_RSA_BITS} bits (got {bits})"
                )));
            }
        }
        KeyData::Ed25519(_) | KeyData::Ecdsa(_) => {}
        other => {
            return Err(Error::BadPublicKey(format!(
                "unsupported key algorithm {}",
                other.algorithm()
            )));
        }
    }

    Ok(key)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
