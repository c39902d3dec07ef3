//! CA signing — the process-held certificate authority key.
//!
//! The signer owns the CA private key for the process lifetime and is the
//! only component that touches it. Serial numbers come from a 64-bit
//! counter seeded with high entropy at startup and bumped atomically, so
//! concurrent signing needs no lock: the serial counter is the only shared
//! mutable state. Nonce generation and the wire encoding (fields in the
//! OpenSSH certificate order, options and extensions sorted by name) are
//! delegated to `ssh-key`'s certificate builder.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use ssh_key::certificate::{Builder as CertBuilder, CertType, Certificate};
use ssh_key::rand_core::OsRng;
use ssh_key::{Fingerprint, HashAlg, PrivateKey, PublicKey};
use tracing::{debug, info};

use crate::{Error, Result};

/// Everything a certificate needs except what the signer itself assigns:
/// serial, nonce, and the CA signature.
#[derive(Debug, Clone)]
pub struct CertDraft {
    /// User or host certificate
    pub cert_type: CertType,
    /// Key id string embedded in the certificate (e.g. `user:alice@corp`)
    pub key_id: String,
    /// The subject public key being certified
    pub public_key: PublicKey,
    /// Principals, ordered and deduplicated
    pub principals: Vec<String>,
    /// Validity start (Unix seconds)
    pub valid_after: u64,
    /// Validity end (Unix seconds)
    pub valid_before: u64,
    /// Critical options, by name
    pub critical_options: BTreeMap<String, String>,
    /// Extensions, by name
    pub extensions: BTreeMap<String, String>,
}

/// The certificate authority signer.
pub struct CaSigner {
    private_key: PrivateKey,
    serial: AtomicU64,
}

impl CaSigner {
    /// Load the CA private key from an OpenSSH-format file.
    ///
    /// Called once at startup; the key never leaves process memory after
    /// this and is never logged.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let private_key = PrivateKey::read_openssh_file(path)
            .map_err(|e| Error::Config(format!("Failed to load CA key {}: {e}", path.display())))?;
        if private_key.is_encrypted() {
            return Err(Error::Config(format!(
                "CA key {} is passphrase-protected; decrypt it for service use",
                path.display()
            )));
        }

        let signer = Self::from_private_key(private_key);
        info!(
            fingerprint = %signer.fingerprint(),
            algorithm = %signer.private_key.algorithm(),
            "CA key loaded"
        );
        Ok(signer)
    }

    /// Build a signer around an already-loaded private key.
    #[must_use]
    pub fn from_private_key(private_key: PrivateKey) -> Self {
        // High-entropy seed, with the top bit clear so the counter cannot
        // wrap within a process lifetime.
        let seed: u64 = rand::rng().random::<u64>() >> 1;
        Self {
            private_key,
            serial: AtomicU64::new(seed),
        }
    }

    /// Sign a certificate draft.
    ///
    /// Assigns the next serial, fills a random 32-byte nonce, and signs the
    /// to-be-signed encoding with the CA key.
    ///
    /// # Errors
    ///
    /// [`Error::SigningFailed`] when the builder rejects the draft or the
    /// signature operation fails.
    pub fn sign(&self, draft: &CertDraft) -> Result<Certificate> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);

        let mut builder = CertBuilder::new_with_random_nonce(
            &mut OsRng,
            &draft.public_key,
            draft.valid_after,
            draft.valid_before,
        )
        .map_err(|e| Error::SigningFailed(format!("certificate builder: {e}")))?;

        builder
            .serial(serial)
            .and_then(|b| b.cert_type(draft.cert_type))
            .and_then(|b| b.key_id(&draft.key_id))
            .and_then(|b| b.comment(&draft.key_id))
            .map_err(|e| Error::SigningFailed(format!("certificate fields: {e}")))?;

        for principal in &draft.principals {
            builder
                .valid_principal(principal)
                .map_err(|e| Error::SigningFailed(format!("principal {principal}: {e}")))?;
        }
        for (name, value) in &draft.critical_options {
            builder
                .critical_option(name, value)
                .map_err(|e| Error::SigningFailed(format!("critical option {name}: {e}")))?;
        }
        for (name, value) in &draft.extensions {
            builder
                .extension(name, value)
                .map_err(|e| Error::SigningFailed(format!("extension {name}: {e}")))?;
        }

        let certificate = builder
            .sign(&self.private_key)
            .map_err(|e| Error::SigningFailed(format!("CA signature: {e}")))?;

        debug!(
            serial,
            key_id = %draft.key_id,
            cert_type = ?draft.cert_type,
            "Certificate signed"
        );
        Ok(certificate)
    }

    /// The CA public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key().clone()
    }

    /// SHA-256 fingerprint of the CA public key; constant for the process
    /// lifetime.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.private_key.public_key().fingerprint(HashAlg::Sha256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::Algorithm;

    fn test_signer() -> CaSigner {
        let ca_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        CaSigner::from_private_key(ca_key)
    }

    fn test_draft() -> CertDraft {
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        CertDraft {
            cert_type: CertType::User,
            key_id: "user:alice@corp.example.com".to_string(),
            public_key: subject.public_key().clone(),
            principals: vec!["alice".to_string(), "root".to_string()],
            valid_after: 1_700_000_000,
            valid_before: 1_700_086_400,
            critical_options: BTreeMap::new(),
            extensions: [("permit-pty".to_string(), String::new())]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn signed_certificate_carries_draft_fields() {
        // GIVEN: a signer and a complete draft
        let signer = test_signer();

        // WHEN: signing
        let cert = signer.sign(&test_draft()).unwrap();

        // THEN: the certificate reflects the draft
        assert_eq!(cert.cert_type(), CertType::User);
        assert_eq!(cert.key_id(), "user:alice@corp.example.com");
        assert_eq!(cert.valid_principals(), ["alice", "root"]);
        assert_eq!(cert.valid_after_time().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs(), 1_700_000_000);
        assert!(cert.extensions().contains_key("permit-pty"));
    }

    #[test]
    fn certificate_validates_against_ca_fingerprint() {
        // GIVEN: a signed certificate
        let signer = test_signer();
        let cert = signer.sign(&test_draft()).unwrap();

        // THEN: it validates against the CA fingerprint within its window
        let fingerprint = signer.fingerprint();
        assert!(cert.validate_at(1_700_000_100, [&fingerprint]).is_ok());
    }

    #[test]
    fn serials_are_distinct_and_increasing() {
        // GIVEN: one signer issuing several certificates
        let signer = test_signer();
        let draft = test_draft();

        // WHEN: signing repeatedly
        let serials: Vec<u64> = (0..4)
            .map(|_| signer.sign(&draft).unwrap().serial())
            .collect();

        // THEN: serials strictly increase with issuance order
        for pair in serials.windows(2) {
            assert!(pair[1] > pair[0], "serials must increase: {serials:?}");
        }
    }

    #[test]
    fn nonce_is_32_bytes_and_differs_per_certificate() {
        let signer = test_signer();
        let draft = test_draft();
        let a = signer.sign(&draft).unwrap();
        let b = signer.sign(&draft).unwrap();

        assert_eq!(a.nonce().len(), 32);
        assert_ne!(a.nonce(), b.nonce());
    }

    #[test]
    fn fingerprint_is_stable() {
        let signer = test_signer();
        assert_eq!(signer.fingerprint(), signer.fingerprint());
    }
}
