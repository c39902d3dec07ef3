//! Shared helpers for exercising the token path in unit tests.
//!
//! RSA key generation is slow enough that the test keypair is generated
//! once per process and shared through a `OnceLock`.

use std::sync::OnceLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;

/// Key id the test provider publishes.
pub(crate) const TEST_KID: &str = "test-kid-1";

/// An RS256 signing keypair with its JWKS-side components.
pub(crate) struct TestKeypair {
    pub encoding_key: EncodingKey,
    pub n_b64: String,
    pub e_b64: String,
}

/// The process-wide test keypair.
pub(crate) fn signing_keypair() -> &'static TestKeypair {
    static KEYPAIR: OnceLock<TestKeypair> = OnceLock::new();
    KEYPAIR.get_or_init(|| {
        let private =
            RsaPrivateKey::new(&mut ssh_key::rand_core::OsRng, 2048).expect("generate RSA key");
        let n_b64 = URL_SAFE_NO_PAD.encode(private.n().to_bytes_be());
        let e_b64 = URL_SAFE_NO_PAD.encode(private.e().to_bytes_be());
        let der = private.to_pkcs1_der().expect("encode PKCS#1");
        TestKeypair {
            encoding_key: EncodingKey::from_rsa_der(der.as_bytes()),
            n_b64,
            e_b64,
        }
    })
}

/// Sign `claims` into a compact RS256 token under [`TEST_KID`].
pub(crate) fn token_with_claims(claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(TEST_KID.to_string());
    jsonwebtoken::encode(&header, claims, &signing_keypair().encoding_key)
        .expect("sign test token")
}
