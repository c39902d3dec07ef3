//! Shared fixtures for the integration suites: a fake identity provider
//! (RSA keypair + JWKS endpoint) and an issuance server wired to it.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use axum::{routing::get, Router};
use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use ssh_key::rand_core::OsRng;
use ssh_key::PrivateKey;
use tokio::net::TcpListener;

use shortcert::config::{ArtifactConfig, CaConfig, Config, UserPolicy};
use shortcert::issuer::CertIssuer;
use shortcert::server::handler::{self, AppState};

/// Key id the fake provider publishes.
pub const PROVIDER_KID: &str = "integration-kid";

/// Audience and hosted domain the test tokens carry.
pub const AUDIENCE: &str = "integration-client-id.example";
pub const DOMAIN: &str = "corp.example.com";

/// The fake provider's signing side.
pub struct TestProvider {
    encoding_key: EncodingKey,
    rogue_encoding_key: EncodingKey,
    /// JWKS document covering only the legitimate key.
    pub jwks_json: String,
}

/// Process-wide provider (RSA generation is slow).
pub fn provider() -> &'static TestProvider {
    static PROVIDER: OnceLock<TestProvider> = OnceLock::new();
    PROVIDER.get_or_init(|| {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate RSA key");
        let rogue = RsaPrivateKey::new(&mut OsRng, 2048).expect("generate rogue RSA key");

        let jwks_json = serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "kid": PROVIDER_KID,
                "n": URL_SAFE_NO_PAD.encode(private.n().to_bytes_be()),
                "e": URL_SAFE_NO_PAD.encode(private.e().to_bytes_be()),
            }]
        })
        .to_string();

        TestProvider {
            encoding_key: EncodingKey::from_rsa_der(
                private.to_pkcs1_der().expect("encode PKCS#1").as_bytes(),
            ),
            rogue_encoding_key: EncodingKey::from_rsa_der(
                rogue.to_pkcs1_der().expect("encode PKCS#1").as_bytes(),
            ),
            jwks_json,
        }
    })
}

impl TestProvider {
    /// Sign claims with the published key.
    pub fn token(&self, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(PROVIDER_KID.to_string());
        jsonwebtoken::encode(&header, claims, &self.encoding_key).expect("sign token")
    }

    /// Sign claims with a key the provider never published.
    pub fn rogue_token(&self, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("rogue-kid".to_string());
        jsonwebtoken::encode(&header, claims, &self.rogue_encoding_key).expect("sign rogue token")
    }
}

/// Standard claims for `email`, issued now and valid for an hour.
pub fn claims_for(email: &str) -> serde_json::Value {
    let now = unix_now();
    serde_json::json!({
        "iss": "https://accounts.google.com",
        "aud": AUDIENCE,
        "sub": "1093848201",
        "email": email,
        "email_verified": true,
        "hd": DOMAIN,
        "iat": now - 30,
        "exp": now + 3600,
    })
}

/// Serve the provider's JWKS document on an ephemeral port; returns its URL.
pub async fn spawn_jwks_server(jwks_json: String) -> String {
    let app = Router::new().route(
        "/certs",
        get(move || {
            let body = jwks_json.clone();
            async move {
                (
                    [(axum::http::header::CACHE_CONTROL, "public, max-age=3600")],
                    body,
                )
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind JWKS server");
    let addr = listener.local_addr().expect("JWKS server addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/certs")
}

/// Write a fresh Ed25519 CA key into `dir` and return its path.
pub fn write_ca_key(dir: &Path) -> std::path::PathBuf {
    let ca_key = PrivateKey::random(&mut OsRng, ssh_key::Algorithm::Ed25519).expect("CA key");
    let path = dir.join("ca");
    std::fs::write(
        &path,
        ca_key
            .to_openssh(ssh_key::LineEnding::LF)
            .expect("encode CA key")
            .as_bytes(),
    )
    .expect("write CA key");
    path
}

/// A server configuration wired to the fake provider.
pub fn test_config(ca_key_path: &Path, keyset_url: &str, with_hosts: bool) -> Config {
    let mut config = Config {
        ca: CaConfig {
            ca_key_path: ca_key_path.display().to_string(),
            ca_comment: "integration-ca".to_string(),
            generate_cert_duration_seconds: 86400,
        },
        artifacts: ArtifactConfig {
            client_config_scope: "*.corp.example.com".to_string(),
            additional_ssh_configuration_line: vec!["StrictHostKeyChecking yes".to_string()],
        },
        ..Config::default()
    };
    config.id_token.allowed_domain = DOMAIN.to_string();
    config.id_token.allowed_client_id = AUDIENCE.to_string();
    config.id_token.keyset_url = keyset_url.to_string();
    if with_hosts {
        config.allowed_hosts = vec!["*.corp.example.com".to_string()];
    }
    config.allowed_users.insert(
        "foo@corp.example.com".to_string(),
        UserPolicy {
            username: "foo".to_string(),
            extra_principals: vec!["root".to_string()],
            cert_permissions: [("permit-pty".to_string(), String::new())]
                .into_iter()
                .collect(),
        },
    );
    config.allowed_users.insert(
        "otheruser@corp.example.com".to_string(),
        UserPolicy {
            username: "bar".to_string(),
            ..UserPolicy::default()
        },
    );
    config.validate().expect("test config valid");
    config
}

/// Spin up the issuance API on an ephemeral port. Returns the bound address
/// and the CA public key line.
pub async fn spawn_issuance_server(config: Config) -> (SocketAddr, String) {
    let issuer = CertIssuer::from_config(&config).expect("build issuer");
    let ca_public_key = issuer.ca_public_key.clone();
    let state = Arc::new(AppState {
        minter: Arc::clone(&issuer.minter),
        ca_public_key: ca_public_key.clone(),
    });
    let app = handler::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind issuance server");
    let addr = listener.local_addr().expect("issuance server addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, ca_public_key)
}

/// A fresh Ed25519 client key as a base64 wire blob.
pub fn client_key_b64() -> String {
    let key = PrivateKey::random(&mut OsRng, ssh_key::Algorithm::Ed25519).expect("client key");
    BASE64_STANDARD.encode(key.public_key().to_bytes().expect("encode client key"))
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs()
}
