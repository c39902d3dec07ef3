//! End-to-end issuance tests
//!
//! Exercises the full pipeline over HTTP: a fake identity provider serves
//! its JWKS document (with cache directives) on a local port, the issuance
//! API runs on another, and a real client drives both — exactly the shape
//! of a production deployment minus TLS.

mod common;

use common::{
    claims_for, client_key_b64, provider, spawn_issuance_server, spawn_jwks_server, test_config,
    unix_now, write_ca_key, AUDIENCE,
};
use shortcert::error::status_codes;
use shortcert::server::handler::{IssueCertResponse, IssueHostCertRequest, IssueUserCertRequest};
use ssh_key::certificate::CertType;
use ssh_key::{Certificate, HashAlg, PublicKey};

async fn start_server(with_hosts: bool) -> (String, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ca_key_path = write_ca_key(dir.path());
    let jwks_url = spawn_jwks_server(provider().jwks_json.clone()).await;
    let config = test_config(&ca_key_path, &jwks_url, with_hosts);
    let (addr, ca_public_key) = spawn_issuance_server(config).await;
    // The tempdir can go away once the CA key is loaded.
    dir.close().ok();
    (format!("http://{addr}"), ca_public_key)
}

async fn request_user_cert(base: &str, id_token: String, public_key: String) -> IssueCertResponse {
    reqwest::Client::new()
        .post(format!("{base}/v1/certs/user"))
        .json(&IssueUserCertRequest {
            id_token,
            public_key,
        })
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("response body")
}

#[tokio::test]
async fn issues_user_cert_with_policy_principals_and_artifacts() {
    // GIVEN: a running server and a valid token for foo@
    let (base, ca_public_key) = start_server(false).await;
    let token = provider().token(&claims_for("foo@corp.example.com"));

    // WHEN: requesting a certificate
    let response = request_user_cert(&base, token, client_key_b64()).await;

    // THEN: success with the full policy principal set
    assert_eq!(response.status, status_codes::OK);
    let cert = Certificate::from_openssh(&response.certificate).expect("parse cert");
    assert_eq!(cert.cert_type(), CertType::User);
    assert_eq!(cert.key_id(), "user:foo@corp.example.com");
    assert_eq!(cert.valid_principals(), ["foo", "root"]);
    assert!(cert.extensions().contains_key("permit-pty"));

    // AND: the certificate verifies against the published CA key
    let ca_key = PublicKey::from_openssh(&ca_public_key).expect("parse CA key");
    let fingerprint = ca_key.fingerprint(HashAlg::Sha256);
    assert!(cert.validate_at(unix_now(), [&fingerprint]).is_ok());

    // AND: the artifacts target the configured scope
    assert!(response.certificate_authorities[0]
        .starts_with("@cert-authority *.corp.example.com ssh-ed25519 "));
    assert!(response.certificate_authorities[0].ends_with(" integration-ca"));
    assert_eq!(response.config[0], "Host *.corp.example.com");
    assert_eq!(response.config[1], "    IdentityFile $CERTNAME");
    assert_eq!(response.config[2], "    CertificateFile $CERTNAME-cert.pub");
    assert_eq!(response.config[3], "    StrictHostKeyChecking yes");
}

#[tokio::test]
async fn second_user_gets_only_their_principal() {
    // GIVEN: a token for otheruser@, whose policy has no extras
    let (base, _) = start_server(false).await;
    let token = provider().token(&claims_for("otheruser@corp.example.com"));

    // WHEN: requesting
    let response = request_user_cert(&base, token, client_key_b64()).await;

    // THEN: only "bar", never root
    assert_eq!(response.status, status_codes::OK);
    let cert = Certificate::from_openssh(&response.certificate).expect("parse cert");
    assert_eq!(cert.valid_principals(), ["bar"]);
}

#[tokio::test]
async fn token_from_unpublished_key_is_rejected() {
    // GIVEN: a token signed with a key the provider never published
    let (base, _) = start_server(false).await;
    let token = provider().rogue_token(&claims_for("foo@corp.example.com"));

    // WHEN: requesting
    let response = request_user_cert(&base, token, client_key_b64()).await;

    // THEN: refused as a token failure, nothing issued
    assert_eq!(response.status, status_codes::TOKEN_INVALID);
    assert!(response.certificate.is_empty());
}

#[tokio::test]
async fn unknown_email_is_forbidden() {
    let (base, _) = start_server(false).await;
    let token = provider().token(&claims_for("stranger@corp.example.com"));

    let response = request_user_cert(&base, token, client_key_b64()).await;
    assert_eq!(response.status, status_codes::FORBIDDEN);
}

#[tokio::test]
async fn undersized_rsa_key_is_rejected() {
    use base64::Engine;

    // GIVEN: a 1024-bit RSA client key
    let (base, _) = start_server(false).await;
    let token = provider().token(&claims_for("foo@corp.example.com"));
    let keypair =
        ssh_key::private::RsaKeypair::random(&mut ssh_key::rand_core::OsRng, 1024).expect("rsa");
    let key =
        ssh_key::PrivateKey::new(ssh_key::private::KeypairData::Rsa(keypair), "small").expect("key");
    let blob = base64::engine::general_purpose::STANDARD
        .encode(key.public_key().to_bytes().expect("encode"));

    // THEN: refused with the key-specific code
    let response = request_user_cert(&base, token, blob).await;
    assert_eq!(response.status, status_codes::BAD_PUBLIC_KEY);
}

#[tokio::test]
async fn concurrent_requests_get_distinct_serials() {
    // GIVEN: one server, two clients issuing at the same time
    let (base, ca_public_key) = start_server(false).await;

    let a = {
        let base = base.clone();
        tokio::spawn(async move {
            let token = provider().token(&claims_for("foo@corp.example.com"));
            request_user_cert(&base, token, client_key_b64()).await
        })
    };
    let b = {
        let base = base.clone();
        tokio::spawn(async move {
            let token = provider().token(&claims_for("otheruser@corp.example.com"));
            request_user_cert(&base, token, client_key_b64()).await
        })
    };

    let response_a = a.await.expect("join");
    let response_b = b.await.expect("join");
    assert_eq!(response_a.status, status_codes::OK);
    assert_eq!(response_b.status, status_codes::OK);

    // THEN: both verify against the CA and carry distinct serials
    let cert_a = Certificate::from_openssh(&response_a.certificate).expect("cert a");
    let cert_b = Certificate::from_openssh(&response_b.certificate).expect("cert b");
    let ca_key = PublicKey::from_openssh(&ca_public_key).expect("CA key");
    let fingerprint = ca_key.fingerprint(HashAlg::Sha256);
    assert!(cert_a.validate_at(unix_now(), [&fingerprint]).is_ok());
    assert!(cert_b.validate_at(unix_now(), [&fingerprint]).is_ok());
    assert_ne!(cert_a.serial(), cert_b.serial());
}

#[tokio::test]
async fn trust_lines_are_stable_across_requests() {
    // The CA fingerprint embedded in responses must not drift.
    let (base, _) = start_server(false).await;

    let first = request_user_cert(
        &base,
        provider().token(&claims_for("foo@corp.example.com")),
        client_key_b64(),
    )
    .await;
    let second = request_user_cert(
        &base,
        provider().token(&claims_for("foo@corp.example.com")),
        client_key_b64(),
    )
    .await;

    assert_eq!(
        first.certificate_authorities,
        second.certificate_authorities
    );
}

#[tokio::test]
async fn health_and_ca_endpoints_respond() {
    let (base, ca_public_key) = start_server(false).await;
    let http = reqwest::Client::new();

    let health = http
        .get(format!("{base}/healthz"))
        .send()
        .await
        .expect("health");
    assert!(health.status().is_success());

    let ca = http
        .get(format!("{base}/v1/ca"))
        .send()
        .await
        .expect("ca")
        .text()
        .await
        .expect("ca body");
    assert_eq!(ca, ca_public_key);
    assert!(ca.starts_with("ssh-ed25519 "));
}

#[tokio::test]
async fn host_issuance_is_gated_by_configuration() {
    let http = reqwest::Client::new();

    // GIVEN: a server with no allowed_hosts
    let (base, _) = start_server(false).await;
    let response: IssueCertResponse = http
        .post(format!("{base}/v1/certs/host"))
        .json(&IssueHostCertRequest {
            hostname: "web1.corp.example.com".to_string(),
            public_key: client_key_b64(),
        })
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("body");

    // THEN: refused
    assert_eq!(response.status, status_codes::FORBIDDEN);

    // GIVEN: a server with the allow-glob configured
    let (base, ca_public_key) = start_server(true).await;
    let response: IssueCertResponse = http
        .post(format!("{base}/v1/certs/host"))
        .json(&IssueHostCertRequest {
            hostname: "web1.corp.example.com".to_string(),
            public_key: client_key_b64(),
        })
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("body");

    // THEN: a host certificate comes back
    assert_eq!(response.status, status_codes::OK);
    let cert = Certificate::from_openssh(&response.certificate).expect("cert");
    assert_eq!(cert.cert_type(), CertType::Host);
    assert_eq!(cert.valid_principals(), ["web1.corp.example.com"]);
    let ca_key = PublicKey::from_openssh(&ca_public_key).expect("CA key");
    assert!(cert
        .validate_at(unix_now(), [&ca_key.fingerprint(HashAlg::Sha256)])
        .is_ok());
}

#[tokio::test]
async fn expired_token_is_rejected_without_retry_delay() {
    // GIVEN: a token that expired a minute ago
    let (base, _) = start_server(false).await;
    let mut claims = claims_for("foo@corp.example.com");
    claims["exp"] = serde_json::json!(unix_now() - 60);
    let token = provider().token(&claims);

    // WHEN: requesting (terminal failures must not burn clock-skew retries)
    let started = std::time::Instant::now();
    let response = request_user_cert(&base, token, client_key_b64()).await;

    // THEN: immediate token failure
    assert_eq!(response.status, status_codes::TOKEN_INVALID);
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
}

#[tokio::test]
async fn validity_window_honors_ttl_and_backdate() {
    let (base, _) = start_server(false).await;
    let token = provider().token(&claims_for("foo@corp.example.com"));

    let before = unix_now();
    let response = request_user_cert(&base, token, client_key_b64()).await;
    let after = unix_now();
    assert_eq!(response.status, status_codes::OK);

    let cert = Certificate::from_openssh(&response.certificate).expect("cert");
    let valid_after = cert
        .valid_after_time()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("valid_after")
        .as_secs();
    let valid_before = cert
        .valid_before_time()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("valid_before")
        .as_secs();

    assert!(valid_after < valid_before);
    // Backdated by the 60s clock tolerance.
    assert!(valid_after + 60 <= after);
    // Lifetime bounded by the configured 24h TTL (+ tolerance).
    assert!(valid_before <= after + 86400);
    assert!(valid_before >= before + 86400);
}

#[tokio::test]
async fn audience_and_hosted_domain_are_both_enforced() {
    let (base, _) = start_server(false).await;

    // Wrong audience
    let mut claims = claims_for("foo@corp.example.com");
    claims["aud"] = serde_json::json!("someone-else");
    let response = request_user_cert(&base, provider().token(&claims), client_key_b64()).await;
    assert_eq!(response.status, status_codes::TOKEN_INVALID);

    // Wrong hosted domain, correct audience
    let mut claims = claims_for("foo@corp.example.com");
    claims["hd"] = serde_json::json!("other.example.org");
    assert_eq!(claims["aud"], serde_json::json!(AUDIENCE));
    let response = request_user_cert(&base, provider().token(&claims), client_key_b64()).await;
    assert_eq!(response.status, status_codes::TOKEN_INVALID);
}
