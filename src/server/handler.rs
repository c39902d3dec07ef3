//! HTTP handlers for the issuance endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/certs/user` | Exchange an ID token + public key for a user certificate |
//! | `POST` | `/v1/certs/host` | Issue a host certificate (policy-gated) |
//! | `GET` | `/v1/ca` | The CA public key line |
//! | `GET` | `/healthz` | Liveness probe |
//!
//! Application-level failures come back as HTTP 200 with a non-zero `status`
//! in the body — the client surfaces the code; the HTTP layer only signals
//! transport-shaped problems (malformed JSON and the like). The
//! `diagnostic` string stays opaque: kind, not internals, never secrets.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::status_codes;
use crate::issuer::{audit, AuditEvent, CertMinter, MintOutcome};
use crate::Error;

/// Shared state handed to every handler.
pub struct AppState {
    /// The issuance pipeline
    pub minter: Arc<CertMinter>,
    /// CA public key line served at `/v1/ca`
    pub ca_public_key: String,
}

/// User certificate request body.
#[derive(Debug, Serialize, Deserialize)]
pub struct IssueUserCertRequest {
    /// Compact signed ID token from the identity provider
    pub id_token: String,
    /// Base64 of the SSH wire-format public key blob
    pub public_key: String,
}

/// Host certificate request body.
#[derive(Debug, Serialize, Deserialize)]
pub struct IssueHostCertRequest {
    /// Hostname the certificate is for (vouched for by the fronting proxy)
    pub hostname: String,
    /// Base64 of the SSH wire-format public key blob
    pub public_key: String,
}

/// Issuance response, shared by the user and host paths.
#[derive(Debug, Serialize, Deserialize)]
pub struct IssueCertResponse {
    /// 0 on success; non-zero failure code otherwise
    pub status: u32,
    /// Authorized-keys certificate line (empty on failure)
    #[serde(default)]
    pub certificate: String,
    /// `known_hosts` CA trust lines
    #[serde(default)]
    pub certificate_authorities: Vec<String>,
    /// `ssh_config` block lines with `$CERTNAME` unresolved
    #[serde(default)]
    pub config: Vec<String>,
    /// Opaque failure hint; never internal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl IssueCertResponse {
    fn ok(outcome: MintOutcome) -> Self {
        Self {
            status: status_codes::OK,
            certificate: outcome.certificate,
            certificate_authorities: outcome.trust_lines,
            config: outcome.config_lines,
            diagnostic: None,
        }
    }

    fn failure(error: &Error) -> Self {
        Self {
            status: error.status_code(),
            certificate: String::new(),
            certificate_authorities: Vec::new(),
            config: Vec::new(),
            diagnostic: Some(diagnostic_for(error).to_string()),
        }
    }
}

/// Build the issuance routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/ca", get(ca_public_key))
        .route("/v1/certs/user", post(issue_user_cert))
        .route("/v1/certs/host", post(issue_host_cert))
        .with_state(state)
}

/// Build the reduced routes for the plain-HTTP host-certificate bridge.
///
/// The bridge sits behind a reverse proxy that vouches for the requesting
/// host; user issuance is deliberately not reachable here.
pub fn bridge_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/ca", get(ca_public_key))
        .route("/v1/certs/host", post(issue_host_cert))
        .with_state(state)
}

/// `GET /healthz`
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// `GET /v1/ca` — the CA public key in OpenSSH form.
async fn ca_public_key(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.ca_public_key.clone()
}

/// `POST /v1/certs/user`
async fn issue_user_cert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IssueUserCertRequest>,
) -> impl IntoResponse {
    let client_ip = extract_client_ip(&headers);

    match state
        .minter
        .issue_user_cert(&body.id_token, &body.public_key)
        .await
    {
        Ok(outcome) => {
            audit::emit(&AuditEvent::issued(&outcome, client_ip));
            Json(IssueCertResponse::ok(outcome))
        }
        Err(e) => {
            warn!(error = %e, "User certificate request failed");
            audit::emit(&audit_failure(&e, client_ip));
            Json(IssueCertResponse::failure(&e))
        }
    }
}

/// `POST /v1/certs/host`
async fn issue_host_cert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IssueHostCertRequest>,
) -> impl IntoResponse {
    let client_ip = extract_client_ip(&headers);

    if !state.minter.host_issuance_enabled() {
        let e = Error::Forbidden("host certificate issuance is not configured".to_string());
        audit::emit(&AuditEvent::denied("host issuance disabled", client_ip));
        return Json(IssueCertResponse::failure(&e));
    }

    match state
        .minter
        .issue_host_cert(&body.hostname, &body.public_key)
        .await
    {
        Ok(outcome) => {
            audit::emit(&AuditEvent::issued(&outcome, client_ip));
            Json(IssueCertResponse::ok(outcome))
        }
        Err(e) => {
            warn!(hostname = %body.hostname, error = %e, "Host certificate request failed");
            audit::emit(&audit_failure(&e, client_ip));
            Json(IssueCertResponse::failure(&e))
        }
    }
}

/// Extract the client IP from `X-Forwarded-For` or `X-Real-IP` headers.
fn extract_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
}

/// Map an issuance error onto the matching audit event.
fn audit_failure(error: &Error, client_ip: Option<IpAddr>) -> AuditEvent {
    match error {
        Error::BadPublicKey(_) => AuditEvent::rejected(error.to_string(), client_ip),
        Error::SigningFailed(_) => AuditEvent::sign_failed(error.to_string(), client_ip),
        _ => AuditEvent::denied(error.to_string(), client_ip),
    }
}

/// The opaque diagnostic for a failure response.
fn diagnostic_for(error: &Error) -> &'static str {
    match error {
        Error::KeySetUnavailable(_) | Error::UnknownKeyId(_) | Error::TokenInvalid(_)
        | Error::ClockSkew(_) => "ID token verification failed",
        Error::BadPublicKey(_) => "public key rejected",
        Error::Forbidden(_) => "not authorized for certificate issuance",
        Error::SigningFailed(_) => "signing failed",
        _ => "internal error",
    }
}
