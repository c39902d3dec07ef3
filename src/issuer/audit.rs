//! Audit logging for certificate lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with a serialized JSON blob
//! in the `audit` field, making the trail queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `cert.issued` | A certificate was signed and returned |
//! | `cert.denied` | Token verification or policy resolution failed |
//! | `cert.rejected` | The request itself was unacceptable (bad public key) |
//! | `cert.sign_failed` | The CA signing step failed unexpectedly |

use std::net::IpAddr;

use serde::Serialize;

use super::minter::MintOutcome;

/// Structured audit event for one certificate lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g. `"cert.issued"`)
    pub event: &'static str,
    /// Certificate key id (`user:<email>` or `host:<hostname>`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Assigned serial (for `cert.issued`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<u64>,
    /// Certificate principals (for `cert.issued`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principals: Option<Vec<String>>,
    /// Client IP address (when available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    /// Human-readable reason for denial or error events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Construct a `cert.issued` event.
    #[must_use]
    pub fn issued(outcome: &MintOutcome, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "cert.issued",
            key_id: Some(outcome.key_id.clone()),
            serial: Some(outcome.serial),
            principals: Some(outcome.principals.clone()),
            client_ip,
            reason: None,
        }
    }

    /// Construct a `cert.denied` event (token or policy failure).
    #[must_use]
    pub fn denied(reason: impl Into<String>, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "cert.denied",
            key_id: None,
            serial: None,
            principals: None,
            client_ip,
            reason: Some(reason.into()),
        }
    }

    /// Construct a `cert.rejected` event (unacceptable request input).
    #[must_use]
    pub fn rejected(reason: impl Into<String>, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "cert.rejected",
            key_id: None,
            serial: None,
            principals: None,
            client_ip,
            reason: Some(reason.into()),
        }
    }

    /// Construct a `cert.sign_failed` event.
    #[must_use]
    pub fn sign_failed(reason: impl Into<String>, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "cert.sign_failed",
            key_id: None,
            serial: None,
            principals: None,
            client_ip,
            reason: Some(reason.into()),
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "issuer audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
