//! shortcert — short-lived SSH certificates from OIDC identity
//!
//! An SSH certificate authority as a service: humans authenticate through
//! an external OpenID Connect provider (hosted-domain ID tokens), and the
//! server answers with an SSH user certificate signed by a process-held CA
//! key. Certificates live for hours, so there is no revocation machinery —
//! they simply expire.
//!
//! # Subsystems
//!
//! - **Issuer**: key-set caching, ID token verification, authorization
//!   policy, CA signing, and client artifact assembly ([`issuer`])
//! - **Server**: the HTTPS issuance API ([`server`])
//! - **Client**: the `login` flow — OAuth dance, local token validation,
//!   key generation, and atomic installation of the returned artifacts
//!   ([`client`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod issuer;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
