//! Error types for shortcert

use std::io;

use thiserror::Error;

/// Result type alias for shortcert
pub type Result<T> = std::result::Result<T, Error>;

/// shortcert errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (startup only; fatal)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The provider key set could not be fetched or parsed
    #[error("Provider key set unavailable: {0}")]
    KeySetUnavailable(String),

    /// No provider key matches the token's key id, even after a refresh
    #[error("Unknown signing key id: {0}")]
    UnknownKeyId(String),

    /// ID token failed validation (any check other than clock skew)
    #[error("ID token invalid: {0}")]
    TokenInvalid(String),

    /// The token's issue time is in the future; the caller may retry
    #[error("ID token issued {0}s in the future")]
    ClockSkew(u64),

    /// The client public key is unparseable, unsupported, or too small
    #[error("Bad public key: {0}")]
    BadPublicKey(String),

    /// No policy entry covers this identity
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Certificate signing failed unexpectedly
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// Connection-level failure talking to the server or the provider
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SSH key handling error
    #[error("SSH key error: {0}")]
    SshKey(#[from] ssh_key::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire status codes carried in the `status` field of issuance responses.
///
/// `0` means success; any non-zero value is a failure the client must
/// surface. The codes are coarse on purpose — the response never exposes
/// internal state beyond the opaque diagnostic string.
pub mod status_codes {
    /// Certificate issued
    pub const OK: u32 = 0;
    /// ID token rejected (includes key-set failures)
    pub const TOKEN_INVALID: u32 = 1;
    /// Client public key rejected
    pub const BAD_PUBLIC_KEY: u32 = 2;
    /// Identity has no policy entry
    pub const FORBIDDEN: u32 = 3;
    /// CA signing failed
    pub const SIGNING_FAILED: u32 = 4;
    /// Anything else
    pub const INTERNAL: u32 = 5;
}

impl Error {
    /// Map an error onto the wire status code for an issuance response.
    ///
    /// Key-set failures collapse into `TOKEN_INVALID`: the client can do
    /// nothing different for them, and the distinction stays in the server
    /// logs. `ClockSkew` is an internal retry signal and should never reach
    /// this point, but maps to `TOKEN_INVALID` if it does.
    #[must_use]
    pub fn status_code(&self) -> u32 {
        match self {
            Self::KeySetUnavailable(_)
            | Self::UnknownKeyId(_)
            | Self::TokenInvalid(_)
            | Self::ClockSkew(_) => status_codes::TOKEN_INVALID,
            Self::BadPublicKey(_) => status_codes::BAD_PUBLIC_KEY,
            Self::Forbidden(_) => status_codes::FORBIDDEN,
            Self::SigningFailed(_) => status_codes::SIGNING_FAILED,
            _ => status_codes::INTERNAL,
        }
    }

    /// `true` only for the clock-skew retry signal.
    #[must_use]
    pub fn is_clock_skew(&self) -> bool {
        matches!(self, Self::ClockSkew(_))
    }
}
