//! Client orchestration — from machine check to installed certificate.
//!
//! One `login` run walks the full flow:
//!
//! ```text
//! machine policy -> cached/fresh OAuth creds -> valid ID token
//!   -> new keypair -> server issuance call -> artifacts on disk
//!   -> (optionally) ssh-agent
//! ```
//!
//! The ID token is verified locally before it is ever sent: a stale token
//! triggers exactly one refresh exchange, and only clock skew is waited
//! out. Key material lands with owner-only permissions; the `known_hosts`
//! and `config` updates go through the atomic section splicer.

pub mod oauth;
pub mod splice;

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::{info, warn};

use crate::config::{ClientTls, Config};
use crate::error::status_codes;
use crate::issuer::{KeySetCache, TokenVerifier};
use crate::server::{IssueCertResponse, IssueUserCertRequest};
use crate::{Error, Result};

/// Clock-skew retries when validating the cached ID token.
const CLOCK_SKEW_RETRIES: u32 = 5;

/// Run the full login flow.
pub async fn login(config: Config) -> Result<()> {
    validate_machine_is_suitable(&config)?;

    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
    let creds_path = home.join(&config.client.credential_file_name);

    let flow = oauth::OauthFlow::new(config.client.clone())?;

    // Load cached credentials, or run the authorization dance.
    let creds = match oauth::load_creds(&creds_path) {
        Ok(creds) => creds,
        Err(_) => {
            let creds = flow.authorize().await?;
            oauth::save_creds(&creds_path, &creds)?;
            creds
        }
    };

    // Validate the ID token locally; one refresh exchange on any failure
    // that is not clock skew, then one more validation.
    let verifier = TokenVerifier::new(Arc::new(KeySetCache::new(
        config.id_token.keyset_url.clone(),
        config.id_token.fetch_timeout,
    )?));

    let (creds, email) = match verifier
        .verify_with_clock_retry(
            &creds.id_token,
            &config.client.client_id,
            &config.client.hosted_domain,
            CLOCK_SKEW_RETRIES,
        )
        .await
    {
        Ok(identity) => (creds, identity.email),
        Err(e) => {
            info!(error = %e, "Cached ID token rejected; refreshing");
            let creds = flow.refresh(&creds.refresh_token).await?;
            oauth::save_creds(&creds_path, &creds)?;
            let identity = verifier
                .verify_with_clock_retry(
                    &creds.id_token,
                    &config.client.client_id,
                    &config.client.hosted_domain,
                    CLOCK_SKEW_RETRIES,
                )
                .await?;
            (creds, identity.email)
        }
    };
    info!(email = %email, "Have valid ID token");

    fetch_and_install_certs(&config, &creds.id_token, &home).await
}

/// Soft-enforce client-device requirements before issuing anything.
///
/// On macOS, full disk encryption must be on; other platforms are allowed
/// through for now.
fn validate_machine_is_suitable(config: &Config) -> Result<()> {
    if config.client.override_machine_policy {
        warn!("Overriding machine policy");
        return Ok(());
    }

    if std::env::consts::OS == "macos" {
        let output = Command::new("fdesetup")
            .arg("status")
            .output()
            .map_err(|e| Error::Internal(format!("Failed to run fdesetup: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.contains("FileVault is On") {
            return Err(Error::Internal(
                "FileVault must be enabled for SSH certificates (or re-run with \
                 override_machine_policy)"
                    .to_string(),
            ));
        }
    }

    Ok(())
}

/// Generate a keypair, call the issuance server, and install everything.
async fn fetch_and_install_certs(config: &Config, id_token: &str, home: &Path) -> Result<()> {
    info!("Generating new private key");
    let private_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::Internal(format!("key generation failed: {e}")))?;
    let public_key = private_key.public_key();
    let public_blob_b64 = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(
            public_key
                .to_bytes()
                .map_err(|e| Error::Internal(format!("key encoding failed: {e}")))?,
        )
    };

    let http = build_http_client(&config.client.tls)?;
    let url = format!(
        "{}/v1/certs/user",
        config.client.server_url.trim_end_matches('/')
    );

    info!("Requesting fresh certificate");
    let response: IssueCertResponse = http
        .post(&url)
        .json(&IssueUserCertRequest {
            id_token: id_token.to_string(),
            public_key: public_blob_b64,
        })
        .send()
        .await
        .map_err(|e| Error::Transport(format!("issuance request failed: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Transport(format!("issuance request rejected: {e}")))?
        .json()
        .await
        .map_err(|e| Error::Transport(format!("malformed issuance response: {e}")))?;

    if response.status != status_codes::OK {
        return Err(Error::Internal(format!(
            "server refused issuance (status {}): {}",
            response.status,
            response.diagnostic.as_deref().unwrap_or("no diagnostic")
        )));
    }
    info!("Received new certificate from server");

    let ssh_dir = home.join(".ssh");
    ensure_ssh_dir(&ssh_dir)?;

    let key_name = &config.client.shortlived_key_name;
    let key_path = ssh_dir.join(key_name);

    info!("Writing new private key");
    let key_openssh = private_key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::Internal(format!("private key encoding failed: {e}")))?;
    write_with_mode(&key_path, key_openssh.as_bytes(), 0o600)?;

    let pub_openssh = public_key
        .to_openssh()
        .map_err(|e| Error::Internal(format!("public key encoding failed: {e}")))?;
    write_with_mode(
        &ssh_dir.join(format!("{key_name}.pub")),
        format!("{pub_openssh}\n").as_bytes(),
        0o644,
    )?;

    info!(
        "Installing new certificate. For more info, run: ssh-keygen -Lf ~/.ssh/{key_name}-cert.pub"
    );
    write_with_mode(
        &ssh_dir.join(format!("{key_name}-cert.pub")),
        format!("{}\n", response.certificate.trim_end()).as_bytes(),
        0o644,
    )?;

    // Trust the CA for the configured scope.
    if splice::replace_section(
        &ssh_dir.join("known_hosts"),
        &config.client.section_identifier,
        &response.certificate_authorities,
        0o644,
    )? {
        info!("Updated known_hosts certificate authorities");
    }

    // Point ssh at the short-lived key. The config file wants a `~` path so
    // the .ssh directory stays relocatable (e.g. mounted into containers).
    let cert_name = format!("~/.ssh/{key_name}");
    let config_lines: Vec<String> = response
        .config
        .iter()
        .map(|line| line.replace("$CERTNAME", &cert_name))
        .collect();
    if splice::replace_section(
        &ssh_dir.join("config"),
        &config.client.section_identifier,
        &config_lines,
        0o644,
    )? {
        info!("Updated ssh config to use certificates");
    }

    maybe_add_to_agent(&key_path);
    Ok(())
}

/// Build the HTTP client for one of the three TLS credential modes.
fn build_http_client(tls: &ClientTls) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
    let builder = match tls {
        ClientTls::BakedIn { cert_pem } => {
            let cert = reqwest::Certificate::from_pem(cert_pem.as_bytes())
                .map_err(|e| Error::Config(format!("Unusable baked-in certificate: {e}")))?;
            builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(cert)
        }
        ClientTls::SystemCa => builder,
        ClientTls::InsecureSkipVerify => {
            warn!("Disabling TLS verification for the issuance server connection");
            builder.danger_accept_invalid_certs(true)
        }
    };
    builder
        .build()
        .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))
}

/// Create `~/.ssh` with 0700 if it does not exist yet.
fn ensure_ssh_dir(ssh_dir: &Path) -> Result<()> {
    if !ssh_dir.exists() {
        info!("Creating SSH config directory");
        fs::DirBuilder::new().mode(0o700).create(ssh_dir)?;
    }
    Ok(())
}

/// Write `contents` to `path` with `mode`, truncating any existing file.
fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

/// Best-effort `ssh-add` of the fresh key when an agent is reachable.
///
/// `ssh-add` picks up the certificate sitting next to the key on its own.
fn maybe_add_to_agent(key_path: &PathBuf) {
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return;
    }
    info!("SSH_AUTH_SOCK detected, adding key to ssh-agent");
    match Command::new("ssh-add").arg(key_path).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, "ssh-add exited with failure"),
        Err(e) => warn!(error = %e, "Failed to run ssh-add"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_client_builds_for_all_tls_modes() {
        assert!(build_http_client(&ClientTls::SystemCa).is_ok());
        assert!(build_http_client(&ClientTls::InsecureSkipVerify).is_ok());

        // A garbage baked-in certificate is a config error.
        let err = build_http_client(&ClientTls::BakedIn {
            cert_pem: "not a pem".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn ssh_dir_is_created_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let ssh_dir = dir.path().join(".ssh");
        ensure_ssh_dir(&ssh_dir).unwrap();

        let mode = fs::metadata(&ssh_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn write_with_mode_applies_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_test");
        write_with_mode(&path, b"secret\n", 0o600).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read(&path).unwrap(), b"secret\n");
    }
}
