//! OAuth credential acquisition for the client.
//!
//! Two ways to obtain an authorization code:
//!
//! 1. **Browser dance** — bind a loopback listener on an ephemeral port,
//!    open the provider's consent page in a browser, and wait for the
//!    redirect carrying the code. The listener is a bounded scoped task: it
//!    completes when a code arrives, when the user denies access, or when
//!    the timeout fires.
//! 2. **Out-of-band fallback** — print the consent URL and read the code
//!    pasted from the terminal, for machines where no browser can reach us.
//!
//! The resulting long-lived credentials (refresh token + current ID token)
//! are cached in the user's home directory with owner-only permissions.

use std::fs;
use std::io::Write as _;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::{Error, Result};

/// Redirect URI for the out-of-band copy/paste flow.
const REDIRECT_OOB: &str = "urn:ietf:wg:oauth:2.0:oob";

/// How long the loopback listener waits for the browser redirect.
const BROWSER_DANCE_TIMEOUT: Duration = Duration::from_secs(300);

/// Cached OAuth credentials, in the provider's token-response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCreds {
    /// Bearer access token (unused by us, kept for completeness)
    #[serde(default)]
    pub access_token: String,
    /// Token type, usually `Bearer`
    #[serde(default)]
    pub token_type: String,
    /// Access token lifetime in seconds
    #[serde(default)]
    pub expires_in: u64,
    /// The signed ID token we actually care about
    #[serde(default)]
    pub id_token: String,
    /// Long-lived refresh token
    #[serde(default)]
    pub refresh_token: String,
}

/// Load cached credentials from `path`.
pub fn load_creds(path: &Path) -> Result<CachedCreds> {
    let body = fs::read(path)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Persist credentials to `path` with owner-only permissions (0600).
pub fn save_creds(path: &Path, creds: &CachedCreds) -> Result<()> {
    let body = serde_json::to_vec(creds)?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(&body)?;
    info!(path = %path.display(), "Saved credentials");
    Ok(())
}

/// Query parameters the provider appends to the loopback redirect.
#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// State shared with the loopback handler.
struct CallbackState {
    expected_state: String,
    tx: Option<oneshot::Sender<Result<String>>>,
}

/// The OAuth flow driver.
pub struct OauthFlow {
    config: ClientConfig,
    http: reqwest::Client,
}

impl OauthFlow {
    /// Create a flow for the given client configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build OAuth HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    /// Acquire fresh credentials: browser dance first, out-of-band fallback.
    pub async fn authorize(&self) -> Result<CachedCreds> {
        let (code, redirect_uri) = match self.browser_dance().await {
            Ok(pair) => pair,
            Err(Error::Forbidden(reason)) => {
                // The user clicked deny; falling back would only annoy them.
                return Err(Error::Forbidden(reason));
            }
            Err(e) => {
                warn!(error = %e, "Browser flow failed; falling back to copy/paste");
                self.oob_dance()?
            }
        };

        self.exchange_code(&code, &redirect_uri).await
    }

    /// Loopback-redirect authorization.
    async fn browser_dance(&self) -> Result<(String, String)> {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("loopback literal");
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind loopback listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("Failed to read listener address: {e}")))?
            .port();
        let redirect_uri = format!("http://localhost:{port}");

        let expected_state = Alphanumeric.sample_string(&mut rand::rng(), 32);
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(tokio::sync::Mutex::new(CallbackState {
            expected_state: expected_state.clone(),
            tx: Some(tx),
        }));

        let app = Router::new()
            .route("/", get(handle_callback))
            .with_state(state);
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let consent_url = self.consent_url(&redirect_uri, &expected_state);
        info!("Opening browser for authorization");
        if let Err(e) = open::that(&consent_url) {
            server.abort();
            return Err(Error::Internal(format!("Failed to open browser: {e}")));
        }
        println!("Please approve the request in your browser to continue.");

        let outcome = tokio::time::timeout(BROWSER_DANCE_TIMEOUT, rx).await;
        server.abort();

        match outcome {
            Ok(Ok(result)) => result.map(|code| (code, redirect_uri)),
            Ok(Err(_)) => Err(Error::Internal("Callback channel closed".to_string())),
            Err(_) => Err(Error::Internal(
                "Timed out waiting for browser authorization".to_string(),
            )),
        }
    }

    /// Copy/paste authorization for browserless environments.
    fn oob_dance(&self) -> Result<(String, String)> {
        let consent_url = self.consent_url(REDIRECT_OOB, "");
        println!("Please visit (in your browser):\n{consent_url}\n");
        print!("And then paste the code received here: ");
        std::io::stdout().flush()?;

        let mut code = String::new();
        std::io::stdin().read_line(&mut code)?;
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(Error::Internal("No authorization code entered".to_string()));
        }
        Ok((code, REDIRECT_OOB.to_string()))
    }

    fn consent_url(&self, redirect_uri: &str, state: &str) -> String {
        let mut url = format!(
            "{}?scope=email&response_type=code&client_id={}&redirect_uri={}",
            self.config.auth_uri,
            urlencode(&self.config.client_id),
            urlencode(redirect_uri),
        );
        if !state.is_empty() {
            url.push_str("&state=");
            url.push_str(&urlencode(state));
        }
        url
    }

    /// Swap an authorization code for long-lived credentials.
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<CachedCreds> {
        info!("Exchanging authorization code for credentials");
        let params = [
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ];
        self.token_request(&params).await
    }

    /// Swap a refresh token for fresh short-lived credentials.
    ///
    /// The provider omits the refresh token from the response; the one we
    /// sent is carried over so the cache file stays complete.
    pub async fn refresh(&self, refresh_token: &str) -> Result<CachedCreds> {
        info!("Refreshing credentials");
        let params = [
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let mut creds = self.token_request(&params).await?;
        if creds.refresh_token.is_empty() {
            creds.refresh_token = refresh_token.to_string();
        }
        Ok(creds)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<CachedCreds> {
        let response = self
            .http
            .post(&self.config.token_uri)
            .form(params)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("token response read failed: {e}")))?;
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "token endpoint returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

/// Handle the loopback redirect from the provider.
async fn handle_callback(
    State(state): State<Arc<tokio::sync::Mutex<CallbackState>>>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let mut state = state.lock().await;

    let result = if params.error.as_deref() == Some("access_denied") {
        Err(Error::Forbidden("authorization denied in browser".to_string()))
    } else if params.state.as_deref() != Some(state.expected_state.as_str()) {
        Err(Error::Internal("state mismatch on OAuth callback".to_string()))
    } else if let Some(code) = params.code.filter(|c| !c.is_empty()) {
        Ok(code)
    } else {
        Err(Error::Internal("no authorization code received".to_string()))
    };

    let page = match &result {
        Ok(_) => {
            "<html><body>Authorization code received. Please close this window and return to your terminal.</body></html>"
        }
        Err(Error::Forbidden(_)) => {
            "<html><body>We'll miss you. Please close this window and return to your terminal.</body></html>"
        }
        Err(_) => "<html><body>Error - please try again.</body></html>",
    };

    if let Some(tx) = state.tx.take() {
        let _ = tx.send(result);
    }
    Html(page)
}

/// Percent-encode the characters that matter in a query component.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
