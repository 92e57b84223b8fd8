//! Firebase Authentication with GitHub as the upstream OAuth provider.
//!
//! The interactive handshake is GitHub's OAuth device flow: the user opens
//! the verification page and enters a short code, and the resulting GitHub
//! access token is exchanged for a Firebase session via `signInWithIdp`.
//! Identity tokens are re-minted from the Firebase refresh token.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::provider::{Handshake, IdentityProvider, Principal, ProviderCredential};
use super::AuthError;
use crate::notify::{Notice, Notifier};

const GITHUB_BASE_URL: &str = "https://github.com";
const IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com/v1";
const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";

const GITHUB_PROVIDER_ID: &str = "github.com";
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Scope that grants the GitHub token access to repositories
const SOURCE_CONTROL_SCOPE: &str = "repo";

/// Provider session file name in cache directory
const PROVIDER_SESSION_FILE: &str = "provider_session.json";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Seconds GitHub asks us to add to the polling interval on `slow_down`
const SLOW_DOWN_INCREMENT_SECS: u64 = 5;

/// Cached identity tokens are re-minted this many seconds before expiry.
const MINT_BUFFER_SECS: i64 = 300;

/// Base URLs of the services the provider talks to.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub github: String,
    pub identity_toolkit: String,
    pub secure_token: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            github: GITHUB_BASE_URL.to_string(),
            identity_toolkit: IDENTITY_TOOLKIT_URL.to_string(),
            secure_token: SECURE_TOKEN_URL.to_string(),
        }
    }
}

/// What the provider persists between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProviderSession {
    principal: Principal,
    refresh_token: String,
}

struct SignedInUser {
    session: ProviderSession,
    id_token: Option<String>,
    id_token_expires_at: Option<DateTime<Utc>>,
}

impl SignedInUser {
    fn cached_id_token(&self) -> Option<String> {
        let expires_at = self.id_token_expires_at?;
        if Utc::now() + chrono::Duration::seconds(MINT_BUFFER_SECS) < expires_at {
            self.id_token.clone()
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

/// GitHub answers both success and pending states with 200 and this shape.
#[derive(Debug, Default, Deserialize)]
struct GithubTokenResponse {
    access_token: Option<String>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    interval: Option<u64>,
}

struct GithubGrant {
    access_token: String,
    scopes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInWithIdpRequest<'a> {
    post_body: String,
    request_uri: &'a str,
    return_idp_credential: bool,
    return_secure_token: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInWithIdpResponse {
    local_id: String,
    id_token: String,
    refresh_token: String,
    expires_in: Option<String>,
    email: Option<String>,
    display_name: Option<String>,
    photo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: Option<String>,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct FirebaseErrorEnvelope {
    error: FirebaseErrorBody,
}

#[derive(Debug, Deserialize)]
struct FirebaseErrorBody {
    message: String,
}

pub struct FirebaseGithubProvider {
    client: Client,
    api_key: String,
    client_id: String,
    endpoints: ProviderEndpoints,
    session_path: PathBuf,
    notifier: Arc<dyn Notifier>,
    principal: watch::Sender<Option<Principal>>,
    user: Mutex<Option<SignedInUser>>,
}

impl FirebaseGithubProvider {
    /// Create the provider, restoring a previously persisted sign-in from `cache_dir`.
    pub fn new(
        api_key: impl Into<String>,
        client_id: impl Into<String>,
        cache_dir: PathBuf,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        let session_path = cache_dir.join(PROVIDER_SESSION_FILE);
        let restored = match Self::load_session(&session_path) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable provider session");
                None
            }
        };
        debug!(restored = restored.is_some(), "Provider session loaded");

        let (principal, _) = watch::channel(restored.as_ref().map(|s| s.principal.clone()));
        let user = restored.map(|session| SignedInUser {
            session,
            id_token: None,
            id_token_expires_at: None,
        });

        Ok(Self {
            client,
            api_key: api_key.into(),
            client_id: client_id.into(),
            endpoints: ProviderEndpoints::default(),
            session_path,
            notifier,
            principal,
            user: Mutex::new(user),
        })
    }

    pub fn with_endpoints(mut self, endpoints: ProviderEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn load_session(path: &Path) -> Result<Option<ProviderSession>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).context("Failed to read provider session file")?;
        let session = serde_json::from_str(&contents).context("Failed to parse provider session file")?;
        Ok(Some(session))
    }

    fn save_session(&self, session: &ProviderSession) -> Result<()> {
        if let Some(parent) = self.session_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(session)?;
        std::fs::write(&self.session_path, contents)?;
        Ok(())
    }

    fn clear_session_file(&self) -> Result<()> {
        if self.session_path.exists() {
            std::fs::remove_file(&self.session_path)?;
        }
        Ok(())
    }

    async fn post_form<T: DeserializeOwned>(&self, url: &str, form: &[(&str, &str)]) -> Result<T, AuthError> {
        let response = self
            .client
            .post(url)
            .header(header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("Failed to reach GitHub: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| AuthError::Provider(format!("Unexpected GitHub response: {}", e)));
        }

        let parsed: GithubTokenResponse = serde_json::from_str(&body).unwrap_or_default();
        match parsed.error {
            Some(code) => Err(github_error(&code, parsed.error_description)),
            None if status.as_u16() == 404 || status.as_u16() == 401 => Err(
                AuthError::HandshakeMisconfigured(format!("GitHub rejected the OAuth client ({})", status)),
            ),
            None => Err(AuthError::Provider(format!("GitHub returned {}", status))),
        }
    }

    async fn request_device_code(&self, scopes: &[String]) -> Result<DeviceCodeResponse, AuthError> {
        let url = format!("{}/login/device/code", self.endpoints.github);
        let scope = scopes.join(" ");
        self.post_form(&url, &[("client_id", self.client_id.as_str()), ("scope", scope.as_str())])
            .await
    }

    async fn poll_for_grant(&self, device: &DeviceCodeResponse) -> Result<GithubGrant, AuthError> {
        let url = format!("{}/login/oauth/access_token", self.endpoints.github);
        let deadline = Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = device.interval;

        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if Instant::now() >= deadline {
                info!("Device code expired before authorization");
                return Err(AuthError::HandshakeCancelled);
            }

            let response: GithubTokenResponse = self
                .post_form(
                    &url,
                    &[
                        ("client_id", self.client_id.as_str()),
                        ("device_code", device.device_code.as_str()),
                        ("grant_type", DEVICE_GRANT_TYPE),
                    ],
                )
                .await?;

            if let Some(access_token) = response.access_token {
                let scopes = parse_scopes(response.scope.as_deref().unwrap_or_default());
                debug!(?scopes, "GitHub access token granted");
                return Ok(GithubGrant { access_token, scopes });
            }

            match response.error.as_deref() {
                Some("authorization_pending") => {}
                Some("slow_down") => {
                    interval = response
                        .interval
                        .unwrap_or(interval + SLOW_DOWN_INCREMENT_SECS);
                    debug!(interval, "GitHub asked to slow down polling");
                }
                Some(code) => return Err(github_error(code, response.error_description)),
                None => return Err(AuthError::Provider("Empty GitHub token response".to_string())),
            }
        }
    }

    async fn sign_in_with_idp(&self, access_token: &str) -> Result<SignInWithIdpResponse, AuthError> {
        let url = format!("{}/accounts:signInWithIdp", self.endpoints.identity_toolkit);
        let request = SignInWithIdpRequest {
            post_body: idp_post_body(access_token),
            request_uri: "http://localhost",
            return_idp_credential: true,
            return_secure_token: true,
        };

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("Failed to reach Firebase: {}", e)))?;

        Self::firebase_json(response).await
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<RefreshResponse, AuthError> {
        let url = format!("{}/token", self.endpoints.secure_token);
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("Failed to reach Firebase: {}", e)))?;

        Self::firebase_json(response).await
    }

    async fn firebase_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, AuthError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| AuthError::Provider(format!("Unexpected Firebase response: {}", e)));
        }
        let message = serde_json::from_str::<FirebaseErrorEnvelope>(&body)
            .map(|envelope| envelope.error.message)
            .unwrap_or_else(|_| format!("Firebase returned {}", status));
        Err(firebase_error(&message))
    }

    fn remember(&self, user: &SignedInUser) {
        if let Err(e) = self.save_session(&user.session) {
            warn!(error = %e, "Failed to save provider session");
        }
    }
}

fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Form-encoded credential Firebase verifies against the upstream provider.
fn idp_post_body(access_token: &str) -> String {
    format!(
        "access_token={}&providerId={}",
        urlencoding::encode(access_token),
        urlencoding::encode(GITHUB_PROVIDER_ID)
    )
}

fn expiry_from(expires_in: Option<&str>) -> Option<DateTime<Utc>> {
    let seconds: i64 = expires_in?.parse().ok()?;
    Some(Utc::now() + chrono::Duration::seconds(seconds))
}

fn github_error(code: &str, description: Option<String>) -> AuthError {
    let detail = description.unwrap_or_else(|| code.to_string());
    match code {
        "access_denied" | "expired_token" => AuthError::HandshakeCancelled,
        "incorrect_client_credentials"
        | "unsupported_grant_type"
        | "device_flow_disabled"
        | "incorrect_device_code"
        | "unauthorized_client" => AuthError::HandshakeMisconfigured(detail),
        _ => AuthError::Provider(detail),
    }
}

fn firebase_error(message: &str) -> AuthError {
    // Firebase messages look like "CODE" or "CODE : detail"
    let code = message.split(':').next().unwrap_or(message).trim();
    match code {
        "OPERATION_NOT_ALLOWED" | "INVALID_IDP_RESPONSE" | "INVALID_API_KEY"
        | "CONFIGURATION_NOT_FOUND" | "API_KEY_INVALID" => {
            AuthError::HandshakeMisconfigured(message.to_string())
        }
        _ if message.contains("API key not valid") => AuthError::HandshakeMisconfigured(message.to_string()),
        "USER_DISABLED" => AuthError::Provider("This account has been disabled".to_string()),
        _ => AuthError::Provider(message.to_string()),
    }
}

#[async_trait]
impl IdentityProvider for FirebaseGithubProvider {
    async fn sign_in(&self, scopes: &[String]) -> Result<Handshake, AuthError> {
        let device = self.request_device_code(scopes).await?;
        info!(verification_uri = %device.verification_uri, "Waiting for GitHub device authorization");
        self.notifier.notify(Notice::info(format!(
            "Open {} and enter code {}",
            device.verification_uri, device.user_code
        )));

        let grant = self.poll_for_grant(&device).await?;
        let idp = self.sign_in_with_idp(&grant.access_token).await?;

        let principal = Principal {
            uid: idp.local_id,
            display_name: idp.display_name,
            avatar_url: idp.photo_url,
            email: idp.email,
        };
        let user = SignedInUser {
            session: ProviderSession {
                principal: principal.clone(),
                refresh_token: idp.refresh_token,
            },
            id_token: Some(idp.id_token.clone()),
            id_token_expires_at: expiry_from(idp.expires_in.as_deref()),
        };
        self.remember(&user);
        *self.user.lock().await = Some(user);
        self.principal.send_replace(Some(principal.clone()));

        let granted = grant.scopes.iter().any(|s| s == SOURCE_CONTROL_SCOPE);
        if !granted {
            warn!(scopes = ?grant.scopes, "GitHub token lacks repository scope");
        }
        let access_token = (granted && !grant.access_token.is_empty()).then_some(grant.access_token);

        Ok(Handshake {
            principal,
            identity_token: idp.id_token,
            credential: ProviderCredential {
                provider_id: GITHUB_PROVIDER_ID.to_string(),
                access_token,
                scopes: grant.scopes,
            },
        })
    }

    fn subscribe(&self) -> watch::Receiver<Option<Principal>> {
        self.principal.subscribe()
    }

    async fn mint_identity_token(
        &self,
        principal: &Principal,
        force_refresh: bool,
    ) -> Result<String, AuthError> {
        let mut guard = self.user.lock().await;
        let user = guard
            .as_mut()
            .filter(|user| user.session.principal.uid == principal.uid)
            .ok_or_else(|| AuthError::Provider("No signed-in user for this principal".to_string()))?;

        if !force_refresh {
            if let Some(token) = user.cached_id_token() {
                return Ok(token);
            }
        }

        let refreshed = self.exchange_refresh_token(&user.session.refresh_token).await?;
        if refreshed.user_id != principal.uid {
            return Err(AuthError::Provider("Refreshed token belongs to a different user".to_string()));
        }

        user.session.refresh_token = refreshed.refresh_token;
        user.id_token = Some(refreshed.id_token.clone());
        user.id_token_expires_at = expiry_from(refreshed.expires_in.as_deref());
        self.remember(user);
        debug!(uid = %principal.uid, "Identity token minted");
        Ok(refreshed.id_token)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.user.lock().await.take();
        self.principal.send_replace(None);
        self.clear_session_file()
            .map_err(|e| AuthError::Provider(format!("Failed to remove provider session: {}", e)))
    }
}
