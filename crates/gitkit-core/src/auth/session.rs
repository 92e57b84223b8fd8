use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::credentials::{CredentialKey, CredentialStore};
use super::provider::{IdentityProvider, Principal};
use super::AuthError;
use crate::api::InvalidCredential;
use crate::notify::{Notice, Notifier};

/// Identity token expiry time in minutes.
/// Firebase ID tokens are valid for one hour after minting.
const IDENTITY_TOKEN_EXPIRY_MINUTES: i64 = 60;

/// Buffer time before expiry to trigger refresh (5 minutes)
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// Scopes requested during the sign-in handshake
pub const DEFAULT_SCOPES: [&str; 3] = ["repo", "read:user", "user:email"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum SessionStatus {
    /// Before the startup check has run
    #[default]
    Unknown,
    Authenticating,
    Authenticated,
    Unauthenticated,
}

/// Process-wide authentication state, published by the `SessionManager`.
#[derive(Clone, Default)]
pub struct Session {
    pub status: SessionStatus,
    pub principal: Option<Principal>,
    pub identity_issued_at: Option<DateTime<Utc>>,
    identity_token: Option<String>,
    source_control_token: Option<String>,
}

impl Session {
    fn authenticated(principal: Principal, identity_token: String, source_control_token: String) -> Self {
        Self {
            status: SessionStatus::Authenticated,
            principal: Some(principal),
            identity_issued_at: Some(Utc::now()),
            identity_token: Some(identity_token),
            source_control_token: Some(source_control_token),
        }
    }

    fn signed_out() -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            ..Self::default()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }

    pub fn identity_token(&self) -> Option<&str> {
        self.identity_token.as_deref()
    }

    pub fn source_control_token(&self) -> Option<&str> {
        self.source_control_token.as_deref()
    }

    /// Authenticated exactly when both tokens are held.
    pub fn is_consistent(&self) -> bool {
        let both = self.identity_token.is_some() && self.source_control_token.is_some();
        self.is_authenticated() == both
    }

    pub fn is_expired(&self) -> bool {
        match self.identity_issued_at {
            Some(issued) => Utc::now() > issued + Duration::minutes(IDENTITY_TOKEN_EXPIRY_MINUTES),
            None => true,
        }
    }

    /// Check if the identity token will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        match self.identity_issued_at {
            Some(issued) => {
                let refresh_at = issued
                    + Duration::minutes(IDENTITY_TOKEN_EXPIRY_MINUTES - TOKEN_REFRESH_BUFFER_MINUTES);
                Utc::now() > refresh_at
            }
            None => self.is_authenticated(),
        }
    }

    pub fn time_until_expiry(&self) -> Duration {
        match self.identity_issued_at {
            Some(issued) => issued + Duration::minutes(IDENTITY_TOKEN_EXPIRY_MINUTES) - Utc::now(),
            None => Duration::zero(),
        }
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status)
            .field("principal", &self.principal)
            .field("identity_issued_at", &self.identity_issued_at)
            .field("has_identity_token", &self.identity_token.is_some())
            .field("has_source_control_token", &self.source_control_token.is_some())
            .finish()
    }
}

/// Both bearer credentials, as attached to every backend request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity_token: String,
    pub source_control_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials { identity_token: [PRESENT], source_control_token: [PRESENT] }")
    }
}

/// What the credential store currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredCredentials {
    Present(Credentials),
    /// Exactly one token is stored; never usable
    Partial(InvalidCredential),
    Absent,
}

/// Read access to the session's credentials plus the single write the
/// request dispatcher is allowed: invalidating both.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn credentials(&self) -> StoredCredentials;

    async fn invalidate(&self, reason: InvalidCredential);
}

/// Capability to send the user back to the public sign-in entry point.
pub trait Navigator: Send + Sync {
    fn navigate_to_entry(&self);
}

/// Resets the in-flight flag when a sign-in finishes or its future is dropped.
struct SignInFlag<'a>(&'a AtomicBool);

impl Drop for SignInFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sole authority over the `Session` and the only writer of the credential store.
pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
    navigator: Arc<dyn Navigator>,
    notifier: Arc<dyn Notifier>,
    scopes: Vec<String>,
    state: watch::Sender<Session>,
    write_lock: Mutex<()>,
    // Bumped whenever a session is established or ended. Sign-in and refresh
    // results obtained under an older epoch are discarded.
    epoch: AtomicU64,
    sign_in_active: AtomicBool,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
        navigator: Arc<dyn Navigator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state, _) = watch::channel(Session::default());
        Self {
            store,
            provider,
            navigator,
            notifier,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            state,
            write_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
            sign_in_active: AtomicBool::new(false),
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Subscribe to session changes
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    /// Startup check. Promotes the session to `Authenticated` or
    /// `Unauthenticated`; never leaves it `Unknown`.
    pub async fn initialize(&self) -> SessionStatus {
        let _guard = self.write_lock.lock().await;

        let has_identity = self.store.contains(CredentialKey::IdentityToken);
        let source_control = self.store.get(CredentialKey::SourceControlToken);
        debug!(
            has_identity,
            has_source_control = source_control.is_some(),
            "Initial credential check"
        );

        let principal = self.provider.subscribe().borrow().clone();
        let Some(principal) = principal else {
            debug!("No active principal, clearing stored credentials");
            self.reset_locked();
            return SessionStatus::Unauthenticated;
        };

        let Some(source_control) = source_control else {
            warn!(uid = %principal.uid, "No GitHub token found, user must reconnect GitHub");
            self.notifier
                .notify(Notice::error("GitHub connection required. Please sign in with GitHub."));
            self.end_session_locked().await;
            return SessionStatus::Unauthenticated;
        };

        let identity_token = match self.provider.mint_identity_token(&principal, true).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to mint identity token during startup");
                self.notifier
                    .notify(Notice::error("Failed to authenticate. Please try again."));
                self.end_session_locked().await;
                return SessionStatus::Unauthenticated;
            }
        };

        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.persist(CredentialKey::IdentityToken, &identity_token);
        info!(uid = %principal.uid, "Session restored");
        self.state
            .send_replace(Session::authenticated(principal, identity_token, source_control));
        SessionStatus::Authenticated
    }

    /// Run the interactive handshake and establish a session with both tokens.
    pub async fn sign_in(&self) -> Result<Principal, AuthError> {
        if self.sign_in_active.swap(true, Ordering::SeqCst) {
            warn!("Sign-in requested while another is in flight");
            return Err(AuthError::SignInInProgress);
        }
        let _flag = SignInFlag(&self.sign_in_active);
        let epoch = self.epoch.load(Ordering::SeqCst);

        let prior_status = {
            let _guard = self.write_lock.lock().await;
            let prior = self.status();
            if prior != SessionStatus::Authenticated {
                self.state.send_modify(|s| s.status = SessionStatus::Authenticating);
            }
            prior
        };

        info!(scopes = ?self.scopes, "Starting GitHub sign in");
        let result = self.provider.sign_in(&self.scopes).await;
        let provider_signed_in = result.is_ok();

        let _guard = self.write_lock.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            info!("Session ended during sign-in, discarding result");
            if provider_signed_in {
                self.provider_sign_out().await;
            }
            self.notifier
                .notify(Notice::info(AuthError::Superseded.user_message()));
            return Err(AuthError::Superseded);
        }

        let outcome = result.and_then(|handshake| {
            match handshake.credential.access_token.filter(|t| !t.is_empty()) {
                Some(token) => Ok((handshake.principal, handshake.identity_token, token)),
                None => Err(AuthError::MissingScope),
            }
        });

        match outcome {
            Ok((principal, identity_token, source_control)) => {
                self.epoch.fetch_add(1, Ordering::SeqCst);
                self.persist(CredentialKey::SourceControlToken, &source_control);
                self.persist(CredentialKey::IdentityToken, &identity_token);
                info!(uid = %principal.uid, "GitHub sign in successful");
                self.state.send_replace(Session::authenticated(
                    principal.clone(),
                    identity_token,
                    source_control,
                ));
                self.notifier
                    .notify(Notice::success("Successfully signed in with GitHub!"));
                Ok(principal)
            }
            Err(AuthError::HandshakeCancelled) => {
                info!("Sign-in cancelled by user");
                self.state.send_modify(|s| {
                    if s.status == SessionStatus::Authenticating {
                        s.status = prior_status;
                    }
                });
                self.notifier
                    .notify(Notice::error(AuthError::HandshakeCancelled.user_message()));
                Err(AuthError::HandshakeCancelled)
            }
            Err(e) => {
                warn!(error = %e, "GitHub sign in failed");
                if provider_signed_in {
                    self.provider_sign_out().await;
                }
                self.reset_locked();
                self.notifier.notify(Notice::error(e.user_message()));
                Err(e)
            }
        }
    }

    /// Mint a new identity token without the interactive handshake.
    ///
    /// A failed refresh ends the whole session.
    pub async fn refresh_identity(&self) -> Result<(), AuthError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let principal = {
            let session = self.state.borrow();
            match &session.principal {
                Some(principal) if session.is_authenticated() => principal.clone(),
                _ => return Err(AuthError::NotSignedIn),
            }
        };

        debug!(uid = %principal.uid, "Refreshing identity token");
        let result = self.provider.mint_identity_token(&principal, true).await;

        let guard = self.write_lock.lock().await;
        let current = self.snapshot();
        let unchanged = self.epoch.load(Ordering::SeqCst) == epoch
            && current.is_authenticated()
            && current.principal.as_ref() == Some(&principal);
        if !unchanged {
            debug!(succeeded = result.is_ok(), "Session changed during refresh, discarding result");
            return Err(AuthError::Superseded);
        }

        match result {
            Ok(token) => {
                self.persist(CredentialKey::IdentityToken, &token);
                self.state.send_modify(|s| {
                    s.identity_token = Some(token);
                    s.identity_issued_at = Some(Utc::now());
                });
                debug!("Identity token refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Identity token refresh failed, ending session");
                let err = AuthError::RefreshFailed(e.to_string());
                self.epoch.fetch_add(1, Ordering::SeqCst);
                self.end_session_locked().await;
                drop(guard);
                self.notifier.notify(Notice::error(err.user_message()));
                Err(err)
            }
        }
    }

    /// Refresh only when the identity token is close to expiry.
    pub async fn ensure_fresh(&self) -> Result<(), AuthError> {
        let needs_refresh = {
            let session = self.state.borrow();
            if !session.is_authenticated() {
                return Err(AuthError::NotSignedIn);
            }
            session.needs_refresh()
        };
        if needs_refresh {
            self.refresh_identity().await
        } else {
            Ok(())
        }
    }

    /// Periodically refresh the identity token while authenticated.
    /// The task exits once the manager is dropped.
    pub fn spawn_refresh_task(self: &Arc<Self>, period: std::time::Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let due = {
                    let session = manager.state.borrow();
                    session.is_authenticated() && session.needs_refresh()
                };
                if due {
                    if let Err(e) = manager.refresh_identity().await {
                        debug!(error = %e, "Background refresh did not complete");
                    }
                }
            }
        })
    }

    /// Clear both tokens and return to the entry point. Safe to call repeatedly.
    pub async fn sign_out(&self) {
        self.sign_out_with(Notice::success("Signed out successfully"))
            .await;
    }

    async fn sign_out_with(&self, notice: Notice) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _guard = self.write_lock.lock().await;
        info!("Signing out");
        self.end_session_locked().await;
        self.notifier.notify(notice);
    }

    // Callers of the *_locked helpers hold `write_lock`.

    async fn end_session_locked(&self) {
        self.provider_sign_out().await;
        self.reset_locked();
        self.navigator.navigate_to_entry();
    }

    fn reset_locked(&self) {
        self.store.clear_all();
        self.state.send_replace(Session::signed_out());
    }

    async fn provider_sign_out(&self) {
        if let Err(e) = self.provider.sign_out().await {
            warn!(error = %e, "Identity provider sign-out failed, clearing local state anyway");
        }
    }

    fn persist(&self, key: CredentialKey, value: &str) {
        if let Err(e) = self.store.set(key, value) {
            warn!(key = key.as_str(), error = %e, "Failed to persist credential, keeping it in memory");
        }
    }
}

#[async_trait]
impl CredentialSource for SessionManager {
    /// Reads the store, falling back to the in-memory session for entries a
    /// failed write never persisted.
    fn credentials(&self) -> StoredCredentials {
        let (memory_identity, memory_source_control) = {
            let session = self.state.borrow();
            (session.identity_token.clone(), session.source_control_token.clone())
        };
        let identity = self
            .store
            .get(CredentialKey::IdentityToken)
            .or(memory_identity);
        let source_control = self
            .store
            .get(CredentialKey::SourceControlToken)
            .or(memory_source_control);

        match (identity, source_control) {
            (Some(identity_token), Some(source_control_token)) => {
                StoredCredentials::Present(Credentials {
                    identity_token,
                    source_control_token,
                })
            }
            (Some(_), None) => StoredCredentials::Partial(InvalidCredential::MissingSourceControlToken),
            (None, Some(_)) => StoredCredentials::Partial(InvalidCredential::MissingIdentityToken),
            (None, None) => StoredCredentials::Absent,
        }
    }

    async fn invalidate(&self, reason: InvalidCredential) {
        let _guard = self.write_lock.lock().await;
        let had_session = self.status() != SessionStatus::Unauthenticated
            || CredentialKey::ALL.iter().any(|key| self.store.contains(*key));
        if !had_session {
            debug!(%reason, "Session already cleared");
            return;
        }
        warn!(%reason, "Credentials rejected, clearing session");
        self.end_session_locked().await;
    }
}
