//! Identity provider boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::AuthError;

/// The signed-in user as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Principal {
    pub uid: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
}

impl Principal {
    pub fn display_label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.uid)
    }
}

/// Credential issued by the upstream provider (GitHub) during the handshake.
///
/// `access_token` is `None` when the requested source-control scopes were not granted.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredential {
    pub provider_id: String,
    pub access_token: Option<String>,
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("provider_id", &self.provider_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "[PRESENT]"))
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Result of a completed interactive sign-in.
#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub principal: Principal,
    pub identity_token: String,
    pub credential: ProviderCredential,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("principal", &self.principal)
            .field("identity_token", &"[PRESENT]")
            .field("credential", &self.credential)
            .finish()
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Run the interactive, provider-hosted sign-in requesting `scopes`.
    async fn sign_in(&self, scopes: &[String]) -> Result<Handshake, AuthError>;

    /// Current principal and subsequent changes.
    fn subscribe(&self) -> watch::Receiver<Option<Principal>>;

    /// Mint an identity token for `principal` without user interaction.
    async fn mint_identity_token(
        &self,
        principal: &Principal,
        force_refresh: bool,
    ) -> Result<String, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;
}
