//! Authentication module for managing the two-credential session.
//!
//! This module provides:
//! - `CredentialStore`: durable storage for the identity and GitHub tokens
//! - `SessionManager`: sign-in, refresh, sign-out and invalidation
//! - `IdentityProvider`: the provider boundary, with a Firebase/GitHub implementation
//!
//! A session is usable only while both tokens are present; losing either
//! clears both.

pub mod credentials;
pub mod error;
pub mod firebase;
pub mod provider;
pub mod session;

pub use credentials::{CredentialKey, CredentialStore, FileStore, KeyringStore, MemoryStore, StoreError};
pub use error::AuthError;
pub use firebase::{FirebaseGithubProvider, ProviderEndpoints};
pub use provider::{Handshake, IdentityProvider, Principal, ProviderCredential};
pub use session::{
    CredentialSource, Credentials, Navigator, Session, SessionManager, SessionStatus,
    StoredCredentials, DEFAULT_SCOPES,
};
