//! gitkit core library.
//!
//! Session coordination for the gitkit repository-analysis backend:
//! - `auth`: credential storage, the session manager, and the identity provider
//! - `api`: the request dispatcher (`ApiClient`) and backend endpoints
//! - `config`: application configuration
//! - `notify`: user-visible notices

pub mod api;
pub mod auth;
pub mod config;
pub mod notify;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiClient, ApiError, InvalidCredential, RepoRef};
pub use auth::{
    AuthError, CredentialKey, CredentialSource, CredentialStore, Credentials, FileStore,
    FirebaseGithubProvider, IdentityProvider, KeyringStore, MemoryStore, Navigator, Principal,
    Session, SessionManager, SessionStatus,
};
pub use config::{Config, CredentialBackend};
pub use notify::{LogNotifier, Notice, NoticeLevel, Notifier};
