use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Sign-in was cancelled")]
    HandshakeCancelled,

    #[error("Identity provider rejected the client configuration: {0}")]
    HandshakeMisconfigured(String),

    #[error("No GitHub token received")]
    MissingScope,

    #[error("Identity provider error: {0}")]
    Provider(String),

    #[error("A sign-in is already in progress")]
    SignInInProgress,

    #[error("Result discarded because the session changed")]
    Superseded,

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Failed to refresh identity token: {0}")]
    RefreshFailed(String),
}

impl AuthError {
    /// Message shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::HandshakeCancelled => "Login cancelled. Please try again.".to_string(),
            AuthError::HandshakeMisconfigured(_) => {
                "OAuth configuration error. Please check GitHub app settings.".to_string()
            }
            AuthError::MissingScope => {
                "No GitHub token received. Please grant repository access and try again.".to_string()
            }
            AuthError::Provider(msg) if !msg.is_empty() => msg.clone(),
            AuthError::Provider(_) => "Failed to sign in with GitHub".to_string(),
            AuthError::SignInInProgress => "Sign-in already in progress.".to_string(),
            AuthError::Superseded => "Sign-in discarded because you signed out.".to_string(),
            AuthError::NotSignedIn => "Please sign in to continue.".to_string(),
            AuthError::RefreshFailed(_) => "Session expired. Please sign in again.".to_string(),
        }
    }
}
