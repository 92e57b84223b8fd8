use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Server-reported reasons the request's credentials cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCredential {
    InvalidIdentityToken,
    ExpiredIdentityToken,
    MissingIdentityToken,
    InvalidSourceControlToken,
    SourceControlAuthRequired,
    MissingSourceControlToken,
    MissingAuthorization,
}

impl InvalidCredential {
    /// Recognize a backend error code. Unknown codes are not credential failures.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "Invalid Firebase token" => Some(Self::InvalidIdentityToken),
            "Firebase ID token has expired" => Some(Self::ExpiredIdentityToken),
            "No Firebase token found" => Some(Self::MissingIdentityToken),
            "Invalid GitHub token" => Some(Self::InvalidSourceControlToken),
            "GitHub authentication required" => Some(Self::SourceControlAuthRequired),
            "No GitHub token provided" | "No GitHub token found" => {
                Some(Self::MissingSourceControlToken)
            }
            "No authorization header provided" => Some(Self::MissingAuthorization),
            _ => None,
        }
    }
}

impl fmt::Display for InvalidCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::InvalidIdentityToken => "invalid identity token",
            Self::ExpiredIdentityToken => "expired identity token",
            Self::MissingIdentityToken => "missing identity token",
            Self::InvalidSourceControlToken => "invalid GitHub token",
            Self::SourceControlAuthRequired => "GitHub authentication required",
            Self::MissingSourceControlToken => "missing GitHub token",
            Self::MissingAuthorization => "missing authorization",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not signed in - no stored credentials")]
    Unauthenticated,

    #[error("Credentials rejected ({reason}) - please sign in again")]
    CredentialInvalid {
        reason: InvalidCredential,
        details: Option<String>,
    },

    #[error("Request timed out")]
    Timeout,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(#[source] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Error payload returned by the backend
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    details: Option<String>,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Classify a non-success response.
    pub fn from_response(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();

        if let Some(reason) = parsed.error.as_deref().and_then(InvalidCredential::from_code) {
            return ApiError::CredentialInvalid {
                reason,
                details: parsed.details,
            };
        }

        let message = parsed
            .error
            .or(parsed.details)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("Request failed")
                        .to_string()
                } else {
                    Self::truncate_body(body)
                }
            });

        ApiError::ServerError {
            status: status.as_u16(),
            message,
        }
    }

    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ApiError::Timeout
        } else if error.is_decode() {
            ApiError::InvalidResponse(error.to_string())
        } else {
            ApiError::NetworkError(error)
        }
    }

    /// Message shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Unauthenticated => "Please sign in to continue.".to_string(),
            ApiError::CredentialInvalid { details, .. } => details
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| "Authentication failed. Please sign in again.".to_string()),
            ApiError::Timeout => "Request timed out. Please try again.".to_string(),
            ApiError::ServerError { message, .. } => message.clone(),
            ApiError::NetworkError(e) => e.to_string(),
            ApiError::InvalidResponse(_) => "An error occurred. Please try again.".to_string(),
        }
    }

    /// Whether the request failed for lack of usable credentials. The user
    /// has to sign in again before retrying.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Unauthenticated | ApiError::CredentialInvalid { .. })
    }
}
