//! REST API client module for the gitkit backend.
//!
//! This module provides the `ApiClient`, the single request dispatcher used
//! by every data-fetching call site. Each request carries the Firebase ID
//! token as a bearer credential and the GitHub token in `x-github-token`.

pub mod client;
pub mod error;
pub mod models;

pub use client::ApiClient;
pub use error::{ApiError, InvalidCredential};
pub use models::{GenerateDocsRequest, HealthQuery, RepoRef};
