//! API client for communicating with the gitkit backend.
//!
//! Every call goes through `dispatch`, which attaches both credentials,
//! refuses to send without them, and turns credential rejections into a
//! session invalidation.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::models::{GeneratedDocs, GenerateDocsRequest, HealthQuery, RepoRef};
use super::ApiError;
use crate::auth::{CredentialSource, StoredCredentials};
use crate::config::Config;
use crate::notify::{Notice, Notifier};

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the GitHub access token
const SOURCE_CONTROL_TOKEN_HEADER: &str = "x-github-token";

/// API client for the gitkit backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
    notifier: Arc<dyn Notifier>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: Arc<dyn CredentialSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(ApiError::NetworkError)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            notifier,
        })
    }

    pub fn from_config(
        config: &Config,
        credentials: Arc<dyn CredentialSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ApiError> {
        Self::new(
            config.api_base_url.clone(),
            config.request_timeout(),
            credentials,
            notifier,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Surface an error to the user and hand it back to the caller.
    fn fail(&self, err: ApiError) -> ApiError {
        self.notifier.notify(Notice::error(err.user_message()));
        err
    }

    /// Attach both credentials, or refuse before any network I/O.
    async fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        match self.credentials.credentials() {
            StoredCredentials::Present(credentials) => Ok(builder
                .bearer_auth(&credentials.identity_token)
                .header(SOURCE_CONTROL_TOKEN_HEADER, &credentials.source_control_token)),
            StoredCredentials::Partial(reason) => {
                warn!(%reason, "Only one credential stored, clearing session");
                self.credentials.invalidate(reason).await;
                Err(self.fail(ApiError::Unauthenticated))
            }
            StoredCredentials::Absent => {
                debug!("No stored credentials, request not sent");
                Err(self.fail(ApiError::Unauthenticated))
            }
        }
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        configure: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, ApiError> {
        let url = self.url(path);
        let builder = self
            .authorize(self.client.request(method.clone(), &url))
            .await?;

        debug!(%method, url = %url, "API request");
        let response = match configure(builder).send().await {
            Ok(response) => response,
            Err(e) => {
                let err = ApiError::from_transport(e);
                match &err {
                    ApiError::Timeout => warn!(url = %url, "Request timed out"),
                    other => error!(url = %url, error = %other, "Request failed"),
                }
                return Err(self.fail(err));
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, status = status.as_u16(), "API response");
            return Ok(response);
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let err = ApiError::from_transport(e);
                warn!(url = %url, status = status.as_u16(), error = %err, "Failed to read error body");
                return Err(self.fail(err));
            }
        };
        let err = ApiError::from_response(status, &body);
        match &err {
            ApiError::CredentialInvalid { reason, .. } => {
                warn!(url = %url, status = status.as_u16(), %reason, "Backend rejected credentials");
                self.credentials.invalidate(*reason).await;
            }
            other => error!(url = %url, status = status.as_u16(), error = %other, "API error"),
        }
        Err(self.fail(err))
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| self.fail(ApiError::from_transport(e)))
    }

    /// Issue an authenticated request. A successful response is returned unchanged.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        self.dispatch(method, path, |builder| match body {
            Some(body) => builder.json(body),
            None => builder,
        })
        .await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.dispatch(Method::GET, path, |builder| builder).await?;
        self.decode(response).await
    }

    pub async fn get_with_query<T, Q>(&self, path: &str, query: &Q) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let response = self
            .dispatch(Method::GET, path, |builder| builder.query(query))
            .await?;
        self.decode(response).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self
            .dispatch(Method::POST, path, |builder| builder.json(body))
            .await?;
        self.decode(response).await
    }

    // ===== Data Fetching Methods =====

    /// Fetch the signed-in user's GitHub profile
    pub async fn fetch_profile(&self) -> Result<Value, ApiError> {
        self.get("/api/github/profile").await
    }

    /// Fetch the signed-in user's repositories
    pub async fn fetch_repositories(&self) -> Result<Value, ApiError> {
        self.get("/api/github/repositories").await
    }

    pub async fn fetch_repository(&self, repo: &RepoRef) -> Result<Value, ApiError> {
        self.get(&format!("/api/github/repositories/{}/{}", repo.owner, repo.name))
            .await
    }

    /// Fetch the AI analysis of a repository
    pub async fn fetch_analysis(&self, repo: &RepoRef) -> Result<Value, ApiError> {
        self.get(&format!("/api/repository/{}/{}/analysis", repo.owner, repo.name))
            .await
    }

    pub async fn fetch_health(&self, repo: &RepoRef, query: HealthQuery) -> Result<Value, ApiError> {
        self.get_with_query(
            &format!("/api/repository/{}/{}/health", repo.owner, repo.name),
            &query,
        )
        .await
    }

    pub async fn fetch_dependencies(&self, repo: &RepoRef) -> Result<Value, ApiError> {
        self.get(&format!("/api/repository/{}/{}/dependencies", repo.owner, repo.name))
            .await
    }

    /// Fetch the commit activity timeseries
    pub async fn fetch_activity(&self, repo: &RepoRef) -> Result<Value, ApiError> {
        self.get(&format!("/api/repository/{}/{}/activity", repo.owner, repo.name))
            .await
    }

    /// Fetch the file analysis used as input for documentation generation
    pub async fn analyze_for_docs(&self, repo: &RepoRef) -> Result<Value, ApiError> {
        self.get(&format!("/api/github/{}/{}/analyze-for-docs", repo.owner, repo.name))
            .await
    }

    /// Generate documentation text for a repository
    pub async fn generate_docs(&self, request: &GenerateDocsRequest) -> Result<String, ApiError> {
        let docs: GeneratedDocs = self.post("/api/github/generate-docs", request).await?;
        Ok(docs.documentation)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{any, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::auth::{CredentialKey, CredentialStore, SessionStatus};
    use crate::testing::{handshake, Harness, MockProvider};

    fn client(server: &MockServer, h: &Harness, timeout: Duration) -> ApiClient {
        ApiClient::new(server.uri(), timeout, h.manager.clone(), h.notifier.clone()).unwrap()
    }

    async fn signed_in() -> Harness {
        let provider = MockProvider::new();
        provider.push_sign_in(Ok(handshake("u1", "id1", Some("gh1"))));
        let h = Harness::new(provider);
        h.manager.sign_in().await.unwrap();
        h
    }

    #[tokio::test]
    async fn test_no_request_without_credentials() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let h = Harness::new(MockProvider::new());
        let api = client(&server, &h, Duration::from_secs(5));

        let err = api.fetch_profile().await.unwrap_err();

        assert!(matches!(err, ApiError::Unauthenticated));
        assert_eq!(h.notifier.last().unwrap().message, "Please sign in to continue.");
        assert_eq!(h.navigator.count(), 0);
    }

    #[tokio::test]
    async fn test_partial_credentials_clear_store_without_request() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let h = Harness::new(MockProvider::new());
        h.store.set(CredentialKey::IdentityToken, "abc").unwrap();
        let api = client(&server, &h, Duration::from_secs(5));

        let err = api.fetch_repositories().await.unwrap_err();

        assert!(matches!(err, ApiError::Unauthenticated));
        assert!(h.store.is_empty());
        assert_eq!(h.navigator.count(), 1);
    }

    #[tokio::test]
    async fn test_attaches_both_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/github/profile"))
            .and(header("authorization", "Bearer id1"))
            .and(header("x-github-token", "gh1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"login": "octocat"})))
            .expect(1)
            .mount(&server)
            .await;
        let h = signed_in().await;
        let api = client(&server, &h, Duration::from_secs(5));

        let profile = api.fetch_profile().await.unwrap();

        assert_eq!(profile["login"], "octocat");
    }

    #[tokio::test]
    async fn test_success_passes_through_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/cache"))
            .respond_with(ResponseTemplate::new(204).insert_header("x-request-id", "r-1"))
            .mount(&server)
            .await;
        let h = signed_in().await;
        let api = client(&server, &h, Duration::from_secs(5));

        let response = api.request(Method::DELETE, "api/cache", None).await.unwrap();

        assert_eq!(response.status().as_u16(), 204);
        assert_eq!(response.headers()["x-request-id"], "r-1");
    }

    #[tokio::test]
    async fn test_invalid_github_token_clears_session_and_redirects_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/github/repositories"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "Invalid GitHub token",
                "details": "Bad credentials"
            })))
            .mount(&server)
            .await;
        let h = signed_in().await;
        let api = client(&server, &h, Duration::from_secs(5));

        let err = api.fetch_repositories().await.unwrap_err();

        assert!(matches!(
            err,
            ApiError::CredentialInvalid {
                reason: crate::api::InvalidCredential::InvalidSourceControlToken,
                ..
            }
        ));
        assert!(h.store.is_empty());
        assert_eq!(h.navigator.count(), 1);
        assert_eq!(h.manager.status(), SessionStatus::Unauthenticated);
        assert_eq!(h.notifier.last().unwrap().message, "Bad credentials");
    }

    #[tokio::test]
    async fn test_every_credential_code_clears_both_tokens() {
        let codes = [
            "Invalid Firebase token",
            "Invalid GitHub token",
            "GitHub authentication required",
            "Firebase ID token has expired",
            "No authorization header provided",
            "No GitHub token provided",
            "No Firebase token found",
            "No GitHub token found",
        ];
        for code in codes {
            let server = MockServer::start().await;
            Mock::given(any())
                .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": code })))
                .mount(&server)
                .await;
            let h = signed_in().await;
            let api = client(&server, &h, Duration::from_secs(5));

            let err = api.fetch_profile().await.unwrap_err();

            assert!(matches!(err, ApiError::CredentialInvalid { .. }), "{code}");
            assert!(!h.store.contains(CredentialKey::IdentityToken), "{code}");
            assert!(!h.store.contains(CredentialKey::SourceControlToken), "{code}");
            assert_eq!(
                h.notifier.last().unwrap().message,
                "Authentication failed. Please sign in again."
            );
        }
    }

    #[tokio::test]
    async fn test_timeout_leaves_session_untouched() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;
        let h = signed_in().await;
        let api = client(&server, &h, Duration::from_millis(50));

        let err = api.fetch_profile().await.unwrap_err();

        assert!(matches!(err, ApiError::Timeout));
        assert_eq!(h.store.get(CredentialKey::IdentityToken).as_deref(), Some("id1"));
        assert_eq!(h.store.get(CredentialKey::SourceControlToken).as_deref(), Some("gh1"));
        assert_eq!(h.manager.status(), SessionStatus::Authenticated);
        assert_eq!(h.navigator.count(), 0);
        assert_eq!(
            h.notifier.last().unwrap().message,
            "Request timed out. Please try again."
        );
    }

    /// Serves one 500 response whose body stalls after the first bytes.
    async fn stalled_error_body() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = "HTTP/1.1 500 Internal Server Error\r\n\
                        content-type: application/json\r\n\
                        content-length: 200\r\n\r\n{\"error\":";
            socket.write_all(head.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_timeout_while_reading_error_body() {
        let url = stalled_error_body().await;
        let h = signed_in().await;
        let api = ApiClient::new(url, Duration::from_millis(200), h.manager.clone(), h.notifier.clone())
            .unwrap();

        let err = api.fetch_profile().await.unwrap_err();

        assert!(matches!(err, ApiError::Timeout), "unexpected {err:?}");
        assert_eq!(h.manager.status(), SessionStatus::Authenticated);
        assert!(h.store.contains(CredentialKey::SourceControlToken));
        assert_eq!(
            h.notifier.last().unwrap().message,
            "Request timed out. Please try again."
        );
    }

    #[tokio::test]
    async fn test_server_error_passes_message_through() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": "Failed to analyze repository"
            })))
            .mount(&server)
            .await;
        let h = signed_in().await;
        let api = client(&server, &h, Duration::from_secs(5));

        let err = api
            .fetch_analysis(&RepoRef::new("octocat", "hello"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::ServerError { status: 500, .. }));
        assert_eq!(h.manager.status(), SessionStatus::Authenticated);
        assert!(h.store.contains(CredentialKey::SourceControlToken));
        assert_eq!(h.notifier.last().unwrap().message, "Failed to analyze repository");
    }

    #[tokio::test]
    async fn test_undecodable_success_body() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        let h = signed_in().await;
        let api = client(&server, &h, Duration::from_secs(5));

        let err = api.fetch_profile().await.unwrap_err();

        assert!(matches!(err, ApiError::InvalidResponse(_)));
        assert!(h.manager.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn test_health_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/repository/octocat/hello/health"))
            .and(query_param("analyze_code", "true"))
            .and(query_param("detailed", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"overallScore": 87})))
            .expect(1)
            .mount(&server)
            .await;
        let h = signed_in().await;
        let api = client(&server, &h, Duration::from_secs(5));

        let health = api
            .fetch_health(
                &RepoRef::new("octocat", "hello"),
                HealthQuery {
                    analyze_code: true,
                    detailed: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(health["overallScore"], 87);
    }

    #[tokio::test]
    async fn test_generate_docs_returns_documentation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/github/generate-docs"))
            .and(body_partial_json(json!({"docType": "readme"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "documentation": "# hello\n"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let h = signed_in().await;
        let api = client(&server, &h, Duration::from_secs(5));

        let docs = api
            .generate_docs(&GenerateDocsRequest {
                repo_data: json!({"name": "hello"}),
                doc_type: "readme".into(),
                file_analysis: None,
            })
            .await
            .unwrap();

        assert_eq!(docs, "# hello\n");
    }
}
