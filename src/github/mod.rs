//! GitHub REST client implementing [`DiffSource`] and [`Platform`], plus the
//! credential values it authenticates with.

use crate::platform::{
    Ancestry, AncestryStatus, DiffSource, Platform, PlatformError, Result, ReviewEvent,
};
use crate::{CommitRef, ReviewKey, ReviewMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const API_BASE_URL: &str = "https://api.github.com";

const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const DIFF_MEDIA_TYPE: &str = "application/vnd.github.v3.diff";

/// An access token and when it stops working.
///
/// Never mutated; a refresh produces a new value.
#[derive(Debug)]
pub struct Credentials {
    token: SecretString,
    expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(token: SecretString, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { token, expires_at }
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Whether the token expires before `now + window`.
    pub fn expires_within(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now + window)
    }
}

/// Looks up credentials for an installation before each use.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, installation_id: u64) -> Result<Arc<Credentials>>;
}

/// Issues fresh installation tokens (the token exchange itself lives elsewhere).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn issue(&self, installation_id: u64) -> Result<Credentials>;
}

/// A fixed token that never expires.
pub struct StaticToken {
    credentials: Arc<Credentials>,
}

impl StaticToken {
    pub fn new(token: SecretString) -> Self {
        Self {
            credentials: Arc::new(Credentials::new(token, None)),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn credentials(&self, _installation_id: u64) -> Result<Arc<Credentials>> {
        Ok(Arc::clone(&self.credentials))
    }
}

/// Caches issued tokens per installation and replaces any that expire
/// within the refresh window.
pub struct CredentialCache<S> {
    source: S,
    refresh_window: chrono::Duration,
    tokens: Mutex<HashMap<u64, Arc<Credentials>>>,
}

impl<S: TokenSource> CredentialCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            refresh_window: chrono::Duration::hours(1),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_refresh_window(mut self, window: chrono::Duration) -> Self {
        self.refresh_window = window;
        self
    }
}

#[async_trait]
impl<S: TokenSource> CredentialProvider for CredentialCache<S> {
    async fn credentials(&self, installation_id: u64) -> Result<Arc<Credentials>> {
        let mut tokens = self.tokens.lock().await;
        if let Some(cached) = tokens.get(&installation_id) {
            if !cached.expires_within(self.refresh_window, Utc::now()) {
                return Ok(Arc::clone(cached));
            }
        }

        debug!(installation_id, "issuing installation token");
        let fresh = Arc::new(self.source.issue(installation_id).await?);
        tokens.insert(installation_id, Arc::clone(&fresh));
        Ok(fresh)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    pub label: String,
    pub sha: String,
}

/// The subset of a pull request object the engine reads, shared by the REST
/// API and webhook payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub user: Account,
    pub base: Branch,
    pub head: Branch,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub merged: bool,
}

impl PullRequest {
    pub fn into_metadata(self, owner: &str, repo: &str) -> ReviewMetadata {
        ReviewMetadata {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number: self.number,
            author: self.user.login,
            title: self.title,
            base: CommitRef {
                label: self.base.label,
                sha: self.base.sha,
            },
            head: CommitRef {
                label: self.head.label,
                sha: self.head.sha,
            },
            updated_at: self.updated_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Comparison {
    status: String,
    ahead_by: u32,
    behind_by: u32,
}

#[derive(Debug, Serialize)]
struct NewReview<'a> {
    body: &'a str,
    event: &'static str,
}

#[derive(Debug, Serialize)]
struct ReviewBody<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct PostedReview {
    id: u64,
}

/// GitHub REST API client for one app installation.
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    installation_id: u64,
    base_url: String,
}

impl GitHubClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>, installation_id: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("review-sync"));
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_MEDIA_TYPE));
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| PlatformError::Http {
                endpoint: "client".to_string(),
                source,
            })?;

        Ok(Self {
            client,
            credentials,
            installation_id,
            base_url: API_BASE_URL.to_string(),
        })
    }

    /// Point the client at another API root (GitHub Enterprise, wiremock).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    async fn request(&self, method: Method, endpoint: &str) -> Result<RequestBuilder> {
        let credentials = self.credentials.credentials(self.installation_id).await?;
        Ok(self
            .client
            .request(method, format!("{}{}", self.base_url, endpoint))
            .bearer_auth(credentials.token().expose_secret()))
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|source| PlatformError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;

        let status = response.status();
        debug!(endpoint, status = %status, "github response");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn json<T: for<'de> Deserialize<'de>>(&self, endpoint: &str, response: Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| PlatformError::InvalidResponse {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })
    }
}

fn repo_path(key: &ReviewKey) -> String {
    format!("/repos/{}/{}", key.owner, key.repo)
}

fn parse_ancestry_status(endpoint: &str, status: &str) -> Result<AncestryStatus> {
    match status {
        "ahead" => Ok(AncestryStatus::Ahead),
        "behind" => Ok(AncestryStatus::Behind),
        "identical" => Ok(AncestryStatus::Identical),
        "diverged" => Ok(AncestryStatus::Diverged),
        other => Err(PlatformError::InvalidResponse {
            endpoint: endpoint.to_string(),
            message: format!("unknown comparison status '{}'", other),
        }),
    }
}

#[async_trait]
impl DiffSource for GitHubClient {
    async fn fetch_diff(&self, key: &ReviewKey, base_sha: &str, head_sha: &str) -> Result<String> {
        let endpoint = format!("{}/compare/{}...{}", repo_path(key), base_sha, head_sha);
        let request = self
            .request(Method::GET, &endpoint)
            .await?
            .header(ACCEPT, DIFF_MEDIA_TYPE);
        let response = self.send(&endpoint, request).await?;
        response.text().await.map_err(|source| PlatformError::Http { endpoint, source })
    }

    async fn compare_ancestry(&self, key: &ReviewKey, sha_a: &str, sha_b: &str) -> Result<Ancestry> {
        let endpoint = format!("{}/compare/{}...{}", repo_path(key), sha_a, sha_b);
        let request = self.request(Method::GET, &endpoint).await?;
        let response = self.send(&endpoint, request).await?;
        let comparison: Comparison = self.json(&endpoint, response).await?;

        Ok(Ancestry {
            status: parse_ancestry_status(&endpoint, &comparison.status)?,
            ahead_by: comparison.ahead_by,
            behind_by: comparison.behind_by,
        })
    }
}

#[async_trait]
impl Platform for GitHubClient {
    async fn fetch_current_metadata(&self, key: &ReviewKey) -> Result<ReviewMetadata> {
        let endpoint = format!("{}/pulls/{}", repo_path(key), key.number);
        let request = self.request(Method::GET, &endpoint).await?;
        let response = self.send(&endpoint, request).await?;
        let pull: PullRequest = self.json(&endpoint, response).await?;
        Ok(pull.into_metadata(&key.owner, &key.repo))
    }

    async fn post_review_summary(&self, key: &ReviewKey, event: ReviewEvent, body: &str) -> Result<u64> {
        let endpoint = format!("{}/pulls/{}/reviews", repo_path(key), key.number);
        let request = self
            .request(Method::POST, &endpoint)
            .await?
            .json(&NewReview { body, event: event.as_str() });
        let response = self.send(&endpoint, request).await?;
        let posted: PostedReview = self.json(&endpoint, response).await?;
        info!(review = %key, review_id = posted.id, event = event.as_str(), "posted review summary");
        Ok(posted.id)
    }

    async fn update_review_summary(&self, key: &ReviewKey, review_id: u64, body: &str) -> Result<()> {
        let endpoint = format!("{}/pulls/{}/reviews/{}", repo_path(key), key.number, review_id);
        let request = self
            .request(Method::PUT, &endpoint)
            .await?
            .json(&ReviewBody { body });
        self.send(&endpoint, request).await?;
        debug!(review = %key, review_id, "updated review summary");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> GitHubClient {
        let token = StaticToken::new(SecretString::from("ghs_test".to_string()));
        GitHubClient::new(Arc::new(token), 1)
            .unwrap()
            .with_base_url(base_url)
    }

    fn key() -> ReviewKey {
        ReviewKey::new("octo", "widgets", 7)
    }

    #[tokio::test]
    async fn fetches_pull_request_metadata() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "number": 7,
            "title": "Add widgets",
            "user": {"login": "carol"},
            "base": {"label": "octo:main", "ref": "main", "sha": "b1"},
            "head": {"label": "carol:feature", "ref": "feature", "sha": "h1"},
            "updated_at": "2024-03-01T12:00:00Z",
            "merged": false
        });

        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets/pulls/7"))
            .and(header("authorization", "Bearer ghs_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        let metadata = test_client(&server.uri()).fetch_current_metadata(&key()).await.unwrap();
        assert_eq!(metadata.author, "carol");
        assert_eq!(metadata.base.sha, "b1");
        assert_eq!(metadata.head.label, "carol:feature");
        assert_eq!(metadata.updated_at, 1_709_294_400_000);
    }

    #[tokio::test]
    async fn fetches_diff_with_diff_media_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets/compare/b1...h1"))
            .and(header("accept", DIFF_MEDIA_TYPE))
            .respond_with(ResponseTemplate::new(200).set_body_string("diff --git a/x b/x\n"))
            .mount(&server)
            .await;

        let diff = test_client(&server.uri()).fetch_diff(&key(), "b1", "h1").await.unwrap();
        assert_eq!(diff, "diff --git a/x b/x\n");
    }

    #[tokio::test]
    async fn maps_comparison_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets/compare/b1...b0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "behind", "ahead_by": 0, "behind_by": 3
            })))
            .mount(&server)
            .await;

        let ancestry = test_client(&server.uri())
            .compare_ancestry(&key(), "b1", "b0")
            .await
            .unwrap();
        assert_eq!(ancestry.status, AncestryStatus::Behind);
        assert_eq!(ancestry.distance(), 3);
    }

    #[tokio::test]
    async fn posts_and_updates_review_summaries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/octo/widgets/pulls/7/reviews"))
            .and(body_json(serde_json::json!({"body": "hello", "event": "APPROVE"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 555})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/octo/widgets/pulls/7/reviews/555"))
            .and(body_json(serde_json::json!({"body": "edited"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 555})))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let id = client
            .post_or_update_review_summary(&key(), None, Some(ReviewEvent::Approve), "hello")
            .await
            .unwrap();
        assert_eq!(id, 555);
        let same = client
            .post_or_update_review_summary(&key(), Some(id), None, "edited")
            .await
            .unwrap();
        assert_eq!(same, 555);
    }

    #[tokio::test]
    async fn error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/widgets/pulls/7"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let err = test_client(&server.uri())
            .fetch_current_metadata(&key())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Status { status: 404, .. }));
    }

    struct CountingSource {
        issued: AtomicUsize,
        lifetime: chrono::Duration,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn issue(&self, installation_id: u64) -> Result<Credentials> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(Credentials::new(
                SecretString::from(format!("token-{}-{}", installation_id, n)),
                Some(Utc::now() + self.lifetime),
            ))
        }
    }

    #[tokio::test]
    async fn cache_reuses_long_lived_tokens() {
        let cache = CredentialCache::new(CountingSource {
            issued: AtomicUsize::new(0),
            lifetime: chrono::Duration::hours(2),
        });
        let first = cache.credentials(1).await.unwrap();
        let second = cache.credentials(1).await.unwrap();
        assert_eq!(first.token().expose_secret(), second.token().expose_secret());

        let other = cache.credentials(2).await.unwrap();
        assert_eq!(other.token().expose_secret(), "token-2-1");
    }

    #[tokio::test]
    async fn cache_refreshes_tokens_near_expiry() {
        let cache = CredentialCache::new(CountingSource {
            issued: AtomicUsize::new(0),
            lifetime: chrono::Duration::minutes(30),
        });
        let first = cache.credentials(1).await.unwrap();
        let second = cache.credentials(1).await.unwrap();
        assert_eq!(first.token().expose_secret(), "token-1-0");
        assert_eq!(second.token().expose_secret(), "token-1-1");
    }

    #[test]
    fn static_tokens_never_expire() {
        let creds = Credentials::new(SecretString::from("t".to_string()), None);
        assert!(!creds.expires_within(chrono::Duration::days(365), Utc::now()));
    }
}
