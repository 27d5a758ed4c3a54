//! API token issuance and lifecycle management

use crate::context::Context;
use crate::error::{ClientError, Result};
use crate::token_store::TokenStore;
use crate::types::{AccessToken, ApiKey, Clock, IssueTokenRequest, SystemClock, TokenRecord};
use async_singleflight::UnaryGroup;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Default authentication server
pub const DEFAULT_AUTH_URL: &str = "https://auth.dfuse.io";

/// Default timeout of a token issuance round trip
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Macro to check HTTP response status and return an issuance error if it is a failure
macro_rules! check_response {
    ($response:expr) => {
        if $response.status().as_u16() >= 400 {
            let status = $response.status().as_u16();
            let body = $response.text().await?;
            return Err(ClientError::Issuance { status, body });
        }
    };
}

/// Issue endpoint derived from the authentication server base URL
pub fn issue_url(auth_url: &str) -> Result<Url> {
    let mut url = Url::parse(auth_url)?;
    url.path_segments_mut()
        .map_err(|_| ClientError::Configuration(format!("auth URL {auth_url:?} cannot be a base URL")))?
        .pop_if_empty()
        .extend(["v1", "auth", "issue"]);

    Ok(url)
}

/// Exchanges an API key for a fresh access token
///
/// Stateless beyond its configuration, every call performs one HTTP round trip.
pub struct HttpTokenIssuer {
    api_key: ApiKey,
    issue_url: Url,
    http_client: Client,
}

impl HttpTokenIssuer {
    /// # Arguments
    /// * `auth_url` - Authentication server base URL, `/v1/auth/issue` is appended
    /// * `api_key` - Long-lived API key sent on every issuance
    /// * `timeout` - Timeout applied to each issuance round trip
    pub fn new(auth_url: &str, api_key: ApiKey, timeout: Duration) -> Result<Self> {
        let issue_url = issue_url(auth_url)?;
        let http_client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            api_key,
            issue_url,
            http_client,
        })
    }

    pub fn issue_url(&self) -> &Url {
        &self.issue_url
    }

    /// Request a new token, giving up as soon as `ctx` is done
    pub async fn issue(&self, ctx: &Context) -> Result<AccessToken> {
        ctx.run(self.do_issue()).await
    }

    async fn do_issue(&self) -> Result<AccessToken> {
        let request = IssueTokenRequest {
            api_key: self.api_key.expose(),
        };

        let response = self
            .http_client
            .post(self.issue_url.clone())
            .json(&request)
            .send()
            .await?;

        check_response!(response);

        let body = response.bytes().await?;
        let record: TokenRecord = serde_json::from_slice(&body).map_err(|e| {
            ClientError::InvalidResponse(format!("decode token issuance response: {e}"))
        })?;

        Ok(record.into())
    }
}

/// Hands out a currently valid access token, refreshing it lazily
///
/// The cached token is served without any network call until it is about to expire. A
/// refresh issues a new token and writes it to the store before returning it.
pub struct CredentialManager {
    store: Arc<dyn TokenStore>,
    issuer: HttpTokenIssuer,
    clock: Arc<dyn Clock>,
    /// Callers racing past an expired cache share a single issuance
    refresh_singleflight: UnaryGroup<SharedRefresh>,
}

/// Outcome of a refresh, handed to every caller that joined it
type SharedRefresh = std::result::Result<AccessToken, Arc<ClientError>>;

impl CredentialManager {
    const REFRESH_KEY: &'static str = "token";

    pub fn new(issuer: HttpTokenIssuer, store: Arc<dyn TokenStore>) -> Self {
        Self {
            store,
            issuer,
            clock: Arc::new(SystemClock),
            refresh_singleflight: UnaryGroup::new(),
        }
    }

    /// Replace the time source used for expiry checks
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Get a token that is not about to expire
    ///
    /// A token store failure is returned as-is rather than treated as a cache miss, so a
    /// broken cache never silently degrades to memory-only behavior.
    pub async fn resolve_token(&self, ctx: &Context) -> Result<AccessToken> {
        let cached = self.store.get().await?;

        if !AccessToken::needs_refresh(cached.as_ref(), self.clock.now()) {
            if let Some(token) = cached {
                return Ok(token);
            }
        }

        debug!(
            token = ?cached,
            issue_url = %self.issuer.issue_url(),
            "Token is either not set or about to expire, fetching a new one"
        );

        self.refresh_singleflight(ctx).await
    }

    async fn refresh_singleflight(&self, ctx: &Context) -> Result<AccessToken> {
        // The shared issuance is bounded by the HTTP timeout only, a caller giving up must not
        // fail the others. When the caller driving it goes away, a waiting one takes it over.
        let shared = self.refresh_singleflight.work(Self::REFRESH_KEY, async {
            self.do_refresh(&Context::background()).await.map_err(|e| {
                warn!(error = %e, "Token refresh failed");
                Arc::new(e)
            })
        });

        let (refreshed, _leader) = ctx.run(async { Ok::<_, ClientError>(shared.await) }).await?;
        refreshed.map_err(ClientError::TokenRefresh)
    }

    async fn do_refresh(&self, ctx: &Context) -> Result<AccessToken> {
        let token = self.issuer.issue(ctx).await?;

        debug!(token = ?token, store = %self.store, "Token retrieved from issuer, saving it");
        self.store.set(token.clone()).await?;

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;
    use crate::token_store::{FileTokenStore, InMemoryTokenStore};
    use crate::types::test_support::{utc, FixedClock};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate, Times};

    const API_KEY: &str = "server_abcdef0123456789";

    fn issuer(server: &MockServer) -> HttpTokenIssuer {
        HttpTokenIssuer::new(&server.uri(), ApiKey::new(API_KEY), DEFAULT_AUTH_TIMEOUT).unwrap()
    }

    async fn mount_issue(server: &MockServer, response: ResponseTemplate, calls: impl Into<Times>) {
        Mock::given(method("POST"))
            .and(path("/v1/auth/issue"))
            .and(body_json(json!({ "api_key": API_KEY })))
            .respond_with(response)
            .expect(calls)
            .mount(server)
            .await;
    }

    #[test]
    fn test_issue_url() {
        assert_eq!(
            issue_url(DEFAULT_AUTH_URL).unwrap().as_str(),
            "https://auth.dfuse.io/v1/auth/issue"
        );
        assert_eq!(
            issue_url("http://localhost:8080/prefix/").unwrap().as_str(),
            "http://localhost:8080/prefix/v1/auth/issue"
        );
        assert!(matches!(issue_url("not a url"), Err(ClientError::UrlParse(_))));
    }

    #[tokio::test]
    async fn test_resolve_token_fetches_and_persists() {
        let server = MockServer::start().await;
        mount_issue(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({"token": "a.b.c", "expires_at": 1596578457})),
            1,
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token.json");
        let manager = CredentialManager::new(issuer(&server), Arc::new(FileTokenStore::new(&token_path)))
            .with_clock(Arc::new(FixedClock::at(utc("2020-08-04T21:00:00Z"))));

        let token = manager.resolve_token(&Context::background()).await.unwrap();
        assert_eq!(token.token, "a.b.c");
        assert_eq!(token.expires_at.timestamp(), 1596578457);

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&token_path).unwrap()).unwrap();
        assert_eq!(written, json!({"token": "a.b.c", "expires_at": 1596578457}));

        // Second resolution is served from the cache, the mock expects a single call
        let again = manager.resolve_token(&Context::background()).await.unwrap();
        assert_eq!(again, token);
    }

    #[tokio::test]
    async fn test_resolve_token_refreshes_within_threshold() {
        let server = MockServer::start().await;
        mount_issue(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({"token": "fresh", "expires_at": 1596582000})),
            1,
        )
        .await;

        let now = utc("2020-08-04T22:00:00Z");
        let store = Arc::new(InMemoryTokenStore::new());
        store
            .set(AccessToken::new("stale", now + chrono::Duration::seconds(29)))
            .await
            .unwrap();

        let manager = CredentialManager::new(issuer(&server), store.clone())
            .with_clock(Arc::new(FixedClock::at(now)));

        let token = manager.resolve_token(&Context::background()).await.unwrap();
        assert_eq!(token.token, "fresh");
        assert_eq!(store.get().await.unwrap().unwrap().token, "fresh");
    }

    #[tokio::test]
    async fn test_resolve_token_reuses_valid_token_until_threshold() {
        let server = MockServer::start().await;
        mount_issue(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({"token": "fresh", "expires_at": 1596582000})),
            1,
        )
        .await;

        let now = utc("2020-08-04T22:00:00Z");
        let store = Arc::new(InMemoryTokenStore::new());
        store
            .set(AccessToken::new("cached", now + chrono::Duration::seconds(31)))
            .await
            .unwrap();

        let clock = Arc::new(FixedClock::at(now));
        let manager = CredentialManager::new(issuer(&server), store).with_clock(clock.clone());

        let token = manager.resolve_token(&Context::background()).await.unwrap();
        assert_eq!(token.token, "cached");

        clock.set(now + chrono::Duration::seconds(1));
        let token = manager.resolve_token(&Context::background()).await.unwrap();
        assert_eq!(token.token, "fresh");
    }

    #[tokio::test]
    async fn test_resolve_token_issuance_failure() {
        let server = MockServer::start().await;
        mount_issue(
            &server,
            ResponseTemplate::new(401).set_body_string(r#"{"code":"invalid_api_key"}"#),
            1,
        )
        .await;

        let manager = CredentialManager::new(issuer(&server), Arc::new(InMemoryTokenStore::new()));
        let err = manager.resolve_token(&Context::background()).await.unwrap_err();

        match &err {
            ClientError::TokenRefresh(inner) => match inner.as_ref() {
                ClientError::Issuance { status, body } => {
                    assert_eq!(*status, 401);
                    assert_eq!(body, r#"{"code":"invalid_api_key"}"#);
                }
                other => panic!("unexpected error {other:?}"),
            },
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_token_malformed_response() {
        let server = MockServer::start().await;
        mount_issue(&server, ResponseTemplate::new(200).set_body_string("<html>"), 1).await;

        let manager = CredentialManager::new(issuer(&server), Arc::new(InMemoryTokenStore::new()));
        let err = manager.resolve_token(&Context::background()).await.unwrap_err();

        assert!(
            matches!(&err, ClientError::TokenRefresh(inner) if matches!(inner.as_ref(), ClientError::InvalidResponse(_))),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_resolve_token_surfaces_store_error() {
        let server = MockServer::start().await;
        mount_issue(&server, ResponseTemplate::new(200), 0).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "{broken").unwrap();

        let manager = CredentialManager::new(issuer(&server), Arc::new(FileTokenStore::new(&path)));
        let err = manager.resolve_token(&Context::background()).await.unwrap_err();

        assert!(matches!(err, ClientError::TokenStore { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_resolve_token_cancelled() {
        let server = MockServer::start().await;
        mount_issue(
            &server,
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "a.b.c", "expires_at": 1596578457}))
                .set_delay(Duration::from_secs(30)),
            0..=1,
        )
        .await;

        let manager = CredentialManager::new(issuer(&server), Arc::new(InMemoryTokenStore::new()));
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let err = manager.resolve_token(&ctx).await.unwrap_err();

        assert!(
            matches!(err, ClientError::Context(ContextError::DeadlineExceeded)),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_resolve_token_caller_deadline_does_not_fail_others() {
        let server = MockServer::start().await;
        mount_issue(
            &server,
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "a.b.c", "expires_at": 1596578457}))
                .set_delay(Duration::from_millis(400)),
            1..=2,
        )
        .await;

        let manager = CredentialManager::new(issuer(&server), Arc::new(InMemoryTokenStore::new()))
            .with_clock(Arc::new(FixedClock::at(utc("2020-08-04T21:00:00Z"))));

        let impatient = Context::background().with_timeout(Duration::from_millis(100));
        let (first, second) = tokio::join!(manager.resolve_token(&impatient), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            manager.resolve_token(&Context::background()).await
        });

        let err = first.unwrap_err();
        assert!(matches!(err, ClientError::Context(ContextError::DeadlineExceeded)), "{err:?}");
        assert_eq!(second.unwrap().token, "a.b.c");
    }

    #[tokio::test]
    async fn test_resolve_token_concurrent_callers_share_issuance() {
        let server = MockServer::start().await;
        mount_issue(
            &server,
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "a.b.c", "expires_at": 1596578457}))
                .set_delay(Duration::from_millis(100)),
            1,
        )
        .await;

        let manager = CredentialManager::new(issuer(&server), Arc::new(InMemoryTokenStore::new()))
            .with_clock(Arc::new(FixedClock::at(utc("2020-08-04T21:00:00Z"))));

        let contexts: Vec<_> = (0..8).map(|_| Context::background().with_cancel()).collect();
        let results =
            futures::future::join_all(contexts.iter().map(|ctx| manager.resolve_token(ctx))).await;

        for result in results {
            assert_eq!(result.unwrap().token, "a.b.c");
        }
    }
}
