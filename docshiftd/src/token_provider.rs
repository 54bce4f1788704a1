use std::time::Duration;

use docshift_core::{AccessToken, TokenClient, TokenError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TokenCacheError {
    #[error("token request failed: {0}")]
    Token(#[from] TokenError),
}

enum TokenSource {
    Static(String),
    ClientCredentials {
        client: TokenClient,
        scope: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<Instant>,
}

/// Process-wide access token. Refreshes at most once at a time, shortly
/// before the current token expires.
pub struct TokenCache {
    source: TokenSource,
    refresh_skew: Duration,
    current: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn with_static_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            current: Mutex::new(Some(CachedToken {
                access_token: token.clone(),
                expires_at: None,
            })),
            source: TokenSource::Static(token),
            refresh_skew: Duration::from_secs(300),
        }
    }

    pub fn with_client_credentials(client: TokenClient, scope: Option<String>) -> Self {
        Self {
            source: TokenSource::ClientCredentials { client, scope },
            refresh_skew: Duration::from_secs(300),
            current: Mutex::new(None),
        }
    }

    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    pub async fn access_token(&self) -> Result<String, TokenCacheError> {
        let mut current = self.current.lock().await;
        if let Some(cached) = current.as_ref()
            && !self.needs_refresh(cached)
        {
            return Ok(cached.access_token.clone());
        }

        let fresh = self.fetch().await?;
        let token = fresh.access_token.clone();
        *current = Some(fresh);
        Ok(token)
    }

    /// Drops the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        if matches!(self.source, TokenSource::ClientCredentials { .. }) {
            debug!("access token invalidated");
            *self.current.lock().await = None;
        }
    }

    fn needs_refresh(&self, cached: &CachedToken) -> bool {
        match cached.expires_at {
            Some(expires_at) => expires_at <= Instant::now() + self.refresh_skew,
            None => false,
        }
    }

    async fn fetch(&self) -> Result<CachedToken, TokenCacheError> {
        match &self.source {
            TokenSource::Static(token) => Ok(CachedToken {
                access_token: token.clone(),
                expires_at: None,
            }),
            TokenSource::ClientCredentials { client, scope } => {
                let token = client.client_credentials(scope.as_deref()).await?;
                info!(expires_in = token.expires_in, "access token refreshed");
                Ok(cached_from(token))
            }
        }
    }
}

fn cached_from(token: AccessToken) -> CachedToken {
    CachedToken {
        expires_at: token
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs)),
        access_token: token.access_token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn token_server(expires_in: u64, expected_calls: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "app-token",
                "token_type": "Bearer",
                "expires_in": expires_in
            })))
            .expect(expected_calls)
            .mount(&server)
            .await;
        server
    }

    fn cache_for(server: &MockServer) -> TokenCache {
        let client =
            TokenClient::new(&format!("{}/token", server.uri()), "client-id", "secret").unwrap();
        TokenCache::with_client_credentials(client, Some("https://tenant.example/.default".into()))
    }

    #[tokio::test]
    async fn static_token_never_refreshes() {
        let cache = TokenCache::with_static_token("fixed");
        cache.invalidate().await;
        assert_eq!(cache.access_token().await.unwrap(), "fixed");
    }

    #[tokio::test]
    async fn fresh_token_is_reused() {
        let server = token_server(3600, 1).await;
        let cache = cache_for(&server);

        assert_eq!(cache.access_token().await.unwrap(), "app-token");
        assert_eq!(cache.access_token().await.unwrap(), "app-token");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = token_server(3600, 1).await;
        let cache = Arc::new(cache_for(&server));

        let (a, b, c) = tokio::join!(
            cache.access_token(),
            cache.access_token(),
            cache.access_token()
        );
        assert_eq!(a.unwrap(), "app-token");
        assert_eq!(b.unwrap(), "app-token");
        assert_eq!(c.unwrap(), "app-token");
    }

    #[tokio::test]
    async fn token_inside_skew_window_is_refreshed() {
        let server = token_server(60, 2).await;
        let cache = cache_for(&server);

        cache.access_token().await.unwrap();
        cache.access_token().await.unwrap();
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let server = token_server(3600, 2).await;
        let cache = cache_for(&server);

        cache.access_token().await.unwrap();
        cache.invalidate().await;
        cache.access_token().await.unwrap();
    }

    #[tokio::test]
    async fn endpoint_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad secret"))
            .mount(&server)
            .await;

        let err = cache_for(&server)
            .access_token()
            .await
            .expect_err("expected failure");
        assert!(matches!(err, TokenCacheError::Token(TokenError::Api { .. })));
    }
}
