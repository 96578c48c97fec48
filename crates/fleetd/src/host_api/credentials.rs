//! Resolve the auth header for a host.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{HostApiError, HostApiResult};
use crate::hosts::HostRecord;

pub const API_KEY_HEADER: &str = "X-Api-Key";

/// A single header to attach to host requests and WebSocket handshakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub name: &'static str,
    pub value: String,
}

impl AuthHeader {
    pub fn bearer(token: &str) -> Self {
        Self {
            name: "Authorization",
            value: format!("Bearer {token}"),
        }
    }

    pub fn api_key(key: &str) -> Self {
        Self {
            name: API_KEY_HEADER,
            value: key.to_string(),
        }
    }
}

/// Shared by the HTTP client and the WebSocket client.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// `None` when the host needs no authentication.
    async fn resolve(&self, host: &HostRecord) -> HostApiResult<Option<AuthHeader>>;

    /// Forget any cached token for the host, e.g. after a 401.
    fn invalidate(&self, _host_id: &str) {}
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    username: String,
    token: String,
    fetched_at: Instant,
}

/// Uses the host's API key when present, otherwise logs in with
/// username/password and caches the bearer token.
#[derive(Debug)]
pub struct HostCredentialResolver {
    client: Client,
    token_ttl: Duration,
    tokens: DashMap<String, CachedToken>,
}

impl HostCredentialResolver {
    pub fn new(client: Client, token_ttl: Duration) -> Self {
        Self {
            client,
            token_ttl,
            tokens: DashMap::new(),
        }
    }

    fn cached(&self, host_id: &str, username: &str) -> Option<String> {
        let entry = self.tokens.get(host_id)?;
        (entry.username == username && entry.fetched_at.elapsed() < self.token_ttl)
            .then(|| entry.token.clone())
    }

    async fn login(&self, host: &HostRecord, username: &str, password: &str) -> HostApiResult<String> {
        let url = format!("{}/v1/auth/token", host.base_url());
        debug!("requesting token for host {} as {}", host.id, username);

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest {
                email: username,
                password,
            })
            .send()
            .await
            .map_err(|e| HostApiError::Credentials(HostApiError::from_reqwest(&url, e).to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HostApiError::Credentials(
                HostApiError::from_status(&url, status, body).to_string(),
            ));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| HostApiError::Credentials(format!("invalid token response: {e}")))?;
        Ok(login.token)
    }
}

#[async_trait]
impl CredentialResolver for HostCredentialResolver {
    async fn resolve(&self, host: &HostRecord) -> HostApiResult<Option<AuthHeader>> {
        let Some(auth) = &host.authentication else {
            return Ok(None);
        };

        if let Some(key) = auth.api_key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(Some(AuthHeader::api_key(key)));
        }

        let (Some(username), Some(password)) = (auth.username.as_deref(), auth.password.as_deref())
        else {
            return Ok(None);
        };

        if let Some(token) = self.cached(&host.id, username) {
            return Ok(Some(AuthHeader::bearer(&token)));
        }

        let token = self.login(host, username, password).await?;
        self.tokens.insert(
            host.id.clone(),
            CachedToken {
                username: username.to_string(),
                token: token.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(Some(AuthHeader::bearer(&token)))
    }

    fn invalidate(&self, host_id: &str) {
        self.tokens.remove(host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::HostAuthentication;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::routing::post;
    use axum::{Json, Router};

    fn resolver() -> HostCredentialResolver {
        HostCredentialResolver::new(Client::new(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn no_authentication_means_no_header() {
        let host = HostRecord::new("h1", "127.0.0.1");
        assert_eq!(resolver().resolve(&host).await.unwrap(), None);
    }

    #[tokio::test]
    async fn api_key_wins_over_password() {
        let mut host = HostRecord::new("h1", "127.0.0.1");
        host.authentication = Some(HostAuthentication {
            username: Some("root".to_string()),
            password: Some("secret".to_string()),
            api_key: Some("k-123".to_string()),
        });

        let header = resolver().resolve(&host).await.unwrap().unwrap();
        assert_eq!(header, AuthHeader::api_key("k-123"));
    }

    #[tokio::test]
    async fn password_login_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/api/v1/auth/token",
            post(move |Json(body): Json<serde_json::Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(body["email"], "root");
                    Json(serde_json::json!({ "token": "tok-1" }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut host = HostRecord::new("h1", "127.0.0.1");
        host.port = Some(port);
        host.authentication = Some(HostAuthentication {
            username: Some("root".to_string()),
            password: Some("secret".to_string()),
            api_key: None,
        });

        let resolver = resolver();
        let first = resolver.resolve(&host).await.unwrap().unwrap();
        let second = resolver.resolve(&host).await.unwrap().unwrap();
        assert_eq!(first.value, "Bearer tok-1");
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        resolver.invalidate("h1");
        resolver.resolve(&host).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_login_is_a_credentials_error() {
        let mut host = HostRecord::new("h1", "127.0.0.1");
        // Nothing listens on port 9; the connection is refused.
        host.port = Some(9);
        host.authentication = Some(HostAuthentication {
            username: Some("root".to_string()),
            password: Some("secret".to_string()),
            api_key: None,
        });

        let err = resolver().resolve(&host).await.unwrap_err();
        assert!(matches!(err, HostApiError::Credentials(_)));
    }
}
