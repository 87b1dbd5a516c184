//! Control-plane credential plumbing.
//!
//! Webhook signing credentials are resolved from the control plane per
//! service account and cached for a TTL. Control-plane requests themselves
//! authenticate with an OAuth client-credentials token when an OIDC issuer
//! is configured.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use fc_core::Secret;

/// Credentials for signing and authenticating webhook deliveries.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookCredentials {
    pub auth_token: Secret,
    pub signing_secret: Secret,
    #[serde(default = "default_signing_algorithm")]
    pub signing_algorithm: String,
}

fn default_signing_algorithm() -> String {
    "HMAC-SHA256".to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    token_endpoint: String,
}

/// Client-credentials token source against an OIDC issuer.
pub struct OAuthClientCredentials {
    client: reqwest::Client,
    issuer_url: String,
    client_id: String,
    client_secret: Secret,
    cached: tokio::sync::Mutex<Option<(String, Instant)>>,
}

impl OAuthClientCredentials {
    pub fn new(
        client: reqwest::Client,
        issuer_url: String,
        client_id: String,
        client_secret: Secret,
    ) -> Self {
        Self {
            client,
            issuer_url,
            client_id,
            client_secret,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Current access token, refreshed via the issuer when stale.
    pub async fn bearer(&self) -> anyhow::Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.issuer_url.trim_end_matches('/')
        );
        let discovery: OidcDiscovery = self
            .client
            .get(&discovery_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let response: TokenResponse = self
            .client
            .post(&discovery.token_endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // Refresh a little before the issuer-side expiry.
        let lifetime = Duration::from_secs(response.expires_in.saturating_sub(30).max(30));
        let token = response.access_token.clone();
        *cached = Some((response.access_token, Instant::now() + lifetime));

        debug!(issuer = %self.issuer_url, "obtained client-credentials token");
        Ok(token)
    }
}

/// TTL cache over `GET /api/service-accounts/{id}/webhook-credentials`.
pub struct CredentialsCache {
    client: reqwest::Client,
    base_urls: Vec<String>,
    ttl: Duration,
    token_provider: Option<Arc<OAuthClientCredentials>>,
    cache: RwLock<HashMap<String, (WebhookCredentials, Instant)>>,
}

impl CredentialsCache {
    pub fn new(
        client: reqwest::Client,
        base_urls: Vec<String>,
        ttl: Duration,
        token_provider: Option<Arc<OAuthClientCredentials>>,
    ) -> Self {
        Self {
            client,
            base_urls,
            ttl,
            token_provider,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, service_account_id: &str) -> anyhow::Result<WebhookCredentials> {
        {
            let cache = self.cache.read();
            if let Some((credentials, fetched_at)) = cache.get(service_account_id) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(credentials.clone());
                }
            }
        }

        let credentials = self.fetch(service_account_id).await?;
        self.cache.write().insert(
            service_account_id.to_string(),
            (credentials.clone(), Instant::now()),
        );
        Ok(credentials)
    }

    async fn fetch(&self, service_account_id: &str) -> anyhow::Result<WebhookCredentials> {
        let bearer = match self.token_provider.as_ref() {
            Some(provider) => Some(provider.bearer().await?),
            None => None,
        };

        let mut last_error = anyhow::anyhow!("no control-plane urls configured");

        for base in &self.base_urls {
            let url = format!(
                "{}/api/service-accounts/{}/webhook-credentials",
                base.trim_end_matches('/'),
                service_account_id
            );

            let mut request = self.client.get(&url);
            if let Some(token) = bearer.as_ref() {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let credentials: WebhookCredentials = response.json().await?;
                    debug!(service_account = %service_account_id, "webhook credentials resolved");
                    return Ok(credentials);
                }
                Ok(response) => {
                    last_error =
                        anyhow::anyhow!("credentials endpoint returned {}", response.status());
                    warn!(url = %url, status = %response.status(), "credentials fetch failed");
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "credentials fetch failed");
                    last_error = e.into();
                }
            }
        }

        Err(last_error)
    }

    /// Drop a cached entry, forcing a refetch on next use.
    pub fn invalidate(&self, service_account_id: &str) {
        self.cache.write().remove(service_account_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn credentials_are_cached_for_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/service-accounts/sa-1/webhook-credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authToken": "tok-123",
                "signingSecret": "sec-456",
                "signingAlgorithm": "HMAC-SHA256"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = CredentialsCache::new(
            reqwest::Client::new(),
            vec![server.uri()],
            Duration::from_secs(60),
            None,
        );

        let first = cache.get("sa-1").await.unwrap();
        let second = cache.get("sa-1").await.unwrap();
        assert_eq!(first.signing_secret.expose(), "sec-456");
        assert_eq!(second.auth_token.expose(), "tok-123");
    }

    #[tokio::test]
    async fn second_source_is_tried_on_failure() {
        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&broken)
            .await;

        let working = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/service-accounts/sa-1/webhook-credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authToken": "tok",
                "signingSecret": "sec"
            })))
            .mount(&working)
            .await;

        let cache = CredentialsCache::new(
            reqwest::Client::new(),
            vec![broken.uri(), working.uri()],
            Duration::from_secs(60),
            None,
        );

        let credentials = cache.get("sa-1").await.unwrap();
        assert_eq!(credentials.signing_algorithm, "HMAC-SHA256");
    }
}
