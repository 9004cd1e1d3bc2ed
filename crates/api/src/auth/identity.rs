//! Identity provider verification
//!
//! Session tokens are opaque bearer credentials issued by an external identity
//! provider. When the provider's JWT secret is configured they are validated
//! locally; otherwise (or when local validation cannot decide) the provider's
//! `/auth/v1/user` endpoint is asked, with successful answers cached briefly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chatgate_shared::Principal;
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

/// Verification results are reused for this long
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

/// Oldest entries are evicted past this size
const MAX_CACHE_ENTRIES: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Malformed token")]
    Malformed,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),
}

/// Validates a session token and returns who it belongs to
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<Principal, IdentityError>;
}

/// Response from the provider's `/auth/v1/user` endpoint
#[derive(Debug, Clone, Deserialize)]
struct ProviderUserResponse {
    id: String,
    email: Option<String>,
}

/// Claims carried by a locally verifiable session token
#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
    email: Option<String>,
}

#[derive(Clone, Debug)]
struct CachedIdentity {
    principal: Principal,
    cached_at: Instant,
}

type TokenCache = Arc<RwLock<HashMap<String, CachedIdentity>>>;

/// Identity provider reached over HTTP
#[derive(Clone)]
pub struct HttpIdentityProvider {
    base_url: String,
    anon_key: String,
    jwt_key: Option<DecodingKey>,
    http_client: Client,
    token_cache: TokenCache,
}

impl HttpIdentityProvider {
    pub fn new(
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, IdentityError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::ProviderUnavailable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            jwt_key: None,
            http_client,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Accept HS256 tokens signed with `secret` without a network call
    pub fn with_jwt_secret(mut self, secret: &str) -> Self {
        self.jwt_key = Some(DecodingKey::from_secret(secret.as_bytes()));
        self
    }

    /// `Some` when the token was decided locally
    fn verify_locally(&self, token: &str) -> Option<Result<Principal, IdentityError>> {
        let key = self.jwt_key.as_ref()?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;

        match jsonwebtoken::decode::<SessionClaims>(token, key, &validation) {
            Ok(data) => Some(Ok(Principal::new(data.claims.sub, data.claims.email))),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => {
                    Some(Err(IdentityError::InvalidToken))
                }
                ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                    Some(Err(IdentityError::Malformed))
                }
                // Signed with another key or algorithm; let the provider decide
                _ => None,
            },
        }
    }

    async fn cached(&self, token: &str) -> Option<Principal> {
        let cache = self.token_cache.read().await;
        cache
            .get(token)
            .filter(|cached| cached.cached_at.elapsed() < TOKEN_CACHE_TTL)
            .map(|cached| cached.principal.clone())
    }

    async fn remember(&self, token: &str, principal: &Principal) {
        let mut cache = self.token_cache.write().await;

        if cache.len() >= MAX_CACHE_ENTRIES && !cache.contains_key(token) {
            if let Some(oldest_key) = cache
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest_key);
                tracing::debug!("Evicted oldest identity cache entry");
            }
        }

        cache.insert(
            token.to_string(),
            CachedIdentity {
                principal: principal.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    async fn fetch_user(&self, token: &str) -> Result<Principal, IdentityError> {
        let url = format!("{}/auth/v1/user", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Identity provider request failed");
                IdentityError::ProviderUnavailable(e.to_string())
            })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(IdentityError::InvalidToken);
        }
        if !status.is_success() {
            tracing::warn!(status = %status, "Identity provider returned an error");
            return Err(IdentityError::ProviderUnavailable(status.to_string()));
        }

        let user = response
            .json::<ProviderUserResponse>()
            .await
            .map_err(|e| IdentityError::ProviderUnavailable(e.to_string()))?;

        Ok(Principal::new(user.id, user.email))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify_token(&self, token: &str) -> Result<Principal, IdentityError> {
        if let Some(decided) = self.verify_locally(token) {
            return decided;
        }

        if let Some(principal) = self.cached(token).await {
            tracing::debug!(user_id = %principal.id, "Using cached identity");
            return Ok(principal);
        }

        let principal = self.fetch_user(token).await?;
        self.remember(token, &principal).await;
        Ok(principal)
    }
}

/// Fixed token table for tests
#[cfg(test)]
#[derive(Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, Principal>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, principal: Principal) -> Self {
        self.tokens.insert(token.to_string(), principal);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify_token(&self, token: &str) -> Result<Principal, IdentityError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.tokens
            .get(token)
            .cloned()
            .ok_or(IdentityError::InvalidToken)
    }
}
