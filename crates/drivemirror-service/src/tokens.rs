//! Exchanges credentials for short-lived OAuth access tokens.
//!
//! Tokens are cached per [`CredentialId`] in a [`MemoCache`] for their real lifetime minus a
//! safety margin, so a token never expires while a request is using it. Concurrent requests
//! needing a token for the same credential share a single exchange.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::EncodingKey;
use jsonwebtoken::errors::Error as JwtError;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::caching::MemoCache;
use crate::config::TokensConfig;
use crate::credentials::{Credential, CredentialId, RefreshTokenRecord, ServiceAccountKey};
use crate::error::DriveError;

/// The scope requested for service account tokens.
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Lifetime of the JWT assertion, the maximum accepted by the token endpoint.
const ASSERTION_LIFETIME: i64 = 3600;

/// An OAuth access token usable for the drive.
#[derive(Clone)]
pub struct AccessToken {
    bearer_token: Arc<str>,
    expires_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl AccessToken {
    /// Whether the token is expired or is still valid.
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    /// The token in the HTTP Bearer-header format, header value only.
    pub fn bearer_token(&self) -> &str {
        &self.bearer_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Serialize)]
struct JwtClaims<'s> {
    #[serde(rename = "iss")]
    issuer: &'s str,
    scope: &'s str,
    #[serde(rename = "aud")]
    audience: &'s str,
    #[serde(rename = "exp")]
    expiration: i64,
    #[serde(rename = "iat")]
    issued_at: i64,
}

#[derive(Serialize)]
struct JwtGrant<'s> {
    grant_type: &'static str,
    assertion: &'s str,
}

#[derive(Serialize)]
struct RefreshGrant<'s> {
    grant_type: &'static str,
    client_id: &'s str,
    client_secret: &'s str,
    refresh_token: &'s str,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

/// Returns the JWT key parsed from a string.
///
/// Service account keys are usually copy-pasted out of their JSON files, which leaves the
/// escaped newlines of the JSON encoding in place. These are converted back to real newlines
/// to get a valid PEM file.
fn key_from_string(key: &str) -> Result<EncodingKey, JwtError> {
    let buffer = key.replace("\\n", "\n");
    EncodingKey::from_rsa_pem(buffer.as_bytes())
}

/// Computes a signed JWT assertion for the service account.
fn get_auth_jwt(key: &ServiceAccountKey, audience: &str, now: i64) -> Result<String, JwtError> {
    let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);

    let claims = JwtClaims {
        issuer: &key.client_email,
        scope: DRIVE_SCOPE,
        audience,
        expiration: now + ASSERTION_LIFETIME,
        issued_at: now,
    };

    let encoding_key = key_from_string(&key.private_key)?;
    jsonwebtoken::encode(&header, &claims, &encoding_key)
}

/// Produces access tokens for credentials.
#[derive(Debug)]
pub struct TokenProvider {
    client: Client,
    cache: MemoCache<CredentialId, AccessToken, DriveError>,
    /// Overrides the token endpoint of all credentials.
    token_url: Option<Url>,
    config: TokensConfig,
}

impl TokenProvider {
    pub fn new(client: Client, config: TokensConfig, token_url: Option<Url>) -> Self {
        Self {
            client,
            cache: MemoCache::new("tokens"),
            token_url,
            config,
        }
    }

    /// Returns a valid access token for `credential`.
    ///
    /// A cached token is returned as long as it is valid for at least the safety margin. The
    /// exchange is retried on transient failures, failures are not cached.
    pub async fn get_token(&self, credential: &Arc<Credential>) -> Result<AccessToken, DriveError> {
        metric!(counter("tokens.access") += 1);

        let client = self.client.clone();
        let credential = Arc::clone(credential);
        let token_url = self
            .token_url
            .clone()
            .unwrap_or_else(|| credential.token_uri().clone());
        let config = self.config.clone();

        self.cache
            .get_or_compute_expiring(credential.id(), move || async move {
                let (token, lifetime) = exchange(&client, &credential, &token_url, &config).await?;
                Ok((token, lifetime.saturating_sub(config.safety_margin)))
            })
            .await
    }

    /// Drops the cached token of `credential`, the next request exchanges a fresh one.
    pub async fn invalidate(&self, credential: &Credential) {
        self.cache.invalidate(&credential.id()).await;
    }
}

/// Exchanges the credential, retrying transient failures.
async fn exchange(
    client: &Client,
    credential: &Credential,
    token_url: &Url,
    config: &TokensConfig,
) -> Result<(AccessToken, Duration), DriveError> {
    let attempts = config.exchange_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        metric!(counter("tokens.exchange") += 1);

        match exchange_once(client, credential, token_url).await {
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(
                    credential = %credential.id(),
                    attempt,
                    error = %err,
                    "token exchange failed, retrying"
                );
                tokio::time::sleep(config.exchange_backoff).await;
            }
            Err(err) => {
                tracing::error!(credential = %credential.id(), error = %err, "token exchange failed");
                return Err(err);
            }
            Ok(token) => {
                tracing::debug!(credential = %credential.id(), "exchanged credential for a token");
                return Ok(token);
            }
        }
    }
}

async fn exchange_once(
    client: &Client,
    credential: &Credential,
    token_url: &Url,
) -> Result<(AccessToken, Duration), DriveError> {
    let request = match credential {
        Credential::ServiceAccount(key) => {
            let assertion = get_auth_jwt(key, token_url.as_str(), Utc::now().timestamp())
                .map_err(|err| DriveError::Auth(format!("failed encoding JWT: {err}")))?;
            client.post(token_url.clone()).form(&JwtGrant {
                grant_type: "urn:ietf:params:oauth:grant-type:jwt-bearer",
                assertion: &assertion,
            })
        }
        Credential::RefreshToken(RefreshTokenRecord {
            client_id,
            client_secret,
            refresh_token,
            ..
        }) => client.post(token_url.clone()).form(&RefreshGrant {
            grant_type: "refresh_token",
            client_id,
            client_secret,
            refresh_token,
        }),
    };

    let issued_at = Utc::now();
    let response = request.send().await?;
    let status = response.status();

    if status.is_success() {
        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in);
        let expires_at = issued_at
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::zero());
        let token = AccessToken {
            bearer_token: format!("Bearer {}", token.access_token).into(),
            expires_at,
        };
        return Ok((token, lifetime));
    }

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(DriveError::transient_status(status));
    }

    let body = response.text().await.unwrap_or_default();
    Err(DriveError::Auth(format!(
        "token endpoint responded with {status}: {}",
        body.trim()
    )))
}
