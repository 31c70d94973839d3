// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OAuth2 access tokens for the Pub/Sub API.
//!
//! Tokens come from a credentials file (service account key or authorized user) when
//! one is configured, otherwise from the GCE/GKE metadata server. They are cached
//! until shortly before they expire.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ReceiveError, SetupError};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
// Refresh this long before the provider-reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
// Upper bound on how long a token is reused, whatever the provider reports.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

#[derive(Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

enum TokenKind {
    Anonymous,
    Metadata {
        url: String,
    },
    ServiceAccount {
        client_email: String,
        key_id: Option<String>,
        encoding_key: EncodingKey,
        token_uri: String,
    },
    AuthorizedUser(AuthorizedUser),
}

/// Source of bearer tokens for one subscription.
pub struct TokenSource {
    kind: TokenKind,
    cached: Mutex<Option<CachedToken>>,
}

impl Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            TokenKind::Anonymous => "anonymous",
            TokenKind::Metadata { .. } => "metadata",
            TokenKind::ServiceAccount { .. } => "service_account",
            TokenKind::AuthorizedUser(_) => "authorized_user",
        };
        write!(f, "TokenSource({kind})")
    }
}

impl TokenSource {
    fn new(kind: TokenKind) -> Self {
        Self {
            kind,
            cached: Mutex::new(None),
        }
    }

    /// No authentication, for the Pub/Sub emulator.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new(TokenKind::Anonymous)
    }

    /// Workload identity or the VM's service account.
    #[must_use]
    pub fn metadata_server() -> Self {
        Self::metadata_server_at(METADATA_TOKEN_URL)
    }

    #[must_use]
    pub fn metadata_server_at(url: impl Into<String>) -> Self {
        Self::new(TokenKind::Metadata { url: url.into() })
    }

    pub fn from_credentials_file(path: &str) -> Result<Self, SetupError> {
        let contents = std::fs::read_to_string(path).map_err(|e| SetupError::Credentials {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_credentials_json(path, &contents)
    }

    /// Parses credentials JSON. `path` is only used in error messages.
    pub fn from_credentials_json(path: &str, contents: &str) -> Result<Self, SetupError> {
        let invalid = |reason: String| SetupError::Credentials {
            path: path.to_string(),
            reason,
        };

        let credentials: CredentialsFile =
            serde_json::from_str(contents).map_err(|e| invalid(e.to_string()))?;

        let kind = match credentials {
            CredentialsFile::ServiceAccount(key) => {
                let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
                    .map_err(|e| invalid(format!("invalid private key: {e}")))?;
                TokenKind::ServiceAccount {
                    client_email: key.client_email,
                    key_id: key.private_key_id,
                    encoding_key,
                    token_uri: key.token_uri,
                }
            }
            CredentialsFile::AuthorizedUser(user) => TokenKind::AuthorizedUser(user),
        };
        Ok(Self::new(kind))
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self.kind, TokenKind::Anonymous)
    }

    /// Returns a valid access token, fetching a new one when the cached token is about
    /// to expire. `None` for anonymous access.
    pub async fn token(&self, http: &reqwest::Client) -> Result<Option<String>, ReceiveError> {
        if self.is_anonymous() {
            return Ok(None);
        }

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(Some(token.access_token.clone()));
            }
        }

        let response = self.fetch(http).await?;
        let lifetime = Duration::from_secs(response.expires_in)
            .min(MAX_TOKEN_LIFETIME)
            .saturating_sub(EXPIRY_MARGIN);
        debug!("Fetched access token valid for {}s", response.expires_in);

        let now = Instant::now();
        *cached = Some(CachedToken {
            access_token: response.access_token.clone(),
            refresh_at: now.checked_add(lifetime).unwrap_or(now),
        });
        Ok(Some(response.access_token))
    }

    async fn fetch(&self, http: &reqwest::Client) -> Result<TokenResponse, ReceiveError> {
        let request = match &self.kind {
            TokenKind::Anonymous => {
                return Err(ReceiveError::Transport(
                    "no token for anonymous access".to_string(),
                ))
            }
            TokenKind::Metadata { url } => http.get(url).header("Metadata-Flavor", "Google"),
            TokenKind::ServiceAccount {
                client_email,
                key_id,
                encoding_key,
                token_uri,
            } => {
                let iat = Utc::now().timestamp();
                let claims = AssertionClaims {
                    iss: client_email,
                    scope: PUBSUB_SCOPE,
                    aud: token_uri,
                    iat,
                    exp: iat + ASSERTION_LIFETIME_SECS,
                };
                let mut header = Header::new(Algorithm::RS256);
                header.kid.clone_from(key_id);
                let assertion = jsonwebtoken::encode(&header, &claims, encoding_key)
                    .map_err(|e| ReceiveError::Transport(format!("Failed to sign JWT: {e}")))?;
                http.post(token_uri).form(&[
                    ("grant_type", JWT_BEARER_GRANT_TYPE),
                    ("assertion", assertion.as_str()),
                ])
            }
            TokenKind::AuthorizedUser(user) => http.post(&user.token_uri).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", user.client_id.as_str()),
                ("client_secret", user.client_secret.as_str()),
                ("refresh_token", user.refresh_token.as_str()),
            ]),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReceiveError::Transport(format!(
                "Failed to fetch access token: {status}: {body}"
            )));
        }
        Ok(response.json::<TokenResponse>().await?)
    }
}
