//! Token authentication at the edge of the sync channel.
//!
//! Two seams:
//! - [`TokenVerifier`]: synchronous check run inside the WebSocket
//!   handshake; a failure rejects the upgrade with HTTP 401.
//! - [`Authenticator`]: async login/validate calls a client makes before
//!   connecting and before each reconnect attempt.
//!
//! [`JwtAuthenticator`] implements both with HS256 tokens.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Query parameter carrying the token when headers are unavailable.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// JWT claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (who signed in)
    pub sub: String,
    pub iss: String,
    pub aud: String,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expiration (Unix seconds)
    pub exp: i64,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// A freshly issued bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token was presented
    MissingToken,
    /// Credential did not match
    InvalidCredential,
    /// Token has expired
    Expired,
    /// Token is malformed or its signature/claims do not verify
    InvalidToken(String),
    /// Token could not be produced
    Issue(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingToken => write!(f, "Missing token"),
            Self::InvalidCredential => write!(f, "Invalid credential"),
            Self::Expired => write!(f, "Token expired"),
            Self::InvalidToken(e) => write!(f, "Invalid token: {e}"),
            Self::Issue(e) => write!(f, "Token issue failed: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::InvalidToken(e.to_string()),
        }
    }
}

/// Server-side token check, run during channel establishment.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Credential exchange and expiry-aware validation.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, credential: &str) -> Result<IssuedToken, AuthError>;

    async fn validate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Authentication settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for signing tokens
    pub secret: String,
    /// Shared password accepted by `login`
    pub password: String,
    pub issuer: String,
    pub audience: String,
    /// Token lifetime (default: 24h)
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: "change-me-in-production".to_string(),
            password: "basket".to_string(),
            issuer: "basket-server".to_string(),
            audience: "basket-clients".to_string(),
            token_ttl: Duration::hours(24),
        }
    }
}

/// HS256 JWT issuer and verifier.
pub struct JwtAuthenticator {
    config: AuthConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            config,
        }
    }

    /// Sign a token for `subject` valid from now for the configured ttl.
    pub fn issue(&self, subject: &str) -> Result<IssuedToken, AuthError> {
        let now = Utc::now();
        let expires_at = now + self.config.token_ttl;
        let claims = Claims {
            sub: subject.to_string(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Issue(e.to_string()))?;
        Ok(IssuedToken { token, expires_at })
    }

    fn check(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims)
    }
}

impl TokenVerifier for JwtAuthenticator {
    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.check(token)
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn login(&self, credential: &str) -> Result<IssuedToken, AuthError> {
        if credential != self.config.password {
            log::warn!("Rejected login with wrong credential");
            return Err(AuthError::InvalidCredential);
        }
        self.issue("shopper")
    }

    async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        self.check(token)
    }
}

// ─── Token extraction ─────────────────────────────────────────────────

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Token from the `access_token` query parameter.
pub fn query_token(query: &str) -> Option<&str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == ACCESS_TOKEN_PARAM)
        .map(|(_, value)| value)
        .filter(|t| !t.is_empty())
}
