//! Authentication / Authorization primitives.
//!
//! Access tokens are HS256 JWTs minted by the account service (or the CLI).
//! The gate verifies them on every call and consults a revocation list that
//! is populated on logout with a TTL equal to the token's remaining validity.
//! Role checks happen here; the lifecycle only sees a resolved [`Caller`].

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, OriginalUri, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{config::AuthConfig, models::UserId, services::Caller, state::AppState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub user_id: i64,
    pub username: String,
    #[serde(default)]
    pub is_moderator: bool,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

/// Who is calling, as asserted by a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub is_moderator: bool,
}

impl Identity {
    pub fn caller(&self) -> Caller {
        Caller {
            user_id: self.user_id,
            is_moderator: self.is_moderator,
        }
    }
}

/// The raw bearer token of the current request, kept for logout.
#[derive(Debug, Clone)]
pub struct AccessToken(pub String);

#[derive(Debug, Clone)]
pub enum AuthError {
    MissingToken,
    InvalidToken(String),
    Revoked,
    Forbidden(String),
    Upstream(String),
}

impl AuthError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken(_) | Self::Revoked => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::MissingToken | Self::InvalidToken(_) | Self::Revoked => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Upstream(_) => "unavailable",
        }
    }

    fn diagnostics(&self) -> String {
        match self {
            Self::MissingToken => "Missing bearer token".to_string(),
            Self::InvalidToken(msg) => format!("Invalid bearer token: {msg}"),
            Self::Revoked => "Token has been revoked".to_string(),
            Self::Forbidden(msg) => format!("Forbidden: {msg}"),
            Self::Upstream(msg) => format!("Authentication upstream error: {msg}"),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": self.diagnostics(),
            }
        }));

        let mut response = (self.status(), body).into_response();
        if self.status() == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

/// Logged-out tokens, remembered until they would have expired anyway.
#[async_trait]
pub trait RevocationList: Send + Sync {
    async fn put(&self, token: &str, ttl: Duration) -> crate::Result<()>;

    async fn exists(&self, token: &str) -> crate::Result<bool>;
}

#[derive(Default)]
pub struct MemoryRevocationList {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryRevocationList {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationList for MemoryRevocationList {
    async fn put(&self, token: &str, ttl: Duration) -> crate::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| crate::Error::Internal("revocation list poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, expires| *expires > now);
        entries.insert(token.to_string(), now + ttl);
        Ok(())
    }

    async fn exists(&self, token: &str) -> crate::Result<bool> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| crate::Error::Internal("revocation list poisoned".to_string()))?;
        Ok(entries
            .get(token)
            .is_some_and(|expires| *expires > Instant::now()))
    }
}

/// Revocation list in the `revoked_tokens` table, keyed by SHA-256 of the token.
pub struct PostgresRevocationList {
    pool: PgPool,
}

impl PostgresRevocationList {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn token_hash(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

#[async_trait]
impl RevocationList for PostgresRevocationList {
    async fn put(&self, token: &str, ttl: Duration) -> crate::Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| crate::Error::Internal(format!("invalid revocation ttl: {e}")))?;

        sqlx::query(
            "INSERT INTO revoked_tokens (token_hash, expires_at)
             VALUES ($1, $2)
             ON CONFLICT (token_hash)
             DO UPDATE SET expires_at = GREATEST(revoked_tokens.expires_at, EXCLUDED.expires_at)",
        )
        .bind(token_hash(token))
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM revoked_tokens WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn exists(&self, token: &str) -> crate::Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM revoked_tokens WHERE token_hash = $1 AND expires_at > NOW()",
        )
        .bind(token_hash(token))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

#[derive(Clone)]
pub struct AuthGate {
    config: Arc<AuthConfig>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    revocations: Arc<dyn RevocationList>,
}

impl AuthGate {
    pub fn new(config: AuthConfig, revocations: Arc<dyn RevocationList>) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            config: Arc::new(config),
            revocations,
        }
    }

    pub fn is_public_path(&self, path: &str) -> bool {
        self.config.public_paths.iter().any(|p| p == path)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 30;
        validation
    }

    fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(format!("{e}")))
    }

    /// Verify a bearer token: revocation first, then signature, expiry and issuer.
    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let revoked = self
            .revocations
            .exists(token)
            .await
            .map_err(|e| AuthError::Upstream(e.to_string()))?;
        if revoked {
            return Err(AuthError::Revoked);
        }

        let claims = self.decode(token)?;
        Ok(Identity {
            user_id: UserId(claims.user_id),
            username: claims.username,
            is_moderator: claims.is_moderator,
        })
    }

    /// Extract and verify the bearer token from request headers.
    ///
    /// Returns `Ok(None)` when no `Authorization` header is present.
    pub async fn authenticate_headers(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<(Identity, AccessToken)>, AuthError> {
        let Some(authz) = headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };

        let authz = authz.to_str().map_err(|_| {
            AuthError::InvalidToken("Authorization header is not valid UTF-8".to_string())
        })?;

        let token = authz
            .strip_prefix("Bearer ")
            .or_else(|| authz.strip_prefix("bearer "))
            .ok_or_else(|| {
                AuthError::InvalidToken("Authorization header must be 'Bearer <token>'".to_string())
            })?;

        let identity = self.authenticate(token).await?;
        Ok(Some((identity, AccessToken(token.to_string()))))
    }

    /// Revoke a token for the rest of its validity. Expired tokens are ignored.
    pub async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.decode(token)?;
        let remaining = claims.exp - Utc::now().timestamp();
        if remaining <= 0 {
            return Ok(());
        }

        self.revocations
            .put(token, Duration::from_secs(remaining as u64))
            .await
            .map_err(|e| AuthError::Upstream(e.to_string()))?;
        tracing::info!(user_id = claims.user_id, "Token revoked");
        Ok(())
    }

    /// Mint a token for `identity`, valid for `ttl` (the configured TTL when `None`).
    pub fn issue(&self, identity: &Identity, ttl: Option<Duration>) -> Result<String, AuthError> {
        let ttl = ttl.unwrap_or_else(|| Duration::from_secs(self.config.token_ttl_seconds));
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: identity.user_id.to_string(),
            user_id: identity.user_id.0,
            username: identity.username.clone(),
            is_moderator: identity.is_moderator,
            iat: now,
            exp: now + ttl.as_secs() as i64,
            iss: self.config.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(format!("Failed to sign token: {e}")))
    }
}

/// Extractor for the identity attached by [`auth_middleware`].
///
/// Use `Option<Authenticated>` in handlers for optional auth.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .map(Authenticated)
            .ok_or(AuthError::MissingToken)
    }
}

/// Like [`Authenticated`], but rejects callers without the moderator role.
#[derive(Debug, Clone)]
pub struct Moderator(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for Moderator
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Authenticated(identity) = Authenticated::from_request_parts(parts, state).await?;
        if !identity.is_moderator {
            return Err(AuthError::Forbidden(
                "moderator role required".to_string(),
            ));
        }
        Ok(Moderator(identity))
    }
}

/// Middleware attaching [`Identity`] and [`AccessToken`] when a bearer token
/// is presented. Invalid or revoked tokens are rejected here; anonymous
/// requests pass through and are turned away by the extractors.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    // Nested routers see a stripped path; public paths are configured in full.
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.0.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    if state.auth.is_public_path(&path) || req.method() == axum::http::Method::OPTIONS {
        return next.run(req).await;
    }

    match state.auth.authenticate_headers(req.headers()).await {
        Ok(Some((identity, token))) => {
            tracing::debug!(
                user_id = %identity.user_id,
                is_moderator = identity.is_moderator,
                "Authenticated request"
            );
            req.extensions_mut().insert(identity);
            req.extensions_mut().insert(token);
            next.run(req).await
        }
        Ok(None) => next.run(req).await,
        Err(err) => {
            tracing::debug!(error = %err.diagnostics(), "Authentication rejected");
            err.into_response()
        }
    }
}
