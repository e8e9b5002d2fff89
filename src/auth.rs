use actix_web::{dev::Payload, web, Error, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::future::{ready, Ready};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::routes::AppState;

/// Lifetime of an issued session token.
pub const TOKEN_TTL_HOURS: i64 = 24;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("JWT_SECRET not set")]
    MissingSecret,
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub exp: usize,
    /// Token id, used to revoke a single session on sign-out.
    pub jti: String,
}

fn jwt_secret() -> Result<String, AuthError> {
    env::var("JWT_SECRET").map_err(|_| AuthError::MissingSecret)
}

/// Validate a JWT and return its claims.
pub fn decode_jwt(token: &str) -> Result<Claims, AuthError> {
    let secret = jwt_secret()?;
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

/// Issue a session token for a user.
pub fn create_jwt(user_id: Uuid, email: &str) -> Result<String, AuthError> {
    let secret = jwt_secret()?;
    let expiration = (chrono::Utc::now() + chrono::Duration::hours(TOKEN_TTL_HOURS)).timestamp() as usize;
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        exp: expiration,
        jti: Uuid::new_v4().simple().to_string(),
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|e| AuthError::Hashing(e.to_string()))?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

// Verified in place of a missing account so unknown emails cost as much as
// known ones.
static DUMMY_HASH: Lazy<Result<String, String>> =
    Lazy::new(|| hash_password("no-such-account").map_err(|e| e.to_string()));

/// Check `password` against `hash`, or against a throwaway hash when there is
/// no account. The second case always yields `false`.
pub fn verify_password_or_dummy(password: &str, hash: Option<&str>) -> Result<bool, AuthError> {
    match hash {
        Some(hash) => verify_password(password, hash),
        None => {
            let dummy = DUMMY_HASH.as_deref().map_err(|e| AuthError::Hashing(e.clone()))?;
            verify_password(password, dummy).map(|_| false)
        }
    }
}

/// Token ids signed out before their expiry.
#[derive(Clone, Default)]
pub struct SessionRevocations {
    revoked: Arc<DashMap<String, usize>>,
}

impl SessionRevocations {
    pub fn new() -> Self { Self::default() }

    pub fn revoke(&self, claims: &Claims) {
        let now = chrono::Utc::now().timestamp() as usize;
        self.revoked.retain(|_, exp| *exp > now);
        self.revoked.insert(claims.jti.clone(), claims.exp);
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.contains_key(jti)
    }
}

/// Extractor yielding validated `Claims` of a live session.
pub struct Auth(pub Claims);

impl Auth {
    pub fn user_id(&self) -> Uuid { self.0.sub }
}

impl FromRequest for Auth {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, pl: &mut Payload) -> Self::Future {
        ready(authenticate(req, pl).map_err(Error::from))
    }
}

fn authenticate(req: &HttpRequest, pl: &mut Payload) -> Result<Auth, ApiError> {
    let unauthorized = |msg: &str| ApiError::Unauthorized(msg.into());
    // Delegate to BearerAuth to parse the header.
    let bearer = BearerAuth::from_request(req, pl)
        .into_inner()
        .map_err(|_| unauthorized("authorization required"))?;
    let claims = match decode_jwt(bearer.token()) {
        Ok(c) => c,
        Err(AuthError::MissingSecret) => {
            tracing::error!("JWT_SECRET missing while validating a request");
            return Err(ApiError::Internal);
        }
        Err(_) => return Err(unauthorized("invalid token")),
    };
    let revoked = req
        .app_data::<web::Data<AppState>>()
        .is_some_and(|state| state.sessions.is_revoked(&claims.jti));
    if revoked {
        return Err(unauthorized("session ended"));
    }
    Ok(Auth(claims))
}
