//! Request identity.
//!
//! The server holds no user records. An `IdentityProvider` turns request
//! headers into a verified `UserId`, either by validating a bearer token or
//! by trusting a header set by an upstream gateway.

use axum::Json;
use axum::http::header::{AUTHORIZATION, HeaderName};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use scholar_core::UserId;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ServerError, ServerResult};

/// Why a request could not be attributed to a user.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// No credentials were presented.
    #[error("{0}")]
    Missing(String),

    /// The token was valid but has expired.
    #[error("Token has expired")]
    Expired,

    /// The credentials could not be verified.
    #[error("{0}")]
    Invalid(String),
}

impl IdentityError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Missing(_) | Self::Expired => StatusCode::UNAUTHORIZED,
            Self::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::Missing(message) => {
                json!({ "error": "Missing authorization header", "message": message })
            }
            Self::Expired => json!({ "error": "Token has expired" }),
            Self::Invalid(message) => json!({ "error": "Invalid token", "message": message }),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Resolves the user behind a request.
pub trait IdentityProvider: Send + Sync {
    /// Identify the caller from request headers.
    fn identify(&self, headers: &HeaderMap) -> Result<UserId, IdentityError>;
}

/// Authenticated caller, extracted from request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

#[derive(Clone, Deserialize)]
struct Claims {
    sub: Value,
}

/// HS256 bearer tokens carrying the user id in `sub`.
pub struct JwtIdentity {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentity {
    /// Verify tokens signed with `secret`.
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityProvider for JwtIdentity {
    fn identify(&self, headers: &HeaderMap) -> Result<UserId, IdentityError> {
        let header = headers
            .get(AUTHORIZATION)
            .ok_or_else(|| IdentityError::Missing("Missing Authorization Header".to_string()))?;
        let token = header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                IdentityError::Missing(
                    "Bad Authorization header. Expected 'Authorization: Bearer <JWT>'".to_string(),
                )
            })?;

        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => IdentityError::Expired,
                _ => IdentityError::Invalid(e.to_string()),
            },
        )?;

        match data.claims.sub {
            Value::String(sub) if !sub.is_empty() => Ok(UserId::new(sub)),
            Value::Number(sub) => Ok(UserId::new(sub.to_string())),
            _ => Err(IdentityError::Invalid("Subject must be a string".to_string())),
        }
    }
}

/// Trusts a header injected by an authenticating gateway.
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    /// Read the user id from `header`.
    pub fn new(header: &str) -> ServerResult<Self> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|e| ServerError::Config(format!("Invalid identity header '{}': {}", header, e)))?;
        Ok(Self { header })
    }
}

impl IdentityProvider for HeaderIdentity {
    fn identify(&self, headers: &HeaderMap) -> Result<UserId, IdentityError> {
        let value = headers
            .get(&self.header)
            .ok_or_else(|| IdentityError::Missing(format!("Missing {} header", self.header)))?;
        let value = value
            .to_str()
            .map_err(|_| IdentityError::Invalid(format!("Malformed {} header", self.header)))?
            .trim();
        if value.is_empty() {
            return Err(IdentityError::Missing(format!("Empty {} header", self.header)));
        }
        Ok(UserId::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn token(sub: Value, exp_offset: i64, secret: &str) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let claims = json!({ "sub": sub, "exp": now + exp_offset });
        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_jwt_string_subject() {
        let identity = JwtIdentity::new(SECRET);
        let headers = bearer(&token(json!("17"), 3600, SECRET));
        assert_eq!(identity.identify(&headers).unwrap(), UserId::from(17));
    }

    #[test]
    fn test_jwt_numeric_subject() {
        let identity = JwtIdentity::new(SECRET);
        let headers = bearer(&token(json!(17), 3600, SECRET));
        assert_eq!(identity.identify(&headers).unwrap(), UserId::from("17"));
    }

    #[test]
    fn test_jwt_missing_header() {
        let err = JwtIdentity::new(SECRET).identify(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, IdentityError::Missing(_)));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_jwt_expired() {
        let identity = JwtIdentity::new(SECRET);
        let headers = bearer(&token(json!("1"), -3600, SECRET));
        assert!(matches!(identity.identify(&headers), Err(IdentityError::Expired)));
    }

    #[test]
    fn test_jwt_wrong_secret_is_invalid() {
        let identity = JwtIdentity::new(SECRET);
        let headers = bearer(&token(json!("1"), 3600, "other-secret"));
        let err = identity.identify(&headers).unwrap_err();
        assert!(matches!(err, IdentityError::Invalid(_)));
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_jwt_garbage_token_is_invalid() {
        let identity = JwtIdentity::new(SECRET);
        let err = identity.identify(&bearer("not.a.token")).unwrap_err();
        assert!(matches!(err, IdentityError::Invalid(_)));
    }

    #[test]
    fn test_header_identity() {
        let identity = HeaderIdentity::new("x-user-id").unwrap();
        let mut headers = HeaderMap::new();
        assert!(matches!(identity.identify(&headers), Err(IdentityError::Missing(_))));

        headers.insert("x-user-id", HeaderValue::from_static("alice"));
        assert_eq!(identity.identify(&headers).unwrap(), UserId::from("alice"));
    }

    #[test]
    fn test_header_identity_rejects_bad_name() {
        assert!(matches!(
            HeaderIdentity::new("bad header"),
            Err(ServerError::Config(_))
        ));
    }
}
