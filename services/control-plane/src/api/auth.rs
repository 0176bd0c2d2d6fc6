//! Bearer-token authentication middleware.
//!
//! With `security.enable_jwt` the token is validated as an HS256 JWT and the
//! organization claim scopes list queries. Otherwise a static `api_token` is
//! compared when configured; with neither set, any non-empty token is
//! accepted (development mode).

use super::{ApiError, AppState};
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use obsidianprotection_common::config::SecurityConfig;
use obsidianprotection_common::error::{Error, Result};
use serde::Deserialize;

/// Authenticated caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub organization: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    org: Option<String>,
    #[allow(dead_code)]
    exp: i64,
}

pub async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    match authorize(&state.config.security, header.as_deref()) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// Validate the Authorization header value and derive the caller identity.
pub fn authorize(security: &SecurityConfig, header: Option<&str>) -> Result<Identity> {
    let header = header.ok_or_else(|| Error::unauthorized("Authorization header required"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| Error::unauthorized("Bearer token required"))?;
    if token.is_empty() {
        return Err(Error::unauthorized("Empty bearer token"));
    }

    if security.enable_jwt {
        let key = DecodingKey::from_secret(security.jwt_secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| Error::unauthorized(format!("Invalid token: {e}")))?;
        return Ok(Identity {
            subject: data.claims.sub,
            organization: data.claims.org.unwrap_or_else(|| "default".to_string()),
        });
    }

    if let Some(expected) = &security.api_token {
        if token != expected {
            return Err(Error::unauthorized("Invalid token"));
        }
    }

    Ok(Identity {
        subject: "operator".to_string(),
        organization: "default".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        org: String,
        exp: i64,
    }

    fn jwt_config(secret: &str) -> SecurityConfig {
        SecurityConfig {
            enable_jwt: true,
            jwt_secret: secret.to_string(),
            ..SecurityConfig::default()
        }
    }

    #[test]
    fn missing_header_is_unauthorized() {
        let security = SecurityConfig::default();
        assert!(authorize(&security, None).is_err());
        assert!(authorize(&security, Some("Basic abc")).is_err());
        assert!(authorize(&security, Some("Bearer ")).is_err());
    }

    #[test]
    fn dev_mode_accepts_any_token() {
        let security = SecurityConfig::default();
        let identity = authorize(&security, Some("Bearer anything")).unwrap();
        assert_eq!(identity.organization, "default");
    }

    #[test]
    fn static_token_must_match() {
        let security = SecurityConfig {
            api_token: Some("sekrit".to_string()),
            ..SecurityConfig::default()
        };
        assert!(authorize(&security, Some("Bearer wrong")).is_err());
        assert!(authorize(&security, Some("Bearer sekrit")).is_ok());
    }

    #[test]
    fn jwt_round_trip() {
        let security = jwt_config("test-secret");
        let token = encode(
            &Header::default(),
            &TestClaims {
                sub: "user-1".into(),
                org: "org-9".into(),
                exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
            },
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        let identity = authorize(&security, Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(identity.subject, "user-1");
        assert_eq!(identity.organization, "org-9");
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let security = jwt_config("test-secret");
        let token = encode(
            &Header::default(),
            &TestClaims {
                sub: "user-1".into(),
                org: "org-9".into(),
                exp: (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp(),
            },
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(authorize(&security, Some(&format!("Bearer {token}"))).is_err());
    }

    #[test]
    fn jwt_with_wrong_secret_is_rejected() {
        let security = jwt_config("right-secret");
        let token = encode(
            &Header::default(),
            &TestClaims {
                sub: "user-1".into(),
                org: "org".into(),
                exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
            },
            &EncodingKey::from_secret(b"wrong-secret"),
        )
        .unwrap();
        assert!(authorize(&security, Some(&format!("Bearer {token}"))).is_err());
    }
}
