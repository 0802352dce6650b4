use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde_json::{Value, json};
use uuid::Uuid;

use super::routes::ServerState;

/// Random bearer token shared with the remote execution through test headers.
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[derive(Clone)]
pub struct CallbackAuth {
    token: String,
}

impl CallbackAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn authorize(&self, header: Option<&str>) -> Result<(), StatusCode> {
        let bearer = header
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(StatusCode::UNAUTHORIZED)?;
        if constant_time_eq(bearer.as_bytes(), self.token.as_bytes()) {
            Ok(())
        } else {
            Err(StatusCode::FORBIDDEN)
        }
    }
}

/// Extractor that admits only requests carrying the callback bearer token.
pub struct CallbackGuard;

impl<S> FromRequestParts<S> for CallbackGuard
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth = parts
            .extensions
            .get::<ServerState>()
            .map(|state| state.auth.clone())
            .ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "server state unavailable" })),
            ))?;
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        auth.authorize(header).map_err(|status| {
            (
                status,
                Json(json!({
                    "success": false,
                    "error": if status == StatusCode::UNAUTHORIZED {
                        "Missing or malformed Authorization header"
                    } else {
                        "Invalid token"
                    }
                })),
            )
        })?;
        Ok(CallbackGuard)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (&left, &right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_malformed_header_is_unauthorized() {
        let auth = CallbackAuth::new("secret");
        assert_eq!(auth.authorize(None), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(auth.authorize(Some("secret")), Err(StatusCode::UNAUTHORIZED));
        assert_eq!(auth.authorize(Some("Bearer ")), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn wrong_token_is_forbidden() {
        let auth = CallbackAuth::new("secret");
        assert_eq!(auth.authorize(Some("Bearer nope")), Err(StatusCode::FORBIDDEN));
        assert!(auth.authorize(Some("Bearer secret")).is_ok());
    }

    #[test]
    fn generated_tokens_are_long_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
