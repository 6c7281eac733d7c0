//! Bearer token authentication for upstream listeners

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use relaymesh_auth::{EndpointToken, Verifier};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::warn;

use crate::error::{error_response, ErrorResponse};

/// Per-request context for the listener route
#[derive(Debug, Clone, Default)]
pub struct ListenerContext {
    /// Set when the request carried a verified token
    pub token: Option<EndpointToken>,
}

impl<S: Send + Sync> FromRequestParts<S> for ListenerContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self {
            token: parts.extensions.get::<EndpointToken>().cloned(),
        })
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Verifies the bearer token and attaches the result to the request
///
/// Returns 401 Unauthorized if the token is missing, malformed, or expired.
pub async fn require_token(
    State(verifier): State<Arc<dyn Verifier>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(raw) = bearer_token(request.headers()).map(str::to_owned) else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            ErrorResponse::new("missing token").with_code("MISSING_AUTH"),
        );
    };

    match verifier.verify(&raw).await {
        Ok(token) => {
            request.extensions_mut().insert(token);
            next.run(request).await
        }
        Err(e) => {
            warn!("Rejected upstream token: {}", e);
            error_response(
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("invalid token").with_code("INVALID_TOKEN"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
