//! Bearer token authentication.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{envelope::ApiError, AppState};

/// Who made the request. Recorded as the audit actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    pub role: String,
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Reject requests without a configured token; attach the [`Principal`]
/// otherwise.
pub(crate) async fn require_token(State(state): State<AppState>, mut req: Request<Body>, next: Next) -> Response {
    let principal = extract_bearer(req.headers()).and_then(|token| {
        state
            .config
            .api_tokens
            .iter()
            .find(|t| t.token == token)
            .map(|t| Principal {
                user: t.user.clone(),
                role: t.role.clone(),
            })
    });

    match principal {
        Some(principal) => {
            tracing::debug!(
                "API: {} ({}) {} {}",
                principal.user,
                principal.role,
                req.method(),
                req.uri().path()
            );
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        None => {
            tracing::debug!("API: rejected unauthenticated {} {}", req.method(), req.uri().path());
            ApiError::unauthorized().into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer(&headers), Some("abc123"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer   xyz "));
        assert_eq!(extract_bearer(&headers), Some("xyz"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer(&headers), None);
    }
}
