// =============================================================================
// Admin Auth Guard — bearer-token gate for the non-public surface
// =============================================================================
//
// The expected token comes from `NEXUS_ADMIN_TOKEN`. A request is admitted
// only when its `Authorization` header carries a bearer token matching it;
// a missing header is 401, a wrong token (or an unprovisioned server) is
// 403. The WebSocket upgrade cannot use the extractor and calls
// `token_matches` on its query parameter instead.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const TOKEN_ENV: &str = "NEXUS_ADMIN_TOKEN";

/// Outcome of checking a presented token against the configured one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenCheck {
    Admitted,
    NotProvisioned,
    Missing,
    Rejected,
}

/// Timing-stable comparison: fold XOR over `max(len)` positions, treating
/// absent bytes as zero, and mix the length difference into the
/// accumulator. Work done is independent of where the first mismatch sits.
fn tokens_equal(presented: &str, expected: &str) -> bool {
    let a = presented.as_bytes();
    let b = expected.as_bytes();
    let width = a.len().max(b.len());
    let mut acc = (a.len() ^ b.len()) as u8;
    for i in 0..width {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        acc |= x ^ y;
    }
    acc == 0
}

/// Pull the bearer token out of an `Authorization` header value, accepting
/// any case for the scheme.
fn bearer_of(header: &str) -> Option<&str> {
    let (scheme, rest) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

fn check(presented: Option<&str>) -> TokenCheck {
    let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
    if expected.is_empty() {
        return TokenCheck::NotProvisioned;
    }
    match presented {
        None => TokenCheck::Missing,
        Some(token) if tokens_equal(token, &expected) => TokenCheck::Admitted,
        Some(_) => TokenCheck::Rejected,
    }
}

/// Query-parameter path used by the WebSocket upgrade.
pub fn token_matches(token: &str) -> bool {
    check(Some(token)) == TokenCheck::Admitted
}

/// Extractor guarding a route; carries no data, admission is the point.
pub struct AdminGuard;

pub struct AuthDenied(StatusCode, &'static str);

impl IntoResponse for AuthDenied {
    fn into_response(self) -> Response {
        let AuthDenied(status, detail) = self;
        (status, axum::Json(serde_json::json!({ "error": detail }))).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminGuard
where
    S: Send + Sync,
{
    type Rejection = AuthDenied;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_of);

        match check(presented) {
            TokenCheck::Admitted => Ok(AdminGuard),
            TokenCheck::Missing => {
                Err(AuthDenied(StatusCode::UNAUTHORIZED, "admin token required"))
            }
            TokenCheck::Rejected => {
                warn!("admin token rejected");
                Err(AuthDenied(StatusCode::FORBIDDEN, "admin token rejected"))
            }
            TokenCheck::NotProvisioned => {
                warn!("{TOKEN_ENV} is unset; refusing authenticated request");
                Err(AuthDenied(
                    StatusCode::FORBIDDEN,
                    "admin token not provisioned on this server",
                ))
            }
        }
    }
}
