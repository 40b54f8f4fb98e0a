//! Trust boundary with the authenticating gateway.
//!
//! Every request past `/` must carry the shared gateway token in `Authorization` along with the
//! principal the gateway authenticated (`X-Principal-Id`, `X-Principal-Role`). The principal is
//! stashed in the request extensions for handlers to extract.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::header::AUTHORIZATION;
use http::request::Parts;
use http::{HeaderMap, StatusCode};

use crate::api::server::{AppState, RouteError};
use crate::constants::{PRINCIPAL_ID_HEADER, PRINCIPAL_ROLE_HEADER};
use crate::db::models::user::{Principal, Role, UserId};
use crate::util::constant_time_cmp;

pub async fn verify_gateway(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, RouteError> {
    let principal = {
        let headers = req.headers();
        let presented = header(headers, AUTHORIZATION.as_str())?;
        let presented = presented.strip_prefix("Bearer ").unwrap_or(presented);

        if !constant_time_cmp(presented, &state.gateway_token) {
            tracing::debug!("rejected request with invalid gateway token");
            return Err(RouteError::AuthError(StatusCode::UNAUTHORIZED));
        }

        principal_from_headers(headers)?
    };

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Result<&'h str, RouteError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(RouteError::AuthError(StatusCode::UNAUTHORIZED))
}

fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, RouteError> {
    let user_id = header(headers, PRINCIPAL_ID_HEADER)?
        .parse::<UserId>()
        .map_err(|_| RouteError::AuthError(StatusCode::UNAUTHORIZED))?;
    let role = header(headers, PRINCIPAL_ROLE_HEADER)?
        .parse::<Role>()
        .map_err(|_| RouteError::AuthError(StatusCode::UNAUTHORIZED))?;

    Ok(Principal::new(user_id, role))
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = RouteError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .copied()
            .ok_or(RouteError::AuthError(StatusCode::UNAUTHORIZED))
    }
}
