use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use tracing::debug;

use crate::responses::JsonResponse;
use crate::utils::jwt::{decode_jwt, JwtKeyProvider};

/// The authenticated caller of a billing callable.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: JwtKeyProvider + Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| {
                    JsonResponse::unauthorized("Authentication required").into_response()
                })?;

        let data = decode_jwt(
            bearer.token(),
            state.jwt_keys(),
            state.jwt_issuer(),
            state.jwt_audience(),
        )
        .map_err(|err| {
            debug!(?err, "rejected bearer token");
            JsonResponse::unauthorized("Invalid or expired token").into_response()
        })?;

        Ok(AuthUser {
            user_id: data.claims.sub,
            email: data.claims.email.filter(|e| !e.trim().is_empty()),
        })
    }
}
