//! Caller identity.
//!
//! Authentication lives in front of this service; it forwards the
//! authenticated user id in `X-User-Id`. No header means an anonymous
//! caller.

use crate::{
    errors::AppError,
    models::file::{Owner, UserId},
};
use axum::{extract::FromRequestParts, http::request::Parts};

pub const USER_ID_HEADER: &str = "x-user-id";

/// The identity a request is made under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller(pub Owner);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_ID_HEADER) else {
            return Ok(Caller(Owner::Anonymous));
        };

        value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(UserId::new)
            .map(|id| Caller(Owner::User(id)))
            .ok_or_else(|| AppError::bad_request(format!("invalid `{USER_ID_HEADER}` header")))
    }
}
