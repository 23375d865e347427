//! Router error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use nimbus_core::Outcome;

/// A request the router answers itself, without reaching a tenant.
///
/// The display text is the exact body sent to the visitor, so it never
/// carries internal detail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("malformed host")]
    MalformedHost,

    #[error("site not found")]
    SiteNotFound,

    #[error("not found")]
    FileNotFound,

    #[error("bad request path")]
    BadPath,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("request body too large")]
    BodyTooLarge,

    #[error("internal error")]
    Internal,
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::MalformedHost | RouteError::BadPath => StatusCode::BAD_REQUEST,
            RouteError::SiteNotFound | RouteError::FileNotFound => StatusCode::NOT_FOUND,
            RouteError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RouteError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RouteError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Activity outcome when the request ends here outside the static branch.
    pub fn outcome(&self) -> Outcome {
        match self {
            RouteError::MalformedHost | RouteError::BadPath | RouteError::BodyTooLarge => {
                Outcome::BadRequest
            }
            RouteError::SiteNotFound | RouteError::FileNotFound => Outcome::NotFound,
            RouteError::MethodNotAllowed => Outcome::BadRequest,
            RouteError::Internal => Outcome::Error,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_string()).into_response();
        if self == RouteError::MethodNotAllowed {
            response.headers_mut().insert(
                axum::http::header::ALLOW,
                axum::http::HeaderValue::from_static("GET, HEAD"),
            );
        }
        response
    }
}

pub type RouteResult<T> = Result<T, RouteError>;
