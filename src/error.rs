//! Error-to-response mapping for the request dispatcher.
//!
//! Known failures become an HTTP status plus a short plain-text body; internal
//! detail stays in the logs.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Response body type shared by every handler in the crate.
pub type GateBody = BoxBody<Bytes, hyper::Error>;

/// The closed set of dispatcher-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// No service matches the request host
    RouteUnknown,
    /// Client IP denied by the allow/block lists
    IpForbidden,
    /// Backend child could not be spawned or never became ready
    ServiceStartFailed,
    /// The backend answered the connection with an error
    UpstreamError,
    /// Tunnel traffic before the tunnel ever opened
    TunnelNotOpen,
    /// Tunnel socket dial or relay failure
    TunnelBroken,
}

impl GateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::RouteUnknown => StatusCode::NOT_FOUND,
            GateError::IpForbidden => StatusCode::FORBIDDEN,
            GateError::ServiceStartFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::UpstreamError => StatusCode::BAD_GATEWAY,
            GateError::TunnelNotOpen => StatusCode::SERVICE_UNAVAILABLE,
            GateError::TunnelBroken => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Wrap a full byte body into the shared boxed body type.
pub fn full_body(body: impl Into<Bytes>) -> GateBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Build the plain-text response for a dispatcher failure.
pub fn error_response(error: GateError, message: impl Into<String>) -> Response<GateBody> {
    Response::builder()
        .status(error.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GateError::RouteUnknown.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(GateError::IpForbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            GateError::ServiceStartFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(GateError::UpstreamError.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GateError::TunnelNotOpen.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_response_body() {
        let resp = error_response(GateError::RouteUnknown, "Service not found");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
