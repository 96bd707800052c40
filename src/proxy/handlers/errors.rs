//! Gateway errors rendered in each protocol's native error JSON.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::proxy::orchestrator::GatewayError;

fn status_of(err: &GatewayError) -> StatusCode {
    StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn openai_error(err: &GatewayError) -> Response {
    let error_type = match err {
        GatewayError::BadRequest(_)
        | GatewayError::ContentLengthExceeded
        | GatewayError::UnsupportedFeature(_) => "invalid_request_error",
        GatewayError::RateLimitedAllAccounts => "rate_limit_error",
        _ => "api_error",
    };
    (
        status_of(err),
        Json(json!({
            "error": {
                "message": err.message(),
                "type": error_type,
                "code": err.kind_str(),
            }
        })),
    )
        .into_response()
}

pub fn claude_error(err: &GatewayError) -> Response {
    let error_type = match err {
        GatewayError::BadRequest(_)
        | GatewayError::ContentLengthExceeded
        | GatewayError::UnsupportedFeature(_) => "invalid_request_error",
        GatewayError::RateLimitedAllAccounts => "rate_limit_error",
        GatewayError::NoAccountAvailable => "overloaded_error",
        GatewayError::AuthenticationFailed => "authentication_error",
        _ => "api_error",
    };
    (
        status_of(err),
        Json(json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": err.message(),
            }
        })),
    )
        .into_response()
}

pub fn gemini_error(err: &GatewayError) -> Response {
    let status_name = match err {
        GatewayError::BadRequest(_)
        | GatewayError::ContentLengthExceeded
        | GatewayError::UnsupportedFeature(_) => "INVALID_ARGUMENT",
        GatewayError::RateLimitedAllAccounts => "RESOURCE_EXHAUSTED",
        GatewayError::NoAccountAvailable | GatewayError::UpstreamUnavailable(_) => "UNAVAILABLE",
        GatewayError::AuthenticationFailed => "PERMISSION_DENIED",
        GatewayError::Internal(_) => "INTERNAL",
    };
    (
        status_of(err),
        Json(json!({
            "error": {
                "code": err.http_status(),
                "message": err.message(),
                "status": status_name,
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_track_error_kinds() {
        assert_eq!(
            status_of(&GatewayError::RateLimitedAllAccounts),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(&GatewayError::BadRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&GatewayError::NoAccountAvailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
