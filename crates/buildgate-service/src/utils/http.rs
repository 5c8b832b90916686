use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::ErrorBody;
use crate::GatewayError;

/// The user agent sent to remote decision services and backends.
pub const USER_AGENT: &str = concat!("buildgate/", env!("CARGO_PKG_VERSION"));

/// Error responses longer than this are truncated before they are turned into messages.
const MAX_ERROR_BODY: usize = 512;

/// Creates a [`reqwest::Client`] shared by all remote services.
///
/// The client only limits the time to connect. Unary calls set their own timeout on each
/// request, as the responses of streaming calls may take arbitrarily long.
pub fn create_client(connect_timeout: Duration) -> reqwest::Result<Client> {
    reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// Returns the URL of the endpoint `name` below `base`, regardless of whether `base` ends in a
/// slash.
pub fn endpoint(base: &Url, name: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty();
        for segment in name.split('/') {
            segments.push(segment);
        }
    }
    url
}

/// Sends `request`, giving up as soon as `cancel` fires.
///
/// Responses with an unsuccessful status code are turned into errors.
pub async fn send(
    cancel: &CancellationToken,
    request: RequestBuilder,
) -> Result<Response, GatewayError> {
    let response = tokio::select! {
        response = request.send() => response.map_err(transport_error)?,
        _ = cancel.cancelled() => {
            return Err(GatewayError::Cancelled("Request cancelled".into()));
        }
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.bytes().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Converts a failure to perform a request into an error.
pub fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Unavailable(format!("Request timed out: {err}"))
    } else if err.is_decode() {
        GatewayError::Internal(format!("Invalid response body: {err}"))
    } else {
        GatewayError::Unavailable(err.to_string())
    }
}

/// Converts an unsuccessful response into an error.
///
/// Bodies in the error format of the gateway are passed through unchanged. Otherwise the kind of
/// the error is derived from the status code.
pub fn status_error(status: StatusCode, body: &[u8]) -> GatewayError {
    if let Some(error) = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(ErrorBody::into_error)
    {
        return error;
    }

    let body = String::from_utf8_lossy(&body[..body.len().min(MAX_ERROR_BODY)]);
    let message = match body.trim() {
        "" => status.to_string(),
        body => format!("{status}: {body}"),
    };

    match status {
        StatusCode::BAD_REQUEST => GatewayError::InvalidArgument(message),
        StatusCode::UNAUTHORIZED => GatewayError::Unauthenticated(message),
        StatusCode::FORBIDDEN => GatewayError::PermissionDenied(message),
        StatusCode::NOT_FOUND => GatewayError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT => GatewayError::Cancelled(message),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => GatewayError::Unavailable(message),
        _ => GatewayError::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let base = Url::parse("http://auth.internal:8080").unwrap();
        assert_eq!(
            endpoint(&base, "authenticate").as_str(),
            "http://auth.internal:8080/authenticate"
        );

        let base = Url::parse("http://auth.internal/v1/").unwrap();
        assert_eq!(
            endpoint(&base, "authorize").as_str(),
            "http://auth.internal/v1/authorize"
        );

        let base = Url::parse("http://scheduler/api").unwrap();
        assert_eq!(
            endpoint(&base, "operations/wait").as_str(),
            "http://scheduler/api/operations/wait"
        );
    }

    #[test]
    fn test_status_error() {
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, b""),
            GatewayError::NotFound("404 Not Found".into())
        );
        assert_eq!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, b"  overloaded\n"),
            GatewayError::Unavailable("503 Service Unavailable: overloaded".into())
        );
        assert_eq!(
            status_error(StatusCode::IM_A_TEAPOT, b""),
            GatewayError::Internal("418 I'm a teapot".into())
        );
    }

    #[test]
    fn test_error_body_passes_through() {
        let body = br#"{"code": "permission_denied", "message": "Not allowed"}"#;
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, body),
            GatewayError::PermissionDenied("Not allowed".into())
        );

        // Unknown codes fall back to the status code.
        let body = br#"{"code": "teapot", "message": "Short and stout"}"#;
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, body),
            GatewayError::Unavailable(_)
        ));
    }
}
