use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use buildgate_service::error::ErrorBody;
use buildgate_service::GatewayError;

/// An error response of the gateway, carrying the [`GatewayError`] as JSON.
#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: GatewayError,
}

fn status_code(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        GatewayError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
        GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<GatewayError> for ResponseError {
    fn from(err: GatewayError) -> Self {
        Self {
            status: status_code(&err),
            err,
        }
    }
}

impl From<serde_json::Error> for ResponseError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidArgument(format!("Invalid request body: {err}")).into()
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            sentry::capture_error(&self.err);
        }
        let mut response = Json(ErrorBody::from(&self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}
