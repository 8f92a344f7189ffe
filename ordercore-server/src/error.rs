//! HTTP mapping of engine errors.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ordercore::errors::{ReservationError, StoreError, WebhookError};
use serde::Serialize;

/// An error response: status code plus a JSON body with a stable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

impl ApiError {
    /// Creates an error response.
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// 400 Bad Request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// 404 Not Found.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Status code of the response.
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine readable error code.
    pub const fn code(&self) -> &'static str {
        self.code
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = %self.status,
                code = self.code,
                message = %self.message,
                "Request failed"
            );
        }
        let body = ErrorBody {
            code: self.code,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(key) => Self::not_found(format!("{key} not found")),
            StoreError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", error.to_string())
            }
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", other.to_string()),
        }
    }
}

impl From<ReservationError> for ApiError {
    fn from(error: ReservationError) -> Self {
        let message = error.to_string();
        match error {
            ReservationError::InvalidInput(_) => Self::new(StatusCode::BAD_REQUEST, "INVALID_INPUT", message),
            ReservationError::OutOfStock { .. } => Self::new(StatusCode::CONFLICT, "OUT_OF_STOCK", message),
            ReservationError::Contention { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "CONTENTION", message)
            }
            ReservationError::Internal(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(error: WebhookError) -> Self {
        if error.is_client_error() {
            Self::bad_request(error.to_string())
        } else {
            Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordercore::types::ProductId;

    #[test]
    fn reservation_errors_map_to_distinct_statuses() {
        let cases = [
            (ReservationError::InvalidInput("empty".into()), StatusCode::BAD_REQUEST),
            (
                ReservationError::OutOfStock {
                    product_id: ProductId::try_new("sku").unwrap(),
                    requested: 2,
                    available: 1,
                },
                StatusCode::CONFLICT,
            ),
            (ReservationError::Contention { attempts: 5 }, StatusCode::SERVICE_UNAVAILABLE),
            (
                ReservationError::Internal(StoreError::Internal("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn webhook_rejections_are_client_errors() {
        let rejected = ApiError::from(WebhookError::Rejected("missing status".into()));
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        let failed = ApiError::from(WebhookError::Failed(StoreError::Unavailable("down".into())));
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failed.code(), "INTERNAL");
    }
}
