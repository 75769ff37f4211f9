use application::{ApplicationError, BrokerError, IdentityError, RegistryError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::{DomainError, RepositoryError};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<IdentityError> for ApiError {
    fn from(error: IdentityError) -> Self {
        ApiError::unauthorized(error.to_string())
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use application::ApplicationError as AppErr;

        match error {
            AppErr::Domain(err @ DomainError::NotChatMember { .. }) => {
                ApiError::new(StatusCode::FORBIDDEN, "NOT_CHAT_MEMBER", err.to_string())
            }
            AppErr::Domain(err @ DomainError::UnknownSender(_)) => {
                ApiError::new(StatusCode::NOT_FOUND, "USER_NOT_FOUND", err.to_string())
            }
            AppErr::Domain(err) => {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", err.to_string())
            }
            AppErr::Repository(RepositoryError::NotFound) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "requested resource not found",
            ),
            AppErr::Repository(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                format!("database error: {}", err),
            ),
            AppErr::Broker(err @ BrokerError::Timeout { .. }) => {
                ApiError::new(StatusCode::GATEWAY_TIMEOUT, "BROKER_TIMEOUT", err.to_string())
            }
            AppErr::Broker(err) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "BROKER_ERROR",
                format!("broker error: {}", err),
            ),
            AppErr::FanOut(err) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "FAN_OUT_ERROR",
                err.to_string(),
            ),
            AppErr::Registry(err @ RegistryError::NotConnected(_)) => {
                ApiError::new(StatusCode::NOT_FOUND, "NOT_CONNECTED", err.to_string())
            }
            AppErr::Registry(err) => ApiError::internal_server_error(err.to_string()),
            AppErr::Authentication(err) => err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
