use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Engine error: {0}")]
    Engine(#[from] engine::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Failed to bind server address: {0}")]
    ServerBindError(std::io::Error),

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

impl From<strategies::Error> for Error {
    fn from(e: strategies::Error) -> Self {
        Error::Engine(engine::Error::Strategy(e))
    }
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Engine(engine::Error::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            Error::Engine(engine::Error::Strategy(strategies::Error::NotFound(_))) => StatusCode::NOT_FOUND,
            Error::Engine(engine::Error::Strategy(strategies::Error::Validation(_))) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Engine(engine::Error::Strategy(strategies::Error::Malformed(_))) => StatusCode::BAD_REQUEST,
            Error::Engine(engine::Error::Link(_)) => StatusCode::BAD_GATEWAY,
            Error::Engine(engine::Error::InvalidTransition { .. }) => StatusCode::CONFLICT,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed.");
        } else {
            tracing::debug!(error = %self, "Request rejected.");
        }

        let body = match &self {
            Error::Engine(engine::Error::Strategy(strategies::Error::Validation(failure))) => json!({
                "error": "validation_failed",
                "strategy_id": failure.strategy_id,
                "fingerprint": failure.fingerprint,
                "issues": failure.issues,
            }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
