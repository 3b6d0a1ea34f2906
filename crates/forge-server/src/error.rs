use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use forge::errors::ForgeError;
use serde::Serialize;
use thiserror::Error;

pub const ENV_PREFIX: &str = "FORGE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// The environment variable that sets a dotted settings path
pub(crate) fn to_env_var(field_path: &str) -> String {
    format!(
        "{}_{}",
        ENV_PREFIX,
        field_path.replace('.', "__").to_uppercase()
    )
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A route failure rendered as a JSON body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new<M: Into<String>>(status: StatusCode, message: M) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ForgeError> for ApiError {
    fn from(err: ForgeError) -> Self {
        let status = match &err {
            ForgeError::Configuration(_) => StatusCode::BAD_REQUEST,
            ForgeError::Credential(_) => StatusCode::UNAUTHORIZED,
            ForgeError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
